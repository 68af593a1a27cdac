//! Swapchain wrapper used by the frame orchestrator's acquire/present loop.
//!
//! Not one of C1-C6 in its own right; it is the thin sliver of presentation
//! plumbing C9 needs and that §1 explicitly keeps out of scope for window/
//! surface creation proper (the `vk::SurfaceKHR` itself is handed in by the
//! caller, created via `ash-window` against a `raw-window-handle` target).

use ash::khr;
use ash::vk;

use crate::error::Result;

pub struct SwapchainImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

pub struct Swapchain {
    loader: khr::swapchain::Device,
    surface_loader: khr::surface::Instance,
    surface: vk::SurfaceKHR,
    handle: vk::SwapchainKHR,
    format: vk::Format,
    extent: vk::Extent2D,
    images: Vec<SwapchainImage>,
    device: ash::Device,
}

impl Swapchain {
    pub fn new(
        instance: &ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        requested_extent: vk::Extent2D,
        frames_in_flight: u32,
    ) -> Result<Self> {
        let surface_loader = khr::surface::Instance::new(&ash::Entry::linked(), instance);
        let loader = khr::swapchain::Device::new(instance, &device);
        let (handle, format, extent, images) = create_swapchain(
            &surface_loader,
            &loader,
            &device,
            physical_device,
            surface,
            requested_extent,
            frames_in_flight,
            vk::SwapchainKHR::null(),
        )?;

        Ok(Swapchain { loader, surface_loader, surface, handle, format, extent, images, device })
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image(&self, index: u32) -> &SwapchainImage {
        &self.images[index as usize]
    }

    pub fn loader(&self) -> &khr::swapchain::Device {
        &self.loader
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    /// Returns `Ok(None)` when the swapchain is out of date and must be
    /// recreated via [`Swapchain::recreate`] before trying again.
    pub fn acquire_next_image(&self, signal_semaphore: vk::Semaphore) -> Result<Option<u32>> {
        match unsafe {
            self.loader
                .acquire_next_image(self.handle, u64::MAX, signal_semaphore, vk::Fence::null())
        } {
            Ok((index, _suboptimal)) => Ok(Some(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn recreate(&mut self, physical_device: vk::PhysicalDevice, requested_extent: vk::Extent2D, frames_in_flight: u32) -> Result<()> {
        unsafe { let _ = self.device.device_wait_idle(); }
        self.destroy_views();
        let old = self.handle;
        let (handle, format, extent, images) = create_swapchain(
            &self.surface_loader,
            &self.loader,
            &self.device,
            physical_device,
            self.surface,
            requested_extent,
            frames_in_flight,
            old,
        )?;
        unsafe { self.loader.destroy_swapchain(old, None) };
        self.handle = handle;
        self.format = format;
        self.extent = extent;
        self.images = images;
        Ok(())
    }

    fn destroy_views(&mut self) {
        for image in self.images.drain(..) {
            unsafe { self.device.destroy_image_view(image.view, None) };
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_views();
        unsafe {
            self.loader.destroy_swapchain(self.handle, None);
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn create_swapchain(
    surface_loader: &khr::surface::Instance,
    loader: &khr::swapchain::Device,
    device: &ash::Device,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    requested_extent: vk::Extent2D,
    frames_in_flight: u32,
    old_swapchain: vk::SwapchainKHR,
) -> Result<(vk::SwapchainKHR, vk::Format, vk::Extent2D, Vec<SwapchainImage>)> {
    let capabilities = unsafe { surface_loader.get_physical_device_surface_capabilities(physical_device, surface) }?;
    let formats = unsafe { surface_loader.get_physical_device_surface_formats(physical_device, surface) }?;
    let chosen = formats
        .iter()
        .find(|f| f.format == vk::Format::B8G8R8A8_UNORM && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .copied()
        .unwrap_or(formats[0]);

    let extent = if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: requested_extent.width.clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
            height: requested_extent.height.clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
        }
    };

    let min_count = (frames_in_flight + 1).max(capabilities.min_image_count);
    let image_count = if capabilities.max_image_count > 0 { min_count.min(capabilities.max_image_count) } else { min_count };

    let create_info = vk::SwapchainCreateInfoKHR::default()
        .surface(surface)
        .min_image_count(image_count)
        .image_format(chosen.format)
        .image_color_space(chosen.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(capabilities.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(vk::PresentModeKHR::FIFO)
        .clipped(true)
        .old_swapchain(old_swapchain);

    let handle = unsafe { loader.create_swapchain(&create_info, None) }?;
    let raw_images = unsafe { loader.get_swapchain_images(handle) }?;

    let mut images = Vec::with_capacity(raw_images.len());
    for image in raw_images {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(chosen.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe { device.create_image_view(&view_info, None) }?;
        images.push(SwapchainImage { image, view });
    }

    Ok((handle, chosen.format, extent, images))
}
