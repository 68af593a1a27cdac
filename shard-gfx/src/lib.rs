//! shard-gfx: Vulkan device, memory, and resource layer.
//!
//! Implements C1-C6 of the core rendering runtime: device & lifetime service,
//! transient page allocator, staging belt, transfer manager, bindless table,
//! and texture pool. Consumed by `shard-render`, which builds the per-frame
//! render graph and frame orchestrator (C7-C9) on top of these primitives.

pub mod arena;
pub mod bindless;
pub mod config;
pub mod device;
pub mod error;
pub mod profiler;
pub mod staging;
pub mod swapchain;
pub mod texture_pool;
pub mod transfer;
pub mod transient;

pub use arena::{FrameArena, FrameScope};
pub use bindless::BindlessTable;
pub use config::RuntimeConfig;
pub use device::{Device, QueueFamilyIndices};
pub use error::{Result, RuntimeError};
pub use profiler::GpuProfiler;
pub use staging::{StagingAllocation, StagingBelt};
pub use swapchain::{Swapchain, SwapchainImage};
pub use texture_pool::{TextureGpuData, TextureHandle, TexturePool};
pub use transfer::{TransferManager, TransferToken};
pub use transient::{TransientAllocation, TransientAllocator};
