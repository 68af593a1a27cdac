//! Crate-wide error taxonomy.
//!
//! Most failure modes named in the design ("staging belt full", "transient memory
//! exhausted", "bindless out of bounds") are *not* represented here: they are
//! logged and resolved with a sentinel return value at the call site rather than
//! propagated, matching the "destroy closures are best-effort, the orchestrator
//! never throws across component boundaries" policy. `RuntimeError` carries only
//! the genuinely fatal or caller-actionable cases.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("vulkan call failed: {0:?}")]
    Vulkan(#[from] ash::vk::Result),

    #[error("gpu allocation failed: {0}")]
    Allocation(#[from] gpu_alloc::AllocationError),

    #[error("device lost")]
    DeviceLost,

    #[error("swapchain out of date")]
    SwapchainOutOfDate,

    #[error("no suitable physical device found")]
    NoSuitableDevice,

    #[error("staging belt exhausted (requested {requested} bytes, capacity {capacity} bytes)")]
    StagingExhausted { requested: usize, capacity: usize },

    #[error("transient memory exhausted for memory type {memory_type_index}")]
    TransientExhausted { memory_type_index: u32 },

    #[error("descriptor pool exhausted after growth")]
    DescriptorPoolExhausted,

    #[error("slot pool exhausted (capacity {capacity})")]
    SlotsExhausted { capacity: u32 },

    #[error("render graph contains a cycle across {pass_count} passes; falling back to single-layer execution")]
    GraphCycleDetected { pass_count: usize },
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
