//! shard-render: per-frame render graph, GPU scene, and frame orchestrator.
//!
//! Implements C7-C9 of the core rendering runtime on top of shard-gfx's
//! device, memory, and resource primitives (C1-C6).

pub mod graph;
pub mod job;
pub mod orchestrator;
pub mod scene;

pub use graph::{PassBuilder, RenderGraph};
pub use job::JobScheduler;
pub use orchestrator::{AcquiredFrame, FrameOrchestrator};
pub use scene::{BoundingSphere, GpuScene, InstanceRecord, ScatterPipeline, UpdatePacket};
