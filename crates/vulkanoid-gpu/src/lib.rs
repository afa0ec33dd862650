//! GPU resource lifecycle for the Vulkanoid renderer.
//!
//! This crate provides:
//! - Vulkan instance, device and swapchain management
//! - Deferred teardown through LIFO deletion queues
//! - A ring of frames in flight, throttled on per-slot fences
//! - A bindless descriptor table with a fallback at handle 0
//! - Blocking one-shot submissions for uploads
//! - [`ResourceManager`], which ties these together
//!
//! Everything above the Vulkan calls is written against [`GpuBackend`] and
//! [`Presenter`], so it can be driven without a device (see the `mock` feature).

pub mod backend;
pub mod bindless;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod deletion;
pub mod descriptors;
pub mod error;
pub mod frame;
pub mod immediate;
pub mod instance;
pub mod manager;
pub mod memory;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod present;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod uniform;

pub use backend::{
    BindlessDescriptorKind, BindlessLayoutDesc, CommandContext, DescriptorWrite, GpuBackend,
    ResourceBinding, SubmitDesc,
};
pub use bindless::{BindlessHandle, BindlessTable};
pub use capabilities::{DescriptorIndexingSupport, GpuCapabilities, GpuVendor};
pub use context::{GpuContext, GpuContextBuilder};
pub use deletion::{DeletionQueue, Teardown};
pub use error::{GpuError, Result, Severity};
pub use frame::{AcquiredFrame, FrameRing, SlotState};
pub use immediate::ImmediateSubmitter;
pub use manager::{abort_on_fatal, ActiveFrame, ResourceManager, ResourceManagerConfig};
pub use memory::{GpuAllocator, GpuBuffer, GpuImage, SharedAllocator};
pub use present::{AcquiredImage, PresentOutcome, Presenter};
pub use surface::{SurfaceCapabilities, SurfaceContext, SwapchainConfig};
pub use swapchain::{Swapchain, SwapchainPresenter};
pub use uniform::FrameUniforms;
