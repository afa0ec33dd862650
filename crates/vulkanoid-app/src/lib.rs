//! Application framework for the Vulkanoid renderer.
//!
//! This crate handles the boilerplate around [`vulkanoid_gpu::ResourceManager`]:
//! - Window creation and management
//! - GPU context initialization
//! - Swapchain creation and recreation
//! - The begin/record/end frame loop
//!
//! # Example
//!
//! ```no_run
//! use vulkanoid_app::{run_app, AppConfig, AppContext, FrameContext, GpuContext, VulkanoidApp};
//!
//! struct MyApp;
//!
//! impl VulkanoidApp for MyApp {
//!     fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn render(&mut self, gpu: &GpuContext, frame: &mut FrameContext<'_>) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod context;
mod frame;
mod runner;

pub use app::VulkanoidApp;
pub use context::AppContext;
pub use frame::FrameContext;
pub use runner::{run_app, AppConfig};

// Re-export commonly used types for convenience
pub use vulkanoid_gpu::{GpuContext, GpuContextBuilder, ResourceManagerConfig};
pub use winit::event::WindowEvent;
