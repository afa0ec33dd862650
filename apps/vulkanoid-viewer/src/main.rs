//! Vulkanoid demo viewer.
//!
//! Clears the swapchain every frame and keeps a checkerboard texture in the bindless
//! table, swapping it for a freshly uploaded one every few seconds. The old handle is
//! retired with the frame that replaced it, so its image is only freed once the GPU
//! is done with that frame.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p vulkanoid-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--frames-in-flight <N>`: Number of frame slots (default: 2)
//! - `--vsync`: Enable vsync
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use vulkanoid_app::{run_app, AppConfig};

use crate::app::{Viewer, ViewerParams};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let params = ViewerParams::from_args();
    run_app::<Viewer>(
        AppConfig::new("Vulkanoid Viewer")
            .with_size(WIDTH, HEIGHT)
            .with_vsync(params.vsync)
            .with_frames_in_flight(params.frames_in_flight),
    )
}

fn print_help() {
    eprintln!(
        "Vulkanoid demo viewer

USAGE:
    cargo run -p vulkanoid-viewer -- [OPTIONS]

OPTIONS:
    --frames-in-flight <N>  Number of frame slots (default: 2)
    --vsync                 Enable vsync
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
