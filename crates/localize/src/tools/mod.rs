pub mod ffmpeg;
pub mod heavy;
pub mod process;

pub use ffmpeg::{AudioToolkit, FfmpegToolkit, NormalizeSpec, PlacedClip};
pub use heavy::{ConvertTool, SeparationTool};
pub use process::{run_tool, ToolOutput};
