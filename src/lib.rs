pub mod camera;
pub mod config;
pub mod depth;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod framebuffer;
pub mod jitter;
pub mod kernel;
pub mod renderer;
pub mod skip;
pub mod texture;
pub mod transfer;
pub mod volume;

pub use config::{MipMode, RegionOfInterest, RenderConfig, RendererParameter};
pub use depth::DepthPrecision;
pub use device::Device;
pub use error::RenderError;
pub use renderer::{FrameInput, Renderer};
pub use volume::VolumeDescriptor;
