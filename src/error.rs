use thiserror::Error;

/// Failures of the host-side render paths. The kernel itself
/// never reports errors; every failure point sits on the host
/// boundary (device bring-up, allocation, upload), and the
/// orchestrator turns them into a black frame plus a log line.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("render device unavailable: {0}")]
    DeviceUnavailable(&'static str),

    #[error("out of device memory ({requested} bytes requested, {available} available)")]
    OutOfDeviceMemory { requested: u64, available: u64 },

    #[error("unsupported voxel format ({bpc} bytes per channel)")]
    UnsupportedFormat { bpc: u8 },

    #[error("transient device error: {0}")]
    TransientDevice(String),
}
