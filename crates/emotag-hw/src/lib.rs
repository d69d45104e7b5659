//! emotag-hw: hardware abstraction for frame capture.
//!
//! Defines the [`FrameSource`] seam the capture loop reads from and a
//! V4L2-backed [`Camera`] that delivers RGB frames.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::FrameSource;
