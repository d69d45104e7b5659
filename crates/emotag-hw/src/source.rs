//! The capture-device seam.

use crate::camera::CameraError;
use crate::frame::Frame;

/// Exclusive owner of a capture device.
///
/// Only the capture thread holds a `FrameSource`; it is `Send` so the pipeline
/// can move between the daemon and that thread across start/stop cycles.
pub trait FrameSource: Send {
    /// Acquire the device. Idempotent while already open.
    fn open(&mut self) -> Result<(), CameraError>;

    /// Block until the next frame is available.
    ///
    /// Errors are transient: the caller skips the iteration and retries.
    fn read_frame(&mut self) -> Result<Frame, CameraError>;

    /// Release the device. Safe to call when already closed.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Human-readable identifier for logs (e.g. the device path).
    fn describe(&self) -> String;
}
