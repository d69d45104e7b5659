//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameError};
use crate::source::FrameSource;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("device not open")]
    NotOpen,
}

impl From<FrameError> for CameraError {
    fn from(e: FrameError) -> Self {
        CameraError::CaptureFailed(e.to_string())
    }
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// 8-bit grayscale, replicated into RGB.
    Grey,
    /// Packed 24-bit RGB.
    Rgb3,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(PixelFormat::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(PixelFormat::Grey)
        } else if fourcc == FourCC::new(b"RGB3") {
            Some(PixelFormat::Rgb3)
        } else {
            None
        }
    }
}

/// An opened device plus its negotiated geometry.
struct OpenDevice {
    device: Device,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

/// V4L2 camera. Constructed closed; [`FrameSource::open`] acquires the device.
pub struct Camera {
    device_path: String,
    open: Option<OpenDevice>,
}

impl Camera {
    pub fn new(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            open: None,
        }
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Negotiated (width, height, format), if open.
    pub fn geometry(&self) -> Option<(u32, u32, PixelFormat)> {
        self.open
            .as_ref()
            .map(|d| (d.width, d.height, d.pixel_format))
    }

    fn acquire(device_path: &str) -> Result<OpenDevice, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::StreamingNotSupported);
        }

        // Ask for YUYV; most webcams honour it, some fall back to GREY or RGB3.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, GREY, or RGB3)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        Ok(OpenDevice {
            device,
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps
                .capabilities
                .contains(v4l::capability::Flags::VIDEO_CAPTURE)
            {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl FrameSource for Camera {
    fn open(&mut self) -> Result<(), CameraError> {
        if self.open.is_some() {
            return Ok(());
        }
        self.open = Some(Self::acquire(&self.device_path)?);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let dev = self.open.as_ref().ok_or(CameraError::NotOpen)?;

        let mut stream =
            MmapStream::with_buffers(&dev.device, BufType::VideoCapture, STREAM_BUFFERS).map_err(
                |e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")),
            )?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let image = match dev.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, dev.width, dev.height)?,
            PixelFormat::Grey => frame::grey_to_rgb(buf, dev.width, dev.height)?,
            PixelFormat::Rgb3 => frame::rgb24_to_rgb(buf, dev.width, dev.height)?,
        };

        Ok(Frame::new(image, meta.sequence))
    }

    fn close(&mut self) {
        if self.open.take().is_some() {
            tracing::info!(device = %self.device_path, "camera released");
        }
    }

    fn is_open(&self) -> bool {
        self.open.is_some()
    }

    fn describe(&self) -> String {
        self.device_path.clone()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        let mut camera = Camera::new("/dev/emotag-does-not-exist");
        let err = camera.open().unwrap_err();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
        assert!(!camera.is_open());
    }

    #[test]
    fn test_read_before_open() {
        let mut camera = Camera::new("/dev/emotag-does-not-exist");
        assert!(matches!(camera.read_frame(), Err(CameraError::NotOpen)));
    }

    #[test]
    fn test_close_when_closed_is_noop() {
        let mut camera = Camera::new("/dev/video0");
        camera.close();
        camera.close();
        assert!(!camera.is_open());
    }

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"RGB3")), Some(PixelFormat::Rgb3));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), None);
    }
}
