//! USB camera frame source.
//!
//! This module provides `V4l2Source` for UVC eye cameras exposed as V4L2 devices.
//!
//! The V4L2 source is responsible for:
//! - Resolving a device index ("2") or node ("/dev/video2")
//! - Negotiating a capture format (MJPEG preferred, YUYV/GREY/RGB3 accepted)
//! - Normalizing captured buffers into `RawFrame` instances
//!
//! `stub://` device names produce synthetic eye frames and need no hardware.

use anyhow::Result;
#[cfg(feature = "ingest-v4l2")]
use anyhow::{anyhow, Context};
#[cfg(feature = "ingest-v4l2")]
use ouroboros::self_referencing;
use std::time::{Duration, Instant};

use super::capture::{FrameSource, SourceStats};
#[cfg(feature = "ingest-v4l2")]
use super::normalize::{normalize_pixels, Geometry, PixelFormat};
use super::synthetic::{frame_interval, SyntheticEye};
use crate::frame::RawFrame;

/// Configuration for a V4L2 source.
#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device index ("0"), node ("/dev/video0"), or "stub://<name>".
    pub device: String,
    /// Requested frame rate.
    pub target_fps: u32,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            target_fps: 60,
            width: 240,
            height: 240,
        }
    }
}

/// Map a bare camera index to its device node.
pub fn device_path(device: &str) -> String {
    if !device.is_empty() && device.chars().all(|c| c.is_ascii_digit()) {
        format!("/dev/video{}", device)
    } else {
        device.to_string()
    }
}

/// V4L2 frame source.
///
/// Uses libv4l for real devices, with a synthetic fallback for `stub://` paths.
pub struct V4l2Source {
    id: String,
    backend: V4l2Backend,
}

enum V4l2Backend {
    Synthetic(SyntheticV4l2Source),
    #[cfg(feature = "ingest-v4l2")]
    Device(DeviceV4l2Source),
}

impl V4l2Source {
    pub fn new(id: impl Into<String>, config: V4l2Config) -> Result<Self> {
        let id = id.into();
        if config.device.starts_with("stub://") {
            return Ok(Self {
                id,
                backend: V4l2Backend::Synthetic(SyntheticV4l2Source::new(config)),
            });
        }
        #[cfg(feature = "ingest-v4l2")]
        {
            Ok(Self {
                id,
                backend: V4l2Backend::Device(DeviceV4l2Source::new(config)),
            })
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            anyhow::bail!(
                "USB camera {} requires the ingest-v4l2 feature",
                config.device
            )
        }
    }
}

impl FrameSource for V4l2Source {
    fn id(&self) -> &str {
        &self.id
    }

    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            V4l2Backend::Synthetic(source) => source.connect(&self.id),
            #[cfg(feature = "ingest-v4l2")]
            V4l2Backend::Device(source) => source.connect(&self.id),
        }
    }

    fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        match &mut self.backend {
            V4l2Backend::Synthetic(source) => source.next_frame(&self.id).map(Some),
            #[cfg(feature = "ingest-v4l2")]
            V4l2Backend::Device(source) => source.next_frame(&self.id),
        }
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            V4l2Backend::Synthetic(_) => true,
            #[cfg(feature = "ingest-v4l2")]
            V4l2Backend::Device(source) => source.is_healthy(),
        }
    }

    fn stats(&self) -> SourceStats {
        match &self.backend {
            V4l2Backend::Synthetic(source) => source.stats(),
            #[cfg(feature = "ingest-v4l2")]
            V4l2Backend::Device(source) => source.stats(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticV4l2Source {
    config: V4l2Config,
    eye: SyntheticEye,
    frame_count: u64,
    next_frame_at: Instant,
}

impl SyntheticV4l2Source {
    fn new(config: V4l2Config) -> Self {
        Self {
            eye: SyntheticEye::new(config.width, config.height),
            config,
            frame_count: 0,
            next_frame_at: Instant::now(),
        }
    }

    /// Synthetic sources are always "connected".
    fn connect(&mut self, id: &str) -> Result<()> {
        log::info!(
            "V4l2Source[{}]: connected to {} (synthetic)",
            id,
            self.config.device
        );
        Ok(())
    }

    fn next_frame(&mut self, id: &str) -> Result<RawFrame> {
        // Pace like a real camera delivering at its native rate.
        let now = Instant::now();
        if now < self.next_frame_at {
            std::thread::sleep(self.next_frame_at - now);
        }
        self.next_frame_at = Instant::now() + frame_interval(self.config.target_fps);

        self.frame_count += 1;
        RawFrame::new(
            self.eye.render(),
            self.eye.width(),
            self.eye.height(),
            1,
            id,
            self.frame_count,
        )
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            device: self.config.device.clone(),
            frames_captured: self.frame_count,
            healthy: true,
            ..SourceStats::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Production V4L2 source using libv4l
// ----------------------------------------------------------------------------

#[cfg(feature = "ingest-v4l2")]
struct DeviceV4l2Source {
    config: V4l2Config,
    path: String,
    state: Option<DeviceV4l2State>,
    format: PixelFormat,
    frame_count: u64,
    frames_dropped: u64,
    geometry: Option<Geometry>,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
    active_width: u32,
    active_height: u32,
}

#[cfg(feature = "ingest-v4l2")]
#[self_referencing]
struct DeviceV4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

#[cfg(feature = "ingest-v4l2")]
impl DeviceV4l2Source {
    fn new(config: V4l2Config) -> Self {
        Self {
            path: device_path(&config.device),
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            format: PixelFormat::Mjpeg,
            frame_count: 0,
            frames_dropped: 0,
            geometry: None,
            last_frame_at: None,
            last_error: None,
        }
    }

    fn connect(&mut self, id: &str) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        self.state = None;
        let mut device = v4l::Device::with_path(&self.path)
            .with_context(|| format!("open v4l2 device {}", self.path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"MJPG");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source[{}]: failed to set MJPG on {}: {}",
                    id,
                    self.path,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        self.format = match &format.fourcc.repr {
            b"MJPG" => PixelFormat::Mjpeg,
            b"YUYV" => PixelFormat::Yuyv,
            b"GREY" => PixelFormat::Gray8,
            b"RGB3" => PixelFormat::Rgb24,
            other => {
                return Err(anyhow!(
                    "v4l2 device {} delivers unsupported format {}",
                    self.path,
                    String::from_utf8_lossy(other)
                ))
            }
        };

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Source[{}]: failed to set fps on {}: {}",
                    id,
                    self.path,
                    err
                );
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;

        let state = DeviceV4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()
        .map_err(|err| {
            self.last_error = Some(err.to_string());
            err
        })?;
        self.state = Some(state);
        self.last_error = None;

        log::info!(
            "V4l2Source[{}]: connected to {} ({}x{} {:?})",
            id,
            self.path,
            self.active_width,
            self.active_height,
            self.format
        );
        Ok(())
    }

    fn next_frame(&mut self, id: &str) -> Result<Option<RawFrame>> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not connected")?;
        let captured = state.with_mut(|fields| {
            fields.stream.next().map(|(buf, meta)| {
                // MJPEG buffers are only valid up to `bytesused`.
                let used = (meta.bytesused as usize).min(buf.len());
                if used > 0 {
                    buf[..used].to_vec()
                } else {
                    buf.to_vec()
                }
            })
        });
        let bytes = match captured {
            Ok(bytes) => bytes,
            Err(err) => {
                self.last_error = Some(err.to_string());
                self.state = None;
                return Err(anyhow::Error::new(err).context("capture v4l2 frame"));
            }
        };

        let pixels =
            match normalize_pixels(&bytes, self.active_width, self.active_height, self.format) {
                Ok(pixels) => pixels,
                Err(err) => {
                    self.frames_dropped += 1;
                    log::warn!("V4l2Source[{}]: frame drop: {:#}", id, err);
                    return Ok(None);
                }
            };
        if let Err(err) = pixels.check_geometry(&mut self.geometry) {
            self.frames_dropped += 1;
            log::warn!("V4l2Source[{}]: frame drop: {:#}", id, err);
            return Ok(None);
        }

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        RawFrame::new(
            pixels.data,
            pixels.width,
            pixels.height,
            pixels.channels,
            id,
            self.frame_count,
        )
        .map(Some)
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() || self.state.is_none() {
            return false;
        }
        let Some(last_frame_at) = self.last_frame_at else {
            return true;
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            device: self.path.clone(),
            frames_captured: self.frame_count,
            frames_dropped: self.frames_dropped,
            healthy: self.is_healthy(),
            ..SourceStats::default()
        }
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            2_000
        } else {
            (1000 / self.config.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
