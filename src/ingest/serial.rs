//! Serial camera frame source.
//!
//! This module provides `SerialSource` for eye cameras attached over a USB-serial
//! link that stream JPEG images in the framing protocol decoded by
//! `SerialFrameDecoder`.
//!
//! The serial source is responsible for:
//! - Opening the port (3 Mbaud, 8N1, no flow control)
//! - Feeding received bytes through the framing decoder
//! - Dropping the serial backlog when it grows past the configured threshold
//! - Decoding JPEG payloads into `RawFrame` instances
//!
//! A `stub://` port name yields a synthetic link that emits real framed JPEG packets,
//! so the full decode path runs without hardware.

use anyhow::{anyhow, Context, Result};
use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use super::capture::{FrameSource, SourceStats};
use super::framing::{
    encode_packet, ByteTransport, DecodeError, SerialFrameDecoder, DEFAULT_BACKLOG_THRESHOLD,
    DEFAULT_CHUNK_SIZE,
};
use super::normalize::{decode_jpeg, Geometry};
use super::synthetic::{frame_interval, SyntheticEye};
use crate::frame::RawFrame;

/// Settle time after opening the port before the first read.
#[cfg(feature = "ingest-serial")]
const PORT_SETTLE: Duration = Duration::from_millis(100);

/// Configuration for a serial camera.
#[derive(Clone, Debug)]
pub struct SerialConfig {
    /// Port name (e.g. "/dev/ttyACM0", "COM3") or "stub://<name>".
    pub port: String,
    pub baud_rate: u32,
    /// Transport read timeout; bounds how long one decode attempt may block.
    pub read_timeout: Duration,
    /// Unread bytes above which the serial input and decoder are reset.
    pub backlog_threshold: usize,
    /// Bytes requested per read.
    pub chunk_size: usize,
    /// Frame width for synthetic frames.
    pub width: u32,
    /// Frame height for synthetic frames.
    pub height: u32,
    /// Frame rate for synthetic frames.
    pub target_fps: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 3_000_000,
            read_timeout: Duration::from_secs(1),
            backlog_threshold: DEFAULT_BACKLOG_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            width: 240,
            height: 240,
            target_fps: 60,
        }
    }
}

/// Serial camera source.
pub struct SerialSource {
    id: String,
    config: SerialConfig,
    transport: Option<Box<dyn ByteTransport + Send>>,
    decoder: SerialFrameDecoder,
    frame_count: u64,
    frames_dropped: u64,
    /// Set by the first decoded frame; kept across reconnects.
    geometry: Option<Geometry>,
    connected_at: Option<Instant>,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
}

impl SerialSource {
    pub fn new(id: impl Into<String>, config: SerialConfig) -> Result<Self> {
        if config.backlog_threshold == 0 {
            return Err(anyhow!("serial backlog threshold must be greater than zero"));
        }
        Ok(Self {
            id: id.into(),
            decoder: SerialFrameDecoder::new(config.backlog_threshold, config.chunk_size),
            config,
            transport: None,
            frame_count: 0,
            frames_dropped: 0,
            geometry: None,
            connected_at: None,
            last_frame_at: None,
            last_error: None,
        })
    }

    fn open_transport(&self) -> Result<Box<dyn ByteTransport + Send>> {
        if self.config.port.starts_with("stub://") {
            return Ok(Box::new(SyntheticSerialLink::new(&self.config)));
        }
        #[cfg(feature = "ingest-serial")]
        {
            let port = serialport::new(&self.config.port, self.config.baud_rate)
                .timeout(self.config.read_timeout)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .open()
                .with_context(|| format!("open serial camera {}", self.config.port))?;
            std::thread::sleep(PORT_SETTLE);
            Ok(Box::new(DevicePort { port }))
        }
        #[cfg(not(feature = "ingest-serial"))]
        {
            Err(anyhow!("serial cameras require the ingest-serial feature"))
        }
    }

    fn drop_frame(&mut self, err: &DecodeError) {
        self.frames_dropped += 1;
        log::warn!("SerialSource[{}]: frame drop: {}", self.id, err);
    }
}

impl FrameSource for SerialSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn connect(&mut self) -> Result<()> {
        self.transport = None;
        self.decoder.reset();
        let transport = self.open_transport().map_err(|err| {
            self.last_error = Some(format!("{:#}", err));
            err
        })?;
        self.transport = Some(transport);
        self.connected_at = Some(Instant::now());
        self.last_error = None;
        log::info!(
            "SerialSource[{}]: connected on {} at {} baud",
            self.id,
            self.config.port,
            self.config.baud_rate
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        let transport = self.transport.as_mut().ok_or_else(|| {
            anyhow!(
                "serial camera {} not connected; call connect() first",
                self.config.port
            )
        })?;

        let jpeg = match self.decoder.next_payload(transport.as_mut()) {
            Ok(jpeg) => jpeg,
            Err(err) if err.is_fatal() => {
                self.transport = None;
                self.last_error = Some(err.to_string());
                return Err(anyhow::Error::new(err)
                    .context(format!("serial camera {} disconnected", self.config.port)));
            }
            Err(DecodeError::BacklogDiscarded(bytes)) => {
                log::info!(
                    "SerialSource[{}]: discarded serial backlog ({} bytes)",
                    self.id,
                    bytes
                );
                return Ok(None);
            }
            Err(DecodeError::Timeout { buffered }) => {
                log::debug!(
                    "SerialSource[{}]: read timed out with {} bytes buffered",
                    self.id,
                    buffered
                );
                return Ok(None);
            }
            Err(err) => {
                self.drop_frame(&err);
                return Ok(None);
            }
        };

        let pixels = match decode_jpeg(&jpeg) {
            Ok(pixels) => pixels,
            Err(err) => {
                self.drop_frame(&DecodeError::Image(format!("{:#}", err)));
                return Ok(None);
            }
        };

        if let Err(err) = pixels.check_geometry(&mut self.geometry) {
            self.frames_dropped += 1;
            log::warn!("SerialSource[{}]: frame drop: {:#}", self.id, err);
            return Ok(None);
        }

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        RawFrame::new(
            pixels.data,
            pixels.width,
            pixels.height,
            pixels.channels,
            self.id.clone(),
            self.frame_count,
        )
        .map(Some)
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() || self.transport.is_none() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let grace = Duration::from_secs(2).max(self.config.read_timeout * 2);
        match self.last_frame_at {
            Some(last) => last.elapsed() <= grace,
            None => connected_at.elapsed() <= grace,
        }
    }

    fn stats(&self) -> SourceStats {
        let decoder = self.decoder.stats();
        SourceStats {
            device: self.config.port.clone(),
            frames_captured: self.frame_count,
            frames_dropped: self.frames_dropped,
            backlog_discards: decoder.backlog_discards,
            reconnects: 0,
            healthy: self.is_healthy(),
        }
    }
}

// ----------------------------------------------------------------------------
// Hardware port
// ----------------------------------------------------------------------------

#[cfg(feature = "ingest-serial")]
struct DevicePort {
    port: Box<dyn serialport::SerialPort>,
}

#[cfg(feature = "ingest-serial")]
impl ByteTransport for DevicePort {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;

        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn pending(&mut self) -> io::Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn discard_pending(&mut self) -> io::Result<()> {
        self.port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Synthetic link (stub://)
// ----------------------------------------------------------------------------

/// Emits framed JPEG packets of a synthetic eye at the configured rate.
struct SyntheticSerialLink {
    eye: SyntheticEye,
    pending: VecDeque<u8>,
    interval: Duration,
    next_frame_at: Instant,
}

impl SyntheticSerialLink {
    fn new(config: &SerialConfig) -> Self {
        Self {
            eye: SyntheticEye::new(config.width, config.height),
            pending: VecDeque::new(),
            interval: frame_interval(config.target_fps),
            next_frame_at: Instant::now(),
        }
    }

    fn emit_frame(&mut self) -> io::Result<()> {
        let gray = image::GrayImage::from_raw(self.eye.width(), self.eye.height(), self.eye.render())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "synthetic frame size"))?;
        let mut jpeg = Vec::new();
        image::DynamicImage::ImageLuma8(gray)
            .write_to(&mut io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let packet =
            encode_packet(&jpeg).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        self.pending.extend(packet);
        Ok(())
    }
}

impl ByteTransport for SyntheticSerialLink {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            let now = Instant::now();
            if now < self.next_frame_at {
                std::thread::sleep(self.next_frame_at - now);
            }
            self.next_frame_at = Instant::now() + self.interval;
            self.emit_frame()?;
        }
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn pending(&mut self) -> io::Result<usize> {
        Ok(self.pending.len())
    }

    fn discard_pending(&mut self) -> io::Result<()> {
        self.pending.clear();
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
