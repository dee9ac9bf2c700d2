//! Frame ingestion sources.
//!
//! This module provides the two eye-camera backends:
//! - USB/UVC cameras via V4L2 (feature: ingest-v4l2)
//! - Serial cameras streaming framed JPEG (feature: ingest-serial)
//!
//! Both accept `stub://<name>` devices that synthesize eye imagery, so the
//! whole pipeline runs without hardware.
//!
//! Every source runs on its own `CaptureWorker` thread and publishes into a
//! single-slot `CaptureBuffer`. Sources never queue frames.

pub mod capture;
pub mod framing;
mod normalize;
pub mod serial;
mod synthetic;
pub mod v4l2;

pub use capture::{start_workers, stop_workers, CaptureWorker, FrameSource, SourceStats};
pub use framing::{ByteTransport, DecodeError, DecoderStats, SerialFrameDecoder};
pub use serial::{SerialConfig, SerialSource};
pub use v4l2::{V4l2Config, V4l2Source};

use anyhow::{anyhow, Result};

use crate::config::{SerialSettings, SourceKind, SourceSettings};

/// Build the configured backend for one source. The source is not yet connected.
pub fn open_source(
    source: &SourceSettings,
    serial: &SerialSettings,
) -> Result<Box<dyn FrameSource>> {
    let kind = source.kind().ok_or_else(|| {
        anyhow!(
            "cannot infer backend for source '{}' ({})",
            source.id,
            source.device
        )
    })?;
    match kind {
        SourceKind::Uvc => {
            let config = V4l2Config {
                device: v4l2::device_path(&source.device),
                target_fps: source.fps,
                width: source.width,
                height: source.height,
            };
            Ok(Box::new(V4l2Source::new(source.id.clone(), config)?))
        }
        SourceKind::Serial => {
            let config = SerialConfig {
                port: source.device.clone(),
                baud_rate: serial.baud_rate,
                read_timeout: serial.read_timeout(),
                backlog_threshold: serial.backlog_threshold,
                chunk_size: serial.chunk_size,
                width: source.width,
                height: source.height,
                target_fps: source.fps,
            };
            Ok(Box::new(SerialSource::new(source.id.clone(), config)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub(id: &str, kind: Option<SourceKind>) -> SourceSettings {
        SourceSettings {
            id: id.to_string(),
            device: format!("stub://{}", id),
            kind,
            width: 32,
            height: 32,
            fps: 200,
        }
    }

    #[test]
    fn opens_both_backends_for_stub_devices() -> Result<()> {
        let serial = SerialSettings::default();
        for kind in [None, Some(SourceKind::Uvc), Some(SourceKind::Serial)] {
            let mut source = open_source(&stub("left", kind), &serial)?;
            assert_eq!(source.id(), "left");
            source.connect()?;
            let frame = (0..50).find_map(|_| source.next_frame().ok().flatten());
            let frame = frame.expect("stub source produced no frame");
            assert_eq!((frame.width, frame.height), (32, 32));
        }
        Ok(())
    }

    #[test]
    fn unknown_device_kind_is_rejected() {
        let mut settings = stub("left", None);
        settings.device = "camera".to_string();
        assert!(open_source(&settings, &SerialSettings::default()).is_err());
    }
}
