use std::net::UdpSocket;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use gaze_relay::config::PipelineSettings;
use gaze_relay::infer::{ColorMode, Preprocess, StubBackend};
use gaze_relay::ingest::{CaptureWorker, FrameSource, SourceStats};
use gaze_relay::telemetry::Route;
use gaze_relay::{FilterParams, InferenceEngine, Pipeline, RawFrame, TelemetryDispatcher, TemporalFilter};

/// Delivers `limit` frames, then stops producing anything.
struct StallingSource {
    produced: u64,
    limit: u64,
}

impl FrameSource for StallingSource {
    fn id(&self) -> &str {
        "left"
    }

    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        thread::sleep(Duration::from_millis(2));
        if self.produced >= self.limit {
            return Ok(None);
        }
        self.produced += 1;
        RawFrame::new(vec![90u8; 64], 8, 8, 1, "left", self.produced).map(Some)
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            device: "test://stall".to_string(),
            frames_captured: self.produced,
            healthy: true,
            ..SourceStats::default()
        }
    }
}

#[test]
fn stalled_source_keeps_cadence_and_repeats_last_frame() {
    let worker = CaptureWorker::spawn(
        Box::new(StallingSource {
            produced: 0,
            limit: 1,
        }),
        Duration::from_millis(10),
    )
    .unwrap();
    let buffer = worker.buffer();
    let deadline = Instant::now() + Duration::from_secs(2);
    while buffer.latest().is_none() {
        assert!(Instant::now() < deadline, "source never published");
        thread::sleep(Duration::from_millis(1));
    }

    let backend = StubBackend::new(vec![0.4]);
    let calls: Arc<AtomicU64> = backend.calls();
    let engine = InferenceEngine::new(
        "blink",
        "left",
        Preprocess::new(8, 8, ColorMode::Gray),
        1,
        Box::new(backend),
    );
    let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
    let dispatcher =
        TelemetryDispatcher::new(rx.local_addr().unwrap(), vec![Route::new("/lid", 0, true)]).unwrap();
    let settings = PipelineSettings {
        tick_hz: 100.0,
        parallel_inference: false,
        ..PipelineSettings::default()
    };
    let mut pipeline = Pipeline::new(
        vec![buffer],
        vec![engine],
        TemporalFilter::new(vec![FilterParams::eyelid()]),
        dispatcher,
        &settings,
    )
    .unwrap();

    let ticks = 20;
    let started = Instant::now();
    let reports = pipeline.run_ticks(ticks);
    let elapsed = started.elapsed();

    assert_eq!(reports.len(), ticks);
    assert_eq!(reports[0].fresh_frames, 1);
    assert!(reports[1..].iter().all(|r| r.repeated_frames == 1 && r.fresh_frames == 0));
    assert!(reports.iter().all(|r| r.inference_failures == 0 && r.dispatch.sent == 1));
    assert_eq!(calls.load(Ordering::SeqCst), ticks as u64);

    // 20 ticks at 100 Hz: about 200 ms, never collapsing into a busy loop or a stall.
    assert!(elapsed >= Duration::from_millis(190), "ran too fast: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "ran too slow: {:?}", elapsed);

    assert_eq!(worker.stats().frames_captured, 1);
    assert!(worker.stop(Duration::from_secs(1)));
}

#[test]
fn slow_consumer_only_sees_newest_frame() {
    let worker = CaptureWorker::spawn(
        Box::new(StallingSource {
            produced: 0,
            limit: 10,
        }),
        Duration::from_millis(10),
    )
    .unwrap();
    let buffer = worker.buffer();
    let deadline = Instant::now() + Duration::from_secs(2);
    while buffer.published() < 10 {
        assert!(Instant::now() < deadline, "source stalled early");
        thread::sleep(Duration::from_millis(5));
    }

    let frame = buffer.latest().expect("frame published");
    assert_eq!(frame.sequence, 10);
    assert!(worker.stop(Duration::from_secs(1)));
}
