//! The tick loop: fetch, infer, filter, dispatch.
//!
//! Every tick reads the newest frame from each capture buffer without blocking.
//! A source that has produced nothing new since the last tick has its previous
//! frame reused, so a stalled camera never stalls the loop. Model outputs are
//! concatenated in engine order into one channel vector; channels of a model
//! that failed (or has no frame yet) are marked missing and the filter holds them.

mod scheduler;
mod stats;

pub use scheduler::TickScheduler;
pub use stats::{LatencySummary, TickReport, TickStats};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::config::PipelineSettings;
use crate::filter::TemporalFilter;
use crate::frame::{CaptureBuffer, RawFrame};
use crate::infer::{InferenceEngine, InferenceVector};
use crate::ingest::CaptureWorker;
use crate::telemetry::TelemetryDispatcher;

struct SourceSlot {
    buffer: Arc<CaptureBuffer>,
    last: Option<Arc<RawFrame>>,
}

struct EngineSlot {
    engine: InferenceEngine,
    source: usize,
    offset: usize,
    failing: bool,
}

type Outcome = Option<Result<InferenceVector>>;

pub struct Pipeline {
    sources: Vec<SourceSlot>,
    engines: Vec<EngineSlot>,
    filter: TemporalFilter,
    dispatcher: TelemetryDispatcher,
    scheduler: TickScheduler,
    parallel: bool,
    stats_interval: Duration,
    started: Instant,
    stats: TickStats,
}

impl Pipeline {
    /// Wire engines to buffers by source id and check channel counts line up.
    pub fn new(
        buffers: Vec<Arc<CaptureBuffer>>,
        engines: Vec<InferenceEngine>,
        filter: TemporalFilter,
        dispatcher: TelemetryDispatcher,
        settings: &PipelineSettings,
    ) -> Result<Self> {
        if engines.is_empty() {
            return Err(anyhow!("pipeline needs at least one inference engine"));
        }
        let mut offset = 0;
        let mut slots = Vec::with_capacity(engines.len());
        for engine in engines {
            let source = buffers
                .iter()
                .position(|buffer| buffer.source() == engine.source())
                .ok_or_else(|| {
                    anyhow!(
                        "model '{}' reads unknown source '{}'",
                        engine.id(),
                        engine.source()
                    )
                })?;
            let outputs = engine.outputs();
            slots.push(EngineSlot {
                engine,
                source,
                offset,
                failing: false,
            });
            offset += outputs;
        }
        if filter.channels() != offset {
            return Err(anyhow!(
                "filter has {} channels but models produce {}",
                filter.channels(),
                offset
            ));
        }
        if let Some(route) = dispatcher.routes().iter().find(|r| r.channel >= offset) {
            return Err(anyhow!(
                "route {} reads channel {} of {}",
                route.path,
                route.channel,
                offset
            ));
        }

        Ok(Self {
            sources: buffers
                .into_iter()
                .map(|buffer| SourceSlot { buffer, last: None })
                .collect(),
            engines: slots,
            filter,
            dispatcher,
            scheduler: TickScheduler::new(settings.tick_hz)?,
            parallel: settings.parallel_inference,
            stats_interval: settings.stats_interval(),
            started: Instant::now(),
            stats: TickStats::default(),
        })
    }

    pub fn channels(&self) -> usize {
        self.filter.channels()
    }

    pub fn filter(&self) -> &TemporalFilter {
        &self.filter
    }

    pub fn dispatcher(&self) -> &TelemetryDispatcher {
        &self.dispatcher
    }

    /// Run one tick to completion.
    pub fn tick(&mut self) -> TickReport {
        let tick_start = Instant::now();
        let mut report = TickReport::default();

        for slot in &mut self.sources {
            match slot.buffer.latest() {
                Some(frame) => {
                    let repeated = slot
                        .last
                        .as_ref()
                        .is_some_and(|prev| Arc::ptr_eq(prev, &frame));
                    if repeated {
                        report.repeated_frames += 1;
                    } else {
                        report.fresh_frames += 1;
                    }
                    slot.last = Some(frame);
                }
                None => {
                    if slot.last.is_none() {
                        report.missing_frames += 1;
                    }
                }
            }
        }

        let frames: Vec<Option<Arc<RawFrame>>> =
            self.sources.iter().map(|slot| slot.last.clone()).collect();
        let outcomes = if self.parallel && self.engines.len() > 1 {
            infer_parallel(&mut self.engines, &frames)
        } else {
            self.engines
                .iter_mut()
                .map(|slot| infer_one(slot, &frames))
                .collect()
        };

        let mut samples = vec![f64::NAN; self.filter.channels()];
        for (slot, outcome) in self.engines.iter_mut().zip(outcomes) {
            match outcome {
                Some(Ok(vector)) => {
                    report.inferences += 1;
                    if slot.failing {
                        log::info!("Pipeline: model '{}' recovered", slot.engine.id());
                        slot.failing = false;
                    }
                    for (i, value) in vector.values.iter().enumerate() {
                        samples[slot.offset + i] = f64::from(*value);
                    }
                }
                Some(Err(err)) => {
                    report.inference_failures += 1;
                    if slot.failing {
                        log::debug!("Pipeline: {:#}", err);
                    } else {
                        log::warn!("Pipeline: {:#}; holding previous values", err);
                        slot.failing = true;
                    }
                }
                None => {}
            }
        }

        let timestamp = tick_start.duration_since(self.started).as_secs_f64();
        match self.filter.apply(&samples, timestamp) {
            Ok(filtered) => report.dispatch = self.dispatcher.dispatch(&filtered),
            Err(err) => log::error!("Pipeline: filter rejected tick: {:#}", err),
        }

        report.latency = tick_start.elapsed();
        self.stats.record(&report);
        report
    }

    /// Run paced ticks until `shutdown` is set. The current tick always completes.
    pub fn run(&mut self, shutdown: &AtomicBool, workers: &[CaptureWorker]) {
        log::info!(
            "Pipeline: running {} models over {} sources at {:.1} Hz ({} channels)",
            self.engines.len(),
            self.sources.len(),
            1.0 / self.scheduler.period().as_secs_f64(),
            self.channels()
        );
        self.scheduler.reset(Instant::now());
        let mut last_stats = Instant::now();
        while !shutdown.load(Ordering::SeqCst) {
            self.tick();
            if last_stats.elapsed() >= self.stats_interval {
                self.log_stats(workers);
                last_stats = Instant::now();
            }
            self.scheduler.wait();
        }
        log::info!(
            "Pipeline: stopped after {:.1}s ({} datagrams sent, {} overruns)",
            self.started.elapsed().as_secs_f64(),
            self.dispatcher.sent(),
            self.scheduler.overruns()
        );
    }

    /// Run `count` paced ticks.
    pub fn run_ticks(&mut self, count: usize) -> Vec<TickReport> {
        self.scheduler.reset(Instant::now());
        (0..count)
            .map(|_| {
                let report = self.tick();
                self.scheduler.wait();
                report
            })
            .collect()
    }

    fn log_stats(&mut self, workers: &[CaptureWorker]) {
        let window = self.stats.take();
        log::info!(
            "Pipeline: ticks={} latency min/mean/max={:.2}/{:.2}/{:.2}ms repeated={} missing={} infer_failures={} sent={} send_failures={} overruns={}",
            window.ticks,
            ms(window.latency.min),
            ms(window.latency.mean()),
            ms(window.latency.max),
            window.repeated_frames,
            window.missing_frames,
            window.inference_failures,
            window.datagrams_sent,
            window.dispatch_failures,
            self.scheduler.overruns()
        );
        for worker in workers {
            let stats = worker.stats();
            log::info!(
                "source {} health={} frames={} dropped={} backlog_discards={} reconnects={} device={}",
                worker.id(),
                stats.healthy,
                stats.frames_captured,
                stats.frames_dropped,
                stats.backlog_discards,
                stats.reconnects,
                stats.device
            );
        }
    }
}

fn ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn infer_one(slot: &mut EngineSlot, frames: &[Option<Arc<RawFrame>>]) -> Outcome {
    let frame = frames[slot.source].as_ref()?;
    Some(slot.engine.run(frame))
}

fn infer_parallel(engines: &mut [EngineSlot], frames: &[Option<Arc<RawFrame>>]) -> Vec<Outcome> {
    thread::scope(|scope| {
        let handles: Vec<_> = engines
            .iter_mut()
            .map(|slot| scope.spawn(move || infer_one(slot, frames)))
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Some(Err(anyhow!("inference thread panicked"))))
            })
            .collect()
    })
}
