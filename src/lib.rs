//! Gaze Relay
//!
//! This crate turns eye-camera imagery into smoothed gaze and eyelid parameters
//! streamed as OSC over UDP, at camera frame rate.
//!
//! # Architecture
//!
//! Data flows one way through the crate:
//!
//! 1. **Capture**: one thread per camera publishes the newest frame into a
//!    single-slot buffer. Older unread frames are overwritten, never queued.
//! 2. **Inference**: each model preprocesses its camera's frame and produces a
//!    fixed-arity output vector.
//! 3. **Filtering**: the concatenated vector passes through per-channel
//!    One-Euro filters.
//! 4. **Dispatch**: each routed channel is sent as one OSC datagram.
//!
//! A paced tick loop drives steps 2 to 4. A stalled camera causes its last frame
//! to be reused; a failed model holds its previous filtered values.
//!
//! # Module Structure
//!
//! - `frame`: RawFrame and the latest-wins CaptureBuffer
//! - `ingest`: Camera backends (UVC, serial), the serial framing decoder, capture threads
//! - `infer`: Preprocessing contract, model backends, InferenceEngine
//! - `filter`: One-Euro filter state and filter bank
//! - `telemetry`: OSC encoding and the UDP dispatcher
//! - `pipeline`: Tick scheduler and loop
//! - `config`: Daemon configuration (file + env)

pub mod config;
pub mod filter;
pub mod frame;
pub mod infer;
pub mod ingest;
pub mod pipeline;
pub mod telemetry;

pub use config::{GazeConfig, ModelSettings, PipelineSettings, SourceKind, SourceSettings};
pub use filter::{ChannelState, FilterParams, TemporalFilter};
pub use frame::{CaptureBuffer, RawFrame};
pub use infer::{InferenceEngine, InferenceVector, ModelBackend};
pub use ingest::{
    open_source, start_workers, stop_workers, CaptureWorker, FrameSource, SerialFrameDecoder,
    SourceStats,
};
pub use pipeline::{Pipeline, TickReport};
pub use telemetry::{DispatchReport, Route, TelemetryDispatcher};
