//! Frame-to-vector inference: a fixed preprocessing contract per model and a
//! pluggable runtime behind `ModelBackend`.

mod backend;
mod backends;
mod engine;
mod preprocess;

pub use backend::ModelBackend;
pub use backends::{CentroidBackend, StubBackend};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use engine::{InferenceEngine, InferenceVector, STUB_MODEL_PREFIX};
pub use preprocess::{ColorMode, Preprocess};
