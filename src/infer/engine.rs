use std::time::Instant;

use anyhow::{anyhow, Context, Result};

use crate::config::ModelSettings;
use crate::frame::RawFrame;

use super::backend::ModelBackend;
use super::backends::CentroidBackend;
use super::preprocess::Preprocess;

/// Model paths with this prefix run on the built-in centroid backend.
pub const STUB_MODEL_PREFIX: &str = "stub://";

/// Raw output of one model for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct InferenceVector {
    pub model: String,
    pub values: Vec<f32>,
    pub captured_at: Instant,
    pub frame_sequence: u64,
}

/// One fixed model bound to one frame source.
pub struct InferenceEngine {
    id: String,
    source: String,
    preprocess: Preprocess,
    outputs: usize,
    backend: Box<dyn ModelBackend>,
}

impl InferenceEngine {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        preprocess: Preprocess,
        outputs: usize,
        backend: Box<dyn ModelBackend>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            preprocess,
            outputs,
            backend,
        }
    }

    /// Open the configured model and verify it answers with the configured arity.
    pub fn load(settings: &ModelSettings) -> Result<Self> {
        let preprocess = Preprocess::new(
            settings.input.width,
            settings.input.height,
            settings.input.color,
        );
        let backend = open_backend(settings, preprocess.input_shape())
            .with_context(|| format!("model '{}': failed to open {}", settings.id, settings.path))?;
        let mut engine = Self::new(
            settings.id.clone(),
            settings.source.clone(),
            preprocess,
            settings.outputs,
            backend,
        );
        engine.warm_up()?;
        log::info!(
            "InferenceEngine: loaded '{}' ({} backend, input {}x{} {:?}, {} outputs)",
            engine.id,
            engine.backend.name(),
            preprocess.width,
            preprocess.height,
            preprocess.color,
            engine.outputs
        );
        Ok(engine)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn outputs(&self) -> usize {
        self.outputs
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Preprocess `frame` and run one forward pass.
    pub fn run(&mut self, frame: &RawFrame) -> Result<InferenceVector> {
        let input = self
            .preprocess
            .to_tensor(frame)
            .with_context(|| format!("model '{}': preprocessing failed", self.id))?;
        let values = self
            .backend
            .run(input, self.preprocess.input_shape())
            .with_context(|| format!("model '{}': forward pass failed", self.id))?;
        self.check_arity(values.len())?;
        Ok(InferenceVector {
            model: self.id.clone(),
            values,
            captured_at: frame.captured_at,
            frame_sequence: frame.sequence,
        })
    }

    fn warm_up(&mut self) -> Result<()> {
        let shape = self.preprocess.input_shape();
        let len = shape.iter().product();
        let values = self
            .backend
            .run(vec![0.0; len], shape)
            .with_context(|| format!("model '{}': warm-up inference failed", self.id))?;
        self.check_arity(values.len())
    }

    fn check_arity(&self, len: usize) -> Result<()> {
        if len != self.outputs {
            return Err(anyhow!(
                "model '{}' produced {} values, configured for {}",
                self.id,
                len,
                self.outputs
            ));
        }
        Ok(())
    }
}

fn open_backend(settings: &ModelSettings, shape: [usize; 4]) -> Result<Box<dyn ModelBackend>> {
    if settings.path.starts_with(STUB_MODEL_PREFIX) {
        return Ok(Box::new(CentroidBackend::new(settings.outputs)?));
    }
    open_onnx(settings, shape)
}

#[cfg(feature = "backend-tract")]
fn open_onnx(settings: &ModelSettings, shape: [usize; 4]) -> Result<Box<dyn ModelBackend>> {
    Ok(Box::new(super::backends::TractBackend::new(&settings.path, shape)?))
}

#[cfg(not(feature = "backend-tract"))]
fn open_onnx(_settings: &ModelSettings, _shape: [usize; 4]) -> Result<Box<dyn ModelBackend>> {
    Err(anyhow!(
        "ONNX models require the backend-tract feature (rebuild with --features backend-tract)"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterSettings, InputSettings};
    use crate::infer::backends::StubBackend;
    use crate::infer::preprocess::ColorMode;

    fn gray_frame(sequence: u64) -> RawFrame {
        RawFrame::new(vec![128u8; 32 * 32], 32, 32, 1, "left", sequence).unwrap()
    }

    fn stub_settings(outputs: usize) -> ModelSettings {
        ModelSettings {
            id: "blink".to_string(),
            path: "stub://blink".to_string(),
            source: "left".to_string(),
            input: InputSettings {
                width: 16,
                height: 16,
                color: ColorMode::Gray,
            },
            outputs,
            filter: FilterSettings::default(),
        }
    }

    #[test]
    fn run_tags_output_with_model_and_frame() {
        let backend = StubBackend::new(vec![0.25, -0.5]);
        let mut engine = InferenceEngine::new(
            "left_gaze",
            "left",
            Preprocess::new(8, 8, ColorMode::Gray),
            2,
            Box::new(backend),
        );
        let frame = gray_frame(7);

        let out = engine.run(&frame).unwrap();
        assert_eq!(out.model, "left_gaze");
        assert_eq!(out.values, vec![0.25, -0.5]);
        assert_eq!(out.frame_sequence, 7);
        assert_eq!(out.captured_at, frame.captured_at);
    }

    #[test]
    fn wrong_arity_is_an_error() {
        let mut engine = InferenceEngine::new(
            "left_gaze",
            "left",
            Preprocess::new(8, 8, ColorMode::Gray),
            2,
            Box::new(StubBackend::new(vec![0.1, 0.2, 0.3])),
        );
        assert!(engine.run(&gray_frame(1)).is_err());
    }

    #[test]
    fn failure_is_per_call() {
        let backend = StubBackend::new(vec![0.5]).then_fail();
        let mut engine = InferenceEngine::new(
            "blink",
            "left",
            Preprocess::new(8, 8, ColorMode::Gray),
            1,
            Box::new(backend),
        );
        assert!(engine.run(&gray_frame(1)).is_err());
        assert_eq!(engine.run(&gray_frame(2)).unwrap().values, vec![0.5]);
    }

    #[test]
    fn load_stub_model_uses_centroid_backend() {
        let engine = InferenceEngine::load(&stub_settings(1)).unwrap();
        assert_eq!(engine.backend_name(), "centroid");
        assert_eq!(engine.source(), "left");
        assert_eq!(engine.outputs(), 1);
    }

    #[test]
    fn load_rejects_unsupported_stub_arity() {
        let err = InferenceEngine::load(&stub_settings(4)).err().unwrap();
        assert!(format!("{:#}", err).contains("model 'blink'"));
    }

    #[test]
    fn load_missing_model_is_fatal() {
        let mut settings = stub_settings(2);
        settings.path = "/nonexistent/gaze.onnx".to_string();
        assert!(InferenceEngine::load(&settings).is_err());
    }
}
