#![cfg(feature = "backend-tract")]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::infer::backend::ModelBackend;

/// File looked up inside a model directory.
const MODEL_FILE_IN_DIR: &str = "onnx/model.onnx";

/// Tract-based backend for ONNX inference.
///
/// Loads a local model with a fixed input shape and returns the first output
/// tensor flattened.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    shape: [usize; 4],
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    ///
    /// A directory path resolves to `<dir>/onnx/model.onnx`.
    pub fn new<P: AsRef<Path>>(model_path: P, shape: [usize; 4]) -> Result<Self> {
        let model_path = resolve_model_path(model_path.as_ref());
        let model = tract_onnx::onnx()
            .model_for_path(&model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(shape[0], shape[1], shape[2], shape[3]),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self { model, shape })
    }
}

fn resolve_model_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(MODEL_FILE_IN_DIR)
    } else {
        path.to_path_buf()
    }
}

impl ModelBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn run(&mut self, input: Vec<f32>, shape: [usize; 4]) -> Result<Vec<f32>> {
        if shape != self.shape {
            return Err(anyhow!(
                "input shape {:?} does not match model input {:?}",
                shape,
                self.shape
            ));
        }
        let tensor = tract_ndarray::Array4::from_shape_vec(
            (shape[0], shape[1], shape[2], shape[3]),
            input,
        )
        .context("input tensor does not match its shape")?
        .into_tensor();

        let outputs = self
            .model
            .run(tvec!(tensor.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let values = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        Ok(values.iter().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_paths_resolve_to_bundled_model() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_model_path(dir.path()), dir.path().join("onnx/model.onnx"));

        let file = dir.path().join("left.onnx");
        assert_eq!(resolve_model_path(&file), file);
    }

    #[test]
    fn missing_model_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let err = TractBackend::new(dir.path().join("absent.onnx"), [1, 1, 8, 8])
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("failed to load ONNX model"));
    }
}
