use anyhow::Result;

/// Model runtime seam.
///
/// A backend receives a preprocessed NCHW tensor and returns the model's raw
/// output vector for the single image in the batch. Backends own no frame data
/// between calls.
pub trait ModelBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Execute one forward pass.
    fn run(&mut self, input: Vec<f32>, shape: [usize; 4]) -> Result<Vec<f32>>;
}
