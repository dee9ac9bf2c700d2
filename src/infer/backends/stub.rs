use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::infer::backend::ModelBackend;

/// Scripted backend for tests.
///
/// Returns queued outputs in order, then repeats the fallback forever.
/// A queued `None` makes that call fail.
pub struct StubBackend {
    script: VecDeque<Option<Vec<f32>>>,
    fallback: Vec<f32>,
    calls: Arc<AtomicU64>,
}

impl StubBackend {
    pub fn new(fallback: Vec<f32>) -> Self {
        Self {
            script: VecDeque::new(),
            fallback,
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn then(mut self, output: Vec<f32>) -> Self {
        self.script.push_back(Some(output));
        self
    }

    pub fn then_fail(mut self) -> Self {
        self.script.push_back(None);
        self
    }

    /// Shared call counter; survives the backend being boxed.
    pub fn calls(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.calls)
    }
}

impl ModelBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn run(&mut self, _input: Vec<f32>, _shape: [usize; 4]) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.pop_front() {
            Some(Some(output)) => Ok(output),
            Some(None) => Err(anyhow!("scripted inference failure")),
            None => Ok(self.fallback.clone()),
        }
    }
}
