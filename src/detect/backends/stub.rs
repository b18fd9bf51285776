use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;

/// Stub backend for testing and for running without a model file.
///
/// Returns the same scripted detection list on every call.
pub struct StubBackend {
    detections: Vec<Detection>,
}

impl StubBackend {
    /// Stub that never detects anything.
    pub fn new() -> Self {
        Self {
            detections: Vec::new(),
        }
    }

    /// Stub that returns a fixed detection list on every call.
    pub fn with_detections(detections: Vec<Detection>) -> Self {
        Self { detections }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<Detection>> {
        Ok(self.detections.clone())
    }
}
