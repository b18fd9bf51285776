use anyhow::Result;

use crate::detect::result::Detection;

/// Detector backend trait.
///
/// Implementations receive one tightly packed RGB24 frame per call and
/// return the detections whose confidence cleared the backend's threshold.
/// The pixel slice is read-only and ephemeral; backends must not retain it.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>>;
}
