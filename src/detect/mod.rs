mod backend;
mod backends;
mod result;

use anyhow::Result;

use crate::config::DetectorSettings;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
pub use result::Detection;

#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;

/// Pick the detector backend for the configured model.
///
/// A configured model path selects the tract backend; without one the stub
/// backend runs and every upload classifies as absent.
pub fn select_backend(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    match &settings.model_path {
        Some(path) => {
            #[cfg(feature = "backend-tract")]
            {
                let backend = backends::TractBackend::new(
                    path,
                    settings.input_width,
                    settings.input_height,
                    settings.labels.clone(),
                )?
                .with_threshold(settings.confidence_threshold);
                log::info!("loaded detection model from {}", path.display());
                Ok(Box::new(backend))
            }
            #[cfg(not(feature = "backend-tract"))]
            {
                Err(anyhow::anyhow!(
                    "model '{}' configured but this build has no backend-tract feature",
                    path.display()
                ))
            }
        }
        None => {
            log::warn!("no detection model configured; uploads will classify as not_found");
            Ok(Box::new(backends::StubBackend::new()))
        }
    }
}
