use std::fmt;

use crate::detect::Detection;

/// Model label that marks the abnormal cup state.
pub const TIPPED_LABEL: &str = "tipped";

/// Three-way cup state communicated downstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    NotFound,
    Normal,
    Tipped,
}

impl Status {
    /// Wire string published to the broker and echoed to the uploader.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::NotFound => "not_found",
            Status::Normal => "normal",
            Status::Tipped => "tipped",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reduce one request's detections to a cup state.
///
/// `Tipped` outranks `Normal` outranks `NotFound`: any detection labeled
/// `tipped` decides the result regardless of what else was seen. Each request
/// is classified on its own, with no memory of prior requests.
pub fn classify(detections: &[Detection]) -> Status {
    if detections.is_empty() {
        Status::NotFound
    } else if detections.iter().any(|d| d.label == TIPPED_LABEL) {
        Status::Tipped
    } else {
        Status::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_detections_classify_as_not_found() {
        assert_eq!(classify(&[]), Status::NotFound);
    }

    #[test]
    fn detections_without_tipped_classify_as_normal() {
        let detections = vec![
            Detection::labeled("cup", 0.9),
            Detection::labeled("normal", 0.7),
        ];
        assert_eq!(classify(&detections), Status::Normal);
    }

    #[test]
    fn any_tipped_label_wins() {
        let detections = vec![
            Detection::labeled("cup", 0.9),
            Detection::labeled("tipped", 0.51),
        ];
        assert_eq!(classify(&detections), Status::Tipped);
    }

    #[test]
    fn classification_is_order_independent() {
        let mut detections = vec![
            Detection::labeled("tipped", 0.6),
            Detection::labeled("cup", 0.9),
            Detection::labeled("normal", 0.8),
        ];
        let forward = classify(&detections);
        detections.reverse();
        assert_eq!(classify(&detections), forward);
        assert_eq!(forward, Status::Tipped);
    }

    #[test]
    fn status_wire_strings() {
        assert_eq!(Status::NotFound.as_str(), "not_found");
        assert_eq!(Status::Normal.as_str(), "normal");
        assert_eq!(Status::Tipped.as_str(), "tipped");
        assert_eq!(Status::Tipped.to_string(), "tipped");
    }
}
