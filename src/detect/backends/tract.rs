#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;

const IOU_THRESHOLD: f32 = 0.45;

/// Tract-based backend for ONNX object detection.
///
/// Loads a local model file and runs inference on RGB frames. Frames that do
/// not match the model input size are resized before the forward pass. The
/// model output is expected in the common detector layout
/// `[1, 4 + num_classes, anchors]` with center-format boxes in input pixels.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    width: u32,
    height: u32,
    confidence_threshold: f32,
    labels: Vec<String>,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        width: u32,
        height: u32,
        labels: Vec<String>,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
            confidence_threshold: 0.5,
            labels,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<Tensor> {
        let expected_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected_len {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                expected_len,
                pixels.len()
            ));
        }

        let rgb = if width == self.width && height == self.height {
            pixels.to_vec()
        } else {
            let frame = RgbImage::from_raw(width, height, pixels.to_vec())
                .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
            image::imageops::resize(
                &frame,
                self.width,
                self.height,
                image::imageops::FilterType::Triangle,
            )
            .into_raw()
        };

        let model_width = self.width as usize;
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, model_width),
            |(_, channel, y, x)| {
                let idx = (y * model_width + x) * 3 + channel;
                rgb[idx] as f32 / 255.0
            },
        );

        Ok(input.into_tensor())
    }

    fn decode_outputs(&self, outputs: TVec<TValue>) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape();
        if shape.len() != 3 || shape[0] != 1 || shape[1] != 4 + self.labels.len() {
            return Err(anyhow!(
                "unexpected model output shape {:?}; expected [1, {}, anchors]",
                shape,
                4 + self.labels.len()
            ));
        }
        let anchors = shape[2];
        let data = view
            .as_slice()
            .ok_or_else(|| anyhow!("model output tensor was not contiguous"))?;

        let candidates = decode_predictions(
            data,
            self.labels.len(),
            anchors,
            self.width as f32,
            self.height as f32,
            self.confidence_threshold,
            &self.labels,
        );
        Ok(non_max_suppression(candidates, IOU_THRESHOLD))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        let input = self.build_input(pixels, width, height)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode_outputs(outputs)
    }
}

/// Decode a `[1, 4 + num_classes, anchors]` prediction block.
///
/// Each anchor column carries cx/cy/w/h in input pixels followed by one score
/// per class. An anchor survives when its best class score clears the
/// threshold; boxes come out corner-format, normalized 0..1.
fn decode_predictions(
    data: &[f32],
    num_classes: usize,
    anchors: usize,
    input_w: f32,
    input_h: f32,
    threshold: f32,
    labels: &[String],
) -> Vec<Detection> {
    let at = |channel: usize, anchor: usize| data[channel * anchors + anchor];

    let mut detections = Vec::new();
    for a in 0..anchors {
        let mut best_class = 0;
        let mut best_score = f32::NEG_INFINITY;
        for c in 0..num_classes {
            let score = at(4 + c, a);
            if score > best_score {
                best_score = score;
                best_class = c;
            }
        }
        if !best_score.is_finite() || best_score < threshold {
            continue;
        }

        let cx = at(0, a) / input_w;
        let cy = at(1, a) / input_h;
        let w = at(2, a) / input_w;
        let h = at(3, a) / input_h;
        let label = labels
            .get(best_class)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", best_class));

        detections.push(Detection {
            label,
            confidence: best_score,
            x: (cx - w / 2.0).clamp(0.0, 1.0),
            y: (cy - h / 2.0).clamp(0.0, 1.0),
            w: w.clamp(0.0, 1.0),
            h: h.clamp(0.0, 1.0),
        });
    }
    detections
}

/// Greedy per-label non-maximum suppression.
fn non_max_suppression(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<Detection> = Vec::new();
    for candidate in candidates {
        let overlaps = kept
            .iter()
            .any(|k| k.label == candidate.label && iou(k, &candidate) > iou_threshold);
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &Detection, b: &Detection) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.w).min(b.x + b.w);
    let y2 = (a.y + a.h).min(b.y + b.h);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.w * a.h + b.w * b.h - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<String> {
        vec!["normal".to_string(), "tipped".to_string()]
    }

    // Column-major helper: builds the flat [1, 4+nc, anchors] block from
    // per-anchor rows of (cx, cy, w, h, scores...).
    fn block(rows: &[Vec<f32>]) -> (Vec<f32>, usize) {
        let anchors = rows.len();
        let channels = rows[0].len();
        let mut data = vec![0.0; channels * anchors];
        for (a, row) in rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                data[c * anchors + a] = *value;
            }
        }
        (data, anchors)
    }

    #[test]
    fn decode_filters_below_threshold() {
        let (data, anchors) = block(&[
            vec![320.0, 320.0, 64.0, 64.0, 0.9, 0.1],
            vec![100.0, 100.0, 32.0, 32.0, 0.3, 0.2],
        ]);
        let detections =
            decode_predictions(&data, 2, anchors, 640.0, 640.0, 0.5, &labels());
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].label, "normal");
        assert!((detections[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn decode_picks_best_class_label() {
        let (data, anchors) = block(&[vec![320.0, 320.0, 64.0, 64.0, 0.2, 0.8]]);
        let detections =
            decode_predictions(&data, 2, anchors, 640.0, 640.0, 0.5, &labels());
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].label, "tipped");
    }

    #[test]
    fn decode_normalizes_boxes() {
        let (data, anchors) = block(&[vec![320.0, 320.0, 128.0, 64.0, 0.9, 0.0]]);
        let detections =
            decode_predictions(&data, 2, anchors, 640.0, 640.0, 0.5, &labels());
        let d = &detections[0];
        assert!((d.x - 0.4).abs() < 1e-6);
        assert!((d.y - 0.45).abs() < 1e-6);
        assert!((d.w - 0.2).abs() < 1e-6);
        assert!((d.h - 0.1).abs() < 1e-6);
    }

    #[test]
    fn nms_suppresses_overlapping_same_label() {
        let mut a = Detection::labeled("normal", 0.9);
        a.x = 0.1;
        a.y = 0.1;
        a.w = 0.4;
        a.h = 0.4;
        let mut b = a.clone();
        b.confidence = 0.6;
        b.x = 0.12;

        let kept = non_max_suppression(vec![b.clone(), a.clone()], IOU_THRESHOLD);
        assert_eq!(kept.len(), 1);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn nms_keeps_overlapping_distinct_labels() {
        let mut a = Detection::labeled("normal", 0.9);
        a.x = 0.1;
        a.y = 0.1;
        a.w = 0.4;
        a.h = 0.4;
        let mut b = a.clone();
        b.label = "tipped".to_string();
        b.confidence = 0.6;

        let kept = non_max_suppression(vec![a, b], IOU_THRESHOLD);
        assert_eq!(kept.len(), 2);
    }
}
