//! cupwatch
//!
//! This crate implements a single-purpose notification relay for a camera-
//! monitored feeder cup. A gateway device uploads still frames over HTTP;
//! a pretrained object-detection model classifies the cup's state, and the
//! result fans out to an IoT message broker (device/dashboard state) and a
//! chat webhook (human alerting on the tipped condition).
//!
//! # Module Structure
//!
//! - `api`: HTTP ingress (`POST /upload`, `GET /health`)
//! - `detect`: detector backends behind the `DetectorBackend` trait
//! - `classify`: reduction of detections to one of three cup states
//! - `broker`: long-lived MQTT session with best-effort publish
//! - `alert`: fire-and-forget chat-webhook notifier
//! - `config`: file + environment configuration
//!
//! Request flow: upload → decode → detect → classify → {alert if tipped} +
//! broker publish → plain-text response. Nothing is persisted and nothing
//! is retried; broker or webhook failures degrade to logged warnings.

pub mod alert;
pub mod api;
pub mod broker;
pub mod classify;
pub mod config;
pub mod detect;

pub use alert::WebhookNotifier;
pub use broker::{BrokerPublisher, StatusPublisher};
pub use classify::{classify, Status, TIPPED_LABEL};
pub use config::CupwatchConfig;
pub use detect::{select_backend, Detection, DetectorBackend, StubBackend};

#[cfg(feature = "backend-tract")]
pub use detect::TractBackend;
