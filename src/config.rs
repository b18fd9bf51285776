use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:5001";
const DEFAULT_BROKER_HOST: &str = "broker.netpie.io";
const DEFAULT_BROKER_PORT: u16 = 1883;
const DEFAULT_BROKER_TOPIC: &str = "@msg/status";
const DEFAULT_BROKER_CLIENT_ID: &str = "cupwatch";
const DEFAULT_WEBHOOK_USERNAME: &str = "Feeder Alert Bot";
const DEFAULT_INPUT_WIDTH: u32 = 640;
const DEFAULT_INPUT_HEIGHT: u32 = 640;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

#[derive(Debug, Deserialize, Default)]
struct CupwatchConfigFile {
    http: Option<HttpConfigFile>,
    broker: Option<BrokerConfigFile>,
    webhook: Option<WebhookConfigFile>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct HttpConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct BrokerConfigFile {
    host: Option<String>,
    port: Option<u16>,
    client_id: Option<String>,
    token: Option<String>,
    secret: Option<String>,
    topic: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WebhookConfigFile {
    url: Option<String>,
    username: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    model_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    confidence_threshold: Option<f32>,
    labels: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct CupwatchConfig {
    pub http: HttpSettings,
    pub broker: BrokerSettings,
    pub webhook: WebhookSettings,
    pub detector: DetectorSettings,
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub addr: String,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub token: String,
    pub secret: String,
    pub topic: String,
}

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    /// Empty string disables webhook alerts.
    pub url: String,
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub model_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
    pub confidence_threshold: f32,
    pub labels: Vec<String>,
}

impl CupwatchConfig {
    /// Load configuration from an optional file, then apply env overrides.
    ///
    /// The file path comes from the argument or `CUPWATCH_CONFIG`; with
    /// neither set, the defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("CUPWATCH_CONFIG").ok();
        let resolved = path.or_else(|| env_path.as_deref().map(Path::new));
        let file_cfg = match resolved {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CupwatchConfigFile) -> Self {
        let http = HttpSettings {
            addr: file
                .http
                .and_then(|http| http.addr)
                .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string()),
        };
        let broker = {
            let broker = file.broker.unwrap_or_default();
            BrokerSettings {
                host: broker
                    .host
                    .unwrap_or_else(|| DEFAULT_BROKER_HOST.to_string()),
                port: broker.port.unwrap_or(DEFAULT_BROKER_PORT),
                client_id: broker
                    .client_id
                    .unwrap_or_else(|| DEFAULT_BROKER_CLIENT_ID.to_string()),
                token: broker.token.unwrap_or_default(),
                secret: broker.secret.unwrap_or_default(),
                topic: broker
                    .topic
                    .unwrap_or_else(|| DEFAULT_BROKER_TOPIC.to_string()),
            }
        };
        let webhook = {
            let webhook = file.webhook.unwrap_or_default();
            WebhookSettings {
                url: webhook.url.unwrap_or_default(),
                username: webhook
                    .username
                    .unwrap_or_else(|| DEFAULT_WEBHOOK_USERNAME.to_string()),
            }
        };
        let detector = {
            let detector = file.detector.unwrap_or_default();
            DetectorSettings {
                model_path: detector.model_path,
                input_width: detector.input_width.unwrap_or(DEFAULT_INPUT_WIDTH),
                input_height: detector.input_height.unwrap_or(DEFAULT_INPUT_HEIGHT),
                confidence_threshold: detector
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                labels: detector
                    .labels
                    .unwrap_or_else(|| vec!["normal".to_string(), "tipped".to_string()]),
            }
        };
        Self {
            http,
            broker,
            webhook,
            detector,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("CUPWATCH_HTTP_ADDR") {
            if !addr.trim().is_empty() {
                self.http.addr = addr;
            }
        }
        if let Ok(host) = std::env::var("CUPWATCH_BROKER_HOST") {
            if !host.trim().is_empty() {
                self.broker.host = host;
            }
        }
        if let Ok(port) = std::env::var("CUPWATCH_BROKER_PORT") {
            self.broker.port = port
                .parse()
                .map_err(|_| anyhow!("CUPWATCH_BROKER_PORT must be a port number"))?;
        }
        if let Ok(client_id) = std::env::var("CUPWATCH_BROKER_CLIENT_ID") {
            if !client_id.trim().is_empty() {
                self.broker.client_id = client_id;
            }
        }
        if let Ok(token) = std::env::var("CUPWATCH_BROKER_TOKEN") {
            if !token.trim().is_empty() {
                self.broker.token = token;
            }
        }
        if let Ok(secret) = std::env::var("CUPWATCH_BROKER_SECRET") {
            if !secret.trim().is_empty() {
                self.broker.secret = secret;
            }
        }
        if let Ok(topic) = std::env::var("CUPWATCH_BROKER_TOPIC") {
            if !topic.trim().is_empty() {
                self.broker.topic = topic;
            }
        }
        if let Ok(url) = std::env::var("CUPWATCH_WEBHOOK_URL") {
            if !url.trim().is_empty() {
                self.webhook.url = url;
            }
        }
        if let Ok(username) = std::env::var("CUPWATCH_WEBHOOK_USERNAME") {
            if !username.trim().is_empty() {
                self.webhook.username = username;
            }
        }
        if let Ok(path) = std::env::var("CUPWATCH_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.detector.model_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(threshold) = std::env::var("CUPWATCH_CONFIDENCE_THRESHOLD") {
            self.detector.confidence_threshold = threshold
                .parse()
                .map_err(|_| anyhow!("CUPWATCH_CONFIDENCE_THRESHOLD must be a number"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.http
            .addr
            .parse::<SocketAddr>()
            .map_err(|_| anyhow!("http addr '{}' is not a socket address", self.http.addr))?;

        if self.broker.host.trim().is_empty() {
            return Err(anyhow!("broker host must not be empty"));
        }
        if self.broker.port == 0 {
            return Err(anyhow!("broker port must be nonzero"));
        }
        if self.broker.topic.trim().is_empty() {
            return Err(anyhow!("broker topic must not be empty"));
        }
        if self.broker.client_id.trim().is_empty() {
            return Err(anyhow!("broker client id must not be empty"));
        }

        if !self.webhook.url.is_empty() {
            let url = Url::parse(&self.webhook.url)
                .map_err(|e| anyhow!("webhook url is invalid: {}", e))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(anyhow!(
                    "webhook url scheme '{}' is not http(s)",
                    url.scheme()
                ));
            }
        }

        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            return Err(anyhow!("confidence threshold must be within [0, 1]"));
        }
        if self.detector.model_path.is_some() {
            if self.detector.labels.is_empty() {
                return Err(anyhow!("detector labels must not be empty when a model is set"));
            }
            if self.detector.input_width == 0 || self.detector.input_height == 0 {
                return Err(anyhow!("detector input size must be nonzero"));
            }
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<CupwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
