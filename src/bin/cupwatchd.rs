//! cupwatchd - feeder cup monitoring daemon.
//!
//! This daemon:
//! 1. Loads the detection model (or the stub backend when none is configured)
//! 2. Maintains the broker session on a background thread
//! 3. Serves the upload endpoint until Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use cupwatch::api::{ApiConfig, ApiServer, AppContext};
use cupwatch::{BrokerPublisher, CupwatchConfig, WebhookNotifier};

#[derive(Parser, Debug)]
#[command(author, version, about = "Feeder cup monitoring daemon")]
struct Args {
    /// Path to the JSON config file.
    #[arg(long, env = "CUPWATCH_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = CupwatchConfig::load(args.config.as_deref())?;

    let detector = cupwatch::select_backend(&config.detector)?;
    log::info!("detector backend: {}", detector.name());

    let broker = Arc::new(BrokerPublisher::connect(&config.broker));
    let notifier = WebhookNotifier::new(&config.webhook);

    let ctx = AppContext {
        detector,
        publisher: broker.clone(),
        notifier,
    };
    let api_config = ApiConfig {
        addr: config.http.addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, ctx).spawn()?;
    log::info!("upload endpoint listening on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("cupwatchd running. waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping upload server...");
    api_handle.stop()?;
    match Arc::try_unwrap(broker) {
        Ok(broker) => broker.disconnect()?,
        Err(_) => log::warn!("broker session still shared at shutdown"),
    }

    Ok(())
}
