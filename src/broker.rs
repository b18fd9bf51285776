use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use rumqttc::{Client, Connection, ConnectReturnCode, Event, MqttOptions, Packet, QoS};

use crate::config::BrokerSettings;

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Outbound seam for status strings, so request handling does not depend on
/// a live broker session.
pub trait StatusPublisher: Send + Sync {
    /// Best-effort publish of one status string. Never fails the caller.
    fn publish_status(&self, status: &str);
}

/// One process-wide MQTT session.
///
/// The connection event loop runs on its own thread for the process
/// lifetime; request handlers only read the connectivity flag and enqueue
/// publishes. A broker that is down leaves the flag false and turns every
/// publish into a logged no-op.
pub struct BrokerPublisher {
    client: Client,
    topic: String,
    connected: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    connection_handle: Option<JoinHandle<()>>,
}

impl BrokerPublisher {
    /// Build the session and start the connection thread.
    ///
    /// Never blocks on the network: connect failures surface inside the
    /// background loop as warnings while the connected flag stays false.
    pub fn connect(settings: &BrokerSettings) -> Self {
        let mut options =
            MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(KEEP_ALIVE);
        if !settings.token.is_empty() {
            options.set_credentials(&settings.token, &settings.secret);
        }

        let (client, connection) = Client::new(options, 10);
        let connected = Arc::new(AtomicBool::new(false));
        let stopping = Arc::new(AtomicBool::new(false));
        let handle = spawn_connection_loop(connection, connected.clone(), stopping.clone());

        Self {
            client,
            topic: settings.topic.clone(),
            connected,
            stopping,
            connection_handle: Some(handle),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Best-effort publish. Skipped with a warning while disconnected; a
    /// full request queue is logged and dropped, never retried.
    pub fn publish(&self, topic: &str, payload: &str) {
        if !self.is_connected() {
            log::warn!("broker not connected; dropping publish to {}", topic);
            return;
        }
        if let Err(e) = self
            .client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
        {
            log::warn!("broker publish to {} failed: {}", topic, e);
        }
    }

    /// Disconnect and join the connection thread.
    pub fn disconnect(mut self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.client.disconnect();
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl StatusPublisher for BrokerPublisher {
    fn publish_status(&self, status: &str) {
        self.publish(&self.topic, status);
    }
}

fn spawn_connection_loop(
    mut connection: Connection,
    connected: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        connected.store(true, Ordering::SeqCst);
                        log::info!("connected to broker");
                    } else {
                        connected.store(false, Ordering::SeqCst);
                        log::warn!("broker refused connection: {:?}", ack.code);
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    connected.store(false, Ordering::SeqCst);
                    log::warn!("broker closed the connection");
                }
                Ok(_) => {}
                Err(e) => {
                    connected.store(false, Ordering::SeqCst);
                    if stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    log::warn!("broker connection error: {}", e);
                    std::thread::sleep(RECONNECT_DELAY);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_settings() -> BrokerSettings {
        BrokerSettings {
            host: "127.0.0.1".to_string(),
            // reserved port nothing listens on
            port: 1,
            client_id: "cupwatch-test".to_string(),
            token: String::new(),
            secret: String::new(),
            topic: "@msg/status".to_string(),
        }
    }

    #[test]
    fn publish_while_disconnected_is_a_no_op() {
        let publisher = BrokerPublisher::connect(&unreachable_settings());
        assert!(!publisher.is_connected());
        // must not panic or block
        publisher.publish("@msg/status", "normal");
        publisher.publish_status("tipped");
        publisher.disconnect().unwrap();
    }
}
