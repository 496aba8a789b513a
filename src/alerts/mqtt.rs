use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{Alert, AlertSink};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl MqttEndpoint {
    /// Accepts `host:port`, `[v6]:port`, or either with an
    /// `mqtt://`, `tcp://`, `mqtts://` or `ssl://` scheme.
    pub fn parse(addr: &str) -> Result<Self> {
        let mut use_tls = false;
        let mut remainder = addr.trim();
        if let Some((scheme, rest)) = remainder.split_once("://") {
            match scheme {
                "mqtt" | "tcp" => {}
                "mqtts" | "ssl" => use_tls = true,
                other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
            }
            remainder = rest;
        }
        let (host, port) = split_host_port(remainder)?;
        if host.is_empty() {
            return Err(anyhow!("missing MQTT host in {}", addr));
        }
        Ok(Self {
            host,
            port,
            use_tls,
        })
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port.parse().context("invalid MQTT port")?;
        return Ok((host.to_string(), port));
    }
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port.parse().context("invalid MQTT port")?;
    Ok((host.to_string(), port))
}

/// Publishes alerts as JSON to `<topic>/<zone kind>` with QoS 1.
pub struct MqttSink {
    client: Client,
    topic: String,
    stopping: Arc<AtomicBool>,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttSink {
    pub fn connect(endpoint: &MqttEndpoint, topic: &str, client_id: &str) -> Result<Self> {
        let mut options = MqttOptions::new(client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        let (client, connection) = Client::new(options, 32);
        let stopping = Arc::new(AtomicBool::new(false));
        let connection_handle = spawn_connection(connection, stopping.clone())?;
        log::info!(
            "alert MQTT sink -> {}:{} topic {} (TLS: {})",
            endpoint.host,
            endpoint.port,
            topic,
            endpoint.use_tls
        );
        Ok(Self {
            client,
            topic: topic.trim_end_matches('/').to_string(),
            stopping,
            connection_handle: Some(connection_handle),
        })
    }

    pub fn topic_for(&self, alert: &Alert) -> String {
        format!("{}/{}", self.topic, alert.zone_kind.as_str())
    }
}

fn spawn_connection(mut connection: Connection, stopping: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("alert-mqtt".to_string())
        .spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        if stopping.load(Ordering::SeqCst) {
                            break;
                        }
                        log::warn!("MQTT connection error: {}", e);
                        std::thread::sleep(Duration::from_secs(1));
                    }
                }
            }
        })
        .map_err(|e| anyhow!("failed to spawn MQTT connection thread: {}", e))
}

impl AlertSink for MqttSink {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn send(&mut self, alert: &Alert) -> Result<()> {
        let payload = serde_json::to_vec(alert)?;
        self.client
            .try_publish(self.topic_for(alert), QoS::AtLeastOnce, false, payload)
            .map_err(|e| anyhow!("MQTT publish failed: {}", e))
    }

    fn close(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect() {
            log::debug!("MQTT disconnect: {}", e);
        }
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
    }
}
