use anyhow::{anyhow, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{parse_mqtt_endpoint, CaptureNotice, CaptureNotifier, MqttEndpoint};

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker address; notifications are off when unset.
    pub addr: Option<String>,
    pub topic_prefix: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            addr: None,
            topic_prefix: "plate_capture".to_string(),
            client_id: "captured".to_string(),
            username: None,
            password: None,
            use_tls: false,
        }
    }
}

impl MqttConfig {
    pub fn endpoint(&self) -> Result<Option<MqttEndpoint>> {
        self.addr
            .as_deref()
            .map(|addr| parse_mqtt_endpoint(addr, self.use_tls))
            .transpose()
    }

    pub fn validate(&self) -> Result<()> {
        self.endpoint()?;
        if self.topic_prefix.is_empty() || self.topic_prefix.contains(['+', '#']) {
            return Err(anyhow!(
                "mqtt.topic_prefix must be non-empty and free of wildcards"
            ));
        }
        Ok(())
    }
}

pub fn capture_topic(prefix: &str, camera_id: &str) -> String {
    format!("{}/captures/{}", prefix.trim_end_matches('/'), camera_id)
}

/// QoS 1 publisher for capture notices. The event loop runs on its own thread
/// and keeps reconnecting until `close`.
pub struct MqttNotifier {
    client: Client,
    prefix: String,
    stopping: Arc<AtomicBool>,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttNotifier {
    pub fn connect(config: &MqttConfig) -> Result<Self> {
        let endpoint = config
            .endpoint()?
            .ok_or_else(|| anyhow!("mqtt.addr is not set"))?;
        let mut options = MqttOptions::new(&config.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = config.username.as_deref() {
            options.set_credentials(user, config.password.clone().unwrap_or_default());
        }
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, 64);
        let stopping = Arc::new(AtomicBool::new(false));
        let handle = spawn_event_loop(connection, stopping.clone());
        log::info!(
            "MQTT notifier for {}:{} (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            config.username.is_some()
        );
        Ok(Self {
            client,
            prefix: config.topic_prefix.clone(),
            stopping,
            connection_handle: Some(handle),
        })
    }
}

fn spawn_event_loop(mut connection: Connection, stopping: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::spawn(move || {
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
}

impl CaptureNotifier for MqttNotifier {
    fn notify(&mut self, notice: &CaptureNotice) -> Result<()> {
        let topic = capture_topic(&self.prefix, &notice.camera_id);
        let payload = serde_json::to_vec(notice)?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        let result = self.client.disconnect();
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
        result?;
        Ok(())
    }
}
