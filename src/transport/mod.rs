//! Outbound notifications about persisted captures.

pub mod mqtt;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

pub use mqtt::{MqttConfig, MqttNotifier};

/// Broker address after scheme handling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse MQTT endpoint from address string.
///
/// Supports formats:
/// - `host:port` (plain TCP or TLS based on tls_override)
/// - `mqtt://host:port` / `tcp://host:port` (plain TCP)
/// - `mqtts://host:port` / `ssl://host:port` (TLS)
/// - `[ipv6]:port`
pub fn parse_mqtt_endpoint(addr: &str, tls_override: bool) -> Result<MqttEndpoint> {
    let mut use_tls = tls_override;
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
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}

/// Published once a capture is persisted. Never carries image bytes.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CaptureNotice {
    pub capture_id: String,
    pub camera_id: String,
    pub plate: Option<String>,
    pub confidence: f32,
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
}

pub trait CaptureNotifier: Send {
    fn notify(&mut self, notice: &CaptureNotice) -> Result<()>;

    /// Flush and close. Called once by the dispatcher on shutdown.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_endpoint_plain() -> Result<()> {
        let ep = parse_mqtt_endpoint("127.0.0.1:1883", false)?;
        assert_eq!(ep.host, "127.0.0.1");
        assert_eq!(ep.port, 1883);
        assert!(!ep.use_tls);
        Ok(())
    }

    #[test]
    fn parse_endpoint_schemes() -> Result<()> {
        let ep = parse_mqtt_endpoint("mqtts://broker.example.com:8883", false)?;
        assert_eq!(ep.host, "broker.example.com");
        assert!(ep.use_tls);
        assert!(!parse_mqtt_endpoint("tcp://broker:1883", false)?.use_tls);
        assert!(parse_mqtt_endpoint("ws://broker:1883", false).is_err());
        Ok(())
    }

    #[test]
    fn parse_endpoint_ipv6_and_errors() -> Result<()> {
        let ep = parse_mqtt_endpoint("[::1]:1883", false)?;
        assert_eq!(ep.host, "::1");
        assert!(parse_mqtt_endpoint("broker", false).is_err());
        assert!(parse_mqtt_endpoint("broker:notaport", false).is_err());
        assert!(parse_mqtt_endpoint(":1883", false).is_err());
        Ok(())
    }

    #[test]
    fn notice_json_shape() -> Result<()> {
        let notice = CaptureNotice {
            capture_id: "abc".to_string(),
            camera_id: "cam-1".to_string(),
            plate: Some("AB1234".to_string()),
            confidence: 0.5,
            timestamp_ms: 42,
            supersedes: None,
        };
        let v: serde_json::Value = serde_json::to_value(&notice)?;
        assert_eq!(v["plate"], "AB1234");
        assert_eq!(v["timestamp_ms"], 42);
        assert!(v.get("supersedes").is_none());
        Ok(())
    }
}
