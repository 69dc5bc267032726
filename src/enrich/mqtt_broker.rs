//! MQTTBrokerEnricher.
//!
//! Pattern-matches the `$SYS/broker/version` string captured during
//! discovery against known broker products, and records the broker as a
//! service entry the same way `BannerGrabber` records TCP services.

use std::time::Duration;

use crate::model::{DeviceInfo, ProtocolTag, ServiceEntry};

use super::Enricher;

const BROKER_PATTERNS: &[(&str, &str)] = &[
    ("mosquitto", "Mosquitto"),
    ("emqx", "EMQX"),
    ("hivemq", "HiveMQ"),
    ("vernemq", "VerneMQ"),
    ("rabbitmq", "RabbitMQ"),
];

pub struct MqttBrokerEnricher;

#[async_trait::async_trait]
impl Enricher for MqttBrokerEnricher {
    fn name(&self) -> &'static str {
        "mqtt_broker_enricher"
    }

    fn can_enrich(&self, device: &DeviceInfo) -> bool {
        device.protocol == ProtocolTag::Mqtt
    }

    async fn enrich(&self, device: &mut DeviceInfo, _timeout: Duration) -> anyhow::Result<()> {
        if let Some(version) = device.raw_data.get("broker_version").cloned() {
            let lower = version.to_ascii_lowercase();
            if let Some((_, product)) = BROKER_PATTERNS.iter().find(|(needle, _)| lower.contains(*needle)) {
                DeviceInfo::fill_if_empty(&mut device.manufacturer, Some(product.to_string()));
                DeviceInfo::fill_if_empty(&mut device.model, Some(product.to_string()));
            }
            DeviceInfo::fill_if_empty(&mut device.firmware_version, Some(version));
        }

        if let Some(port) = device.port {
            device.services.push(ServiceEntry {
                port,
                name: "MQTT".to_string(),
                banner: String::new(),
                tls: device.raw_data.get("tls_supported").is_some_and(|v| v == "true"),
                tls_version: None,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn mosquitto_version_maps_to_product_name() {
        let mut device = DeviceInfo::new(ProtocolTag::Mqtt, "10.0.0.11");
        let mut raw = BTreeMap::new();
        raw.insert("broker_version".to_string(), "mosquitto version 2.0.15".to_string());
        device.raw_data = raw;
        device.port = Some(1883);

        let enricher = MqttBrokerEnricher;
        enricher.enrich(&mut device, Duration::from_secs(1)).await.unwrap();

        assert_eq!(device.manufacturer.as_deref(), Some("Mosquitto"));
        assert_eq!(device.firmware_version.as_deref(), Some("mosquitto version 2.0.15"));
    }
}
