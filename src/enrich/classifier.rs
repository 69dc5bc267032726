//! DeviceClassifier. Must run last in the pipeline, once every other stage
//! has had a chance to add manufacturer/model/firmware/tag hints to the
//! device.
//!
//! Rules are walked in descending priority order; the first whose patterns
//! match anywhere in the device's accumulated text wins.

use std::sync::LazyLock;
use std::time::Duration;

use crate::model::DeviceInfo;

use super::Enricher;

struct TaxonomyRule {
    category: &'static str,
    tags: &'static [&'static str],
    patterns: &'static [&'static str],
    priority: u8,
}

static RULES: LazyLock<Vec<TaxonomyRule>> = LazyLock::new(|| {
    let mut rules = vec![
        TaxonomyRule {
            category: "camera",
            tags: &["surveillance", "video"],
            patterns: &["hikvision", "dahua", "axis", "onvif", "ipcam", "ip camera", "surveillance", "nvr"],
            priority: 10,
        },
        TaxonomyRule {
            category: "nas",
            tags: &["storage"],
            patterns: &["synology", "qnap", "truenas", "freenas", "diskstation"],
            priority: 9,
        },
        TaxonomyRule {
            category: "printer",
            tags: &["office"],
            patterns: &["hp ", "laserjet", "canon", "epson", "ipp", "printer", "brother"],
            priority: 8,
        },
        TaxonomyRule {
            category: "smart-home-hub",
            tags: &["smart-home"],
            patterns: &["hub", "smartthings", "home assistant", "homekit", "zigbee", "z-wave"],
            priority: 7,
        },
        TaxonomyRule {
            category: "mqtt-broker",
            tags: &["messaging"],
            patterns: &["mosquitto", "emqx", "hivemq", "vernemq", "rabbitmq", "broker"],
            priority: 7,
        },
        TaxonomyRule {
            category: "coap-device",
            tags: &["iot"],
            patterns: &["coap", "oic.d.", "oic.r."],
            priority: 6,
        },
        TaxonomyRule {
            category: "media",
            tags: &["media"],
            patterns: &["dlna", "chromecast", "plex", "sonos", "media server", "upnp-av"],
            priority: 5,
        },
        TaxonomyRule {
            category: "router",
            tags: &["network"],
            patterns: &["router", "gateway", "mikrotik", "openwrt", "dd-wrt", "routeros"],
            priority: 5,
        },
        TaxonomyRule {
            category: "smart-speaker",
            tags: &["smart-home", "voice"],
            patterns: &["alexa", "echo", "google home", "nest mini", "homepod"],
            priority: 4,
        },
        TaxonomyRule {
            category: "industrial",
            tags: &["ics"],
            patterns: &["plc", "scada", "modbus", "profinet"],
            priority: 4,
        },
        TaxonomyRule {
            category: "smart-tv",
            tags: &["media"],
            patterns: &["roku", "tizen", "webos", "android tv", "smart tv"],
            priority: 3,
        },
        TaxonomyRule {
            category: "iot-device",
            tags: &["iot"],
            patterns: &["esp32", "esp8266", "arduino", "iot"],
            priority: 2,
        },
        TaxonomyRule {
            category: "computer",
            tags: &[],
            patterns: &["windows", "macos", "ubuntu", "debian", "workstation"],
            priority: 1,
        },
    ];
    rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    rules
});

pub struct DeviceClassifier;

#[async_trait::async_trait]
impl Enricher for DeviceClassifier {
    fn name(&self) -> &'static str {
        "device_classifier"
    }

    fn can_enrich(&self, _device: &DeviceInfo) -> bool {
        true
    }

    async fn enrich(&self, device: &mut DeviceInfo, _timeout: Duration) -> anyhow::Result<()> {
        let blob = build_search_blob(device);

        for rule in RULES.iter() {
            if rule.patterns.iter().any(|p| blob.contains(*p)) {
                DeviceInfo::fill_if_empty(&mut device.device_category, Some(rule.category.to_string()));
                for tag in rule.tags {
                    device.add_tag(*tag);
                }
                return Ok(());
            }
        }

        DeviceInfo::fill_if_empty(&mut device.device_category, Some("unknown".to_string()));
        Ok(())
    }
}

/// Concatenates every textual field that might carry a classification hint
/// into one lowercased blob, so rule patterns only need to be checked once.
fn build_search_blob(device: &DeviceInfo) -> String {
    let mut parts: Vec<String> = Vec::new();
    parts.extend(device.friendly_name.clone());
    parts.extend(device.manufacturer.clone());
    parts.extend(device.model.clone());
    parts.extend(device.firmware_version.clone());
    parts.extend(device.os_guess.clone());
    parts.extend(device.device_tags.iter().cloned());
    parts.extend(device.raw_data.values().cloned());
    parts.extend(device.banners.values().cloned());
    for service in &device.services {
        parts.push(service.name.clone());
        parts.push(service.banner.clone());
    }
    parts.join(" \u{2423} ").to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProtocolTag;

    #[tokio::test]
    async fn hikvision_server_header_classifies_as_camera() {
        let mut device = DeviceInfo::new(ProtocolTag::Upnp, "10.0.0.5");
        device.raw_data.insert("SERVER".to_string(), "Linux/3.10 UPnP/1.0 Hikvision/1.0".to_string());

        let classifier = DeviceClassifier;
        classifier.enrich(&mut device, Duration::from_secs(1)).await.unwrap();

        assert_eq!(device.device_category.as_deref(), Some("camera"));
        assert!(device.device_tags.contains(&"surveillance".to_string()));
    }

    #[tokio::test]
    async fn mosquitto_broker_classifies_as_mqtt_broker() {
        let mut device = DeviceInfo::new(ProtocolTag::Mqtt, "10.0.0.11");
        device.firmware_version = Some("mosquitto version 2.0.15".to_string());

        let classifier = DeviceClassifier;
        classifier.enrich(&mut device, Duration::from_secs(1)).await.unwrap();

        assert_eq!(device.device_category.as_deref(), Some("mqtt-broker"));
    }

    #[tokio::test]
    async fn unmatched_device_gets_unknown_category() {
        let mut device = DeviceInfo::new(ProtocolTag::Coap, "10.0.0.99");

        let classifier = DeviceClassifier;
        classifier.enrich(&mut device, Duration::from_secs(1)).await.unwrap();

        assert_eq!(device.device_category.as_deref(), Some("unknown"));
    }

    #[tokio::test]
    async fn does_not_clobber_an_existing_category() {
        let mut device = DeviceInfo::new(ProtocolTag::Coap, "10.0.0.21");
        device.device_category = Some("sensor".to_string());
        device.raw_data.insert("resource_type".to_string(), "oic.d.sensor".to_string());

        let classifier = DeviceClassifier;
        classifier.enrich(&mut device, Duration::from_secs(1)).await.unwrap();

        assert_eq!(device.device_category.as_deref(), Some("sensor"));
    }
}
