//! MDNSTxtEnricher.
//!
//! Maps well-known TXT keys onto `DeviceInfo` fields. Values are decoded
//! UTF-8 lossy since TXT record bytes are arbitrary and never trusted to be
//! valid UTF-8.

use std::time::Duration;

use crate::model::{DeviceInfo, ProtocolTag};

use super::Enricher;

const MANUFACTURER_KEYS: &[&str] = &["manufacturer", "usb_mfg", "vendor"];
const MODEL_KEYS: &[&str] = &["ty", "model", "product", "usb_mdl"];
const FIRMWARE_KEYS: &[&str] = &["fv", "firmware", "sw", "txtvers"];
const SERIAL_KEYS: &[&str] = &["serialnumber", "sn"];
const URL_KEYS: &[&str] = &["adminurl", "url"];

pub struct MdnsTxtEnricher;

#[async_trait::async_trait]
impl Enricher for MdnsTxtEnricher {
    fn name(&self) -> &'static str {
        "mdns_txt_enricher"
    }

    fn can_enrich(&self, device: &DeviceInfo) -> bool {
        device.protocol == ProtocolTag::Mdns && !device.raw_data.is_empty()
    }

    async fn enrich(&self, device: &mut DeviceInfo, _timeout: Duration) -> anyhow::Result<()> {
        DeviceInfo::fill_if_empty(&mut device.manufacturer, find_first(&device.raw_data, MANUFACTURER_KEYS));
        DeviceInfo::fill_if_empty(&mut device.model, find_first(&device.raw_data, MODEL_KEYS));
        DeviceInfo::fill_if_empty(&mut device.firmware_version, find_first(&device.raw_data, FIRMWARE_KEYS));
        DeviceInfo::fill_if_empty(&mut device.serial_number, find_first(&device.raw_data, SERIAL_KEYS));
        DeviceInfo::fill_if_empty(&mut device.device_url, find_first(&device.raw_data, URL_KEYS));
        Ok(())
    }
}

fn find_first(raw_data: &std::collections::BTreeMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        raw_data
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.clone())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn maps_printer_txt_keys() {
        let mut device = DeviceInfo::new(ProtocolTag::Mdns, "10.0.0.9");
        let mut raw = BTreeMap::new();
        raw.insert("ty".to_string(), "HP LaserJet M15w".to_string());
        raw.insert("usb_MFG".to_string(), "HP".to_string());
        device.raw_data = raw;

        let enricher = MdnsTxtEnricher;
        enricher.enrich(&mut device, Duration::from_secs(1)).await.unwrap();

        assert_eq!(device.model.as_deref(), Some("HP LaserJet M15w"));
        assert_eq!(device.manufacturer.as_deref(), Some("HP"));
    }
}
