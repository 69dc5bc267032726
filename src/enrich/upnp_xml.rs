//! UPnPDeepEnricher.
//!
//! Re-fetches the device's LOCATION under the same SSRF rules the discovery
//! engine itself uses (`engines::upnp::fetch_root_desc`), then copies the
//! full metadata set onto the device — manufacturer, model, firmware,
//! serial, URLs — anything the bare M-SEARCH response didn't carry.

use std::time::Duration;

use url::Url;

use crate::engines::upnp::fetch_root_desc;
use crate::model::DeviceInfo;

use super::Enricher;

pub struct UpnpDeepEnricher;

#[async_trait::async_trait]
impl Enricher for UpnpDeepEnricher {
    fn name(&self) -> &'static str {
        "upnp_deep_enricher"
    }

    fn can_enrich(&self, device: &DeviceInfo) -> bool {
        device.protocol == crate::model::ProtocolTag::Upnp && device.raw_data.contains_key("LOCATION")
    }

    async fn enrich(&self, device: &mut DeviceInfo, _timeout: Duration) -> anyhow::Result<()> {
        let location = device
            .raw_data
            .get("LOCATION")
            .ok_or_else(|| anyhow::anyhow!("no LOCATION header on device"))?;
        let url = Url::parse(location)?;

        let root = fetch_root_desc(&url).await?;
        let Some(dev) = root.devices.first() else {
            return Ok(());
        };

        DeviceInfo::fill_if_empty(&mut device.friendly_name, non_empty(dev.friendly_name.clone()));
        DeviceInfo::fill_if_empty(&mut device.manufacturer, dev.manufacturer.clone());
        DeviceInfo::fill_if_empty(&mut device.model, dev.model_name.clone());
        DeviceInfo::fill_if_empty(&mut device.firmware_version, dev.firmware_version.clone());
        DeviceInfo::fill_if_empty(&mut device.serial_number, dev.serial_number.clone());
        DeviceInfo::fill_if_empty(&mut device.device_url, dev.presentation_url.clone());
        Ok(())
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProtocolTag;

    #[test]
    fn requires_location_header() {
        let enricher = UpnpDeepEnricher;
        let device = DeviceInfo::new(ProtocolTag::Upnp, "10.0.0.5");
        assert!(!enricher.can_enrich(&device));
    }
}
