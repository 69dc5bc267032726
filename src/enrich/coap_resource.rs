//! CoAPResourceEnricher.
//!
//! `oic.d.<x>` resource types become `device_category`; observable
//! resources are surfaced as service entries so they show up alongside TCP
//! banners in the final fingerprint.

use std::time::Duration;

use crate::model::{DeviceInfo, ProtocolTag, ServiceEntry};

use super::Enricher;

pub struct CoapResourceEnricher;

#[async_trait::async_trait]
impl Enricher for CoapResourceEnricher {
    fn name(&self) -> &'static str {
        "coap_resource_enricher"
    }

    fn can_enrich(&self, device: &DeviceInfo) -> bool {
        device.protocol == ProtocolTag::Coap
    }

    async fn enrich(&self, device: &mut DeviceInfo, _timeout: Duration) -> anyhow::Result<()> {
        if let Some(rt) = device.raw_data.get("resource_type") {
            if let Some(category) = rt.strip_prefix("oic.d.") {
                DeviceInfo::fill_if_empty(&mut device.device_category, Some(category.to_string()));
            }
        }

        let observable_uris: Vec<String> = device
            .raw_data
            .get("observable_resources")
            .map(|v| v.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();

        if let Some(port) = device.port {
            for uri in &observable_uris {
                device.services.push(ServiceEntry {
                    port,
                    name: format!("CoAP {uri}"),
                    banner: String::new(),
                    tls: false,
                    tls_version: None,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn oic_resource_type_sets_device_category() {
        let mut device = DeviceInfo::new(ProtocolTag::Coap, "10.0.0.21");
        let mut raw = BTreeMap::new();
        raw.insert("resource_type".to_string(), "oic.d.sensor".to_string());
        device.raw_data = raw;

        let enricher = CoapResourceEnricher;
        enricher.enrich(&mut device, Duration::from_secs(1)).await.unwrap();

        assert_eq!(device.device_category.as_deref(), Some("sensor"));
    }
}
