//! WSDMetadataEnricher.
//!
//! Pulls `d:Types`/`d:Scopes`/`d:XAddrs` text content out of the raw SOAP
//! envelope without a full XML parse — WS-Discovery responses vary too much
//! in namespace prefixing to be worth a strict schema, so this matches the
//! element by local name instead. Scope URIs under the ONVIF namespace are
//! further dissected into manufacturer/model/hardware hints.

use std::time::Duration;

use regex::Regex;

use crate::model::{DeviceInfo, ProtocolTag};

use super::Enricher;

pub struct WsdMetadataEnricher;

#[async_trait::async_trait]
impl Enricher for WsdMetadataEnricher {
    fn name(&self) -> &'static str {
        "wsd_metadata_enricher"
    }

    fn can_enrich(&self, device: &DeviceInfo) -> bool {
        device.protocol == ProtocolTag::Wsd && device.raw_data.contains_key("raw_response")
    }

    async fn enrich(&self, device: &mut DeviceInfo, _timeout: Duration) -> anyhow::Result<()> {
        let Some(raw) = device.raw_data.get("raw_response").cloned() else {
            return Ok(());
        };

        if let Some(scopes) = extract_element_text(&raw, "Scopes") {
            for scope in scopes.split_whitespace() {
                apply_onvif_scope(device, scope);
            }
        }

        if let Some(types) = extract_element_text(&raw, "Types") {
            for ty in types.split_whitespace() {
                device.add_tag(ty.to_string());
            }
        }

        if let Some(xaddrs) = extract_element_text(&raw, "XAddrs") {
            let first = xaddrs.split_whitespace().next().map(str::to_string);
            DeviceInfo::fill_if_empty(&mut device.device_url, first);
        }
        Ok(())
    }
}

/// Extracts the text content of the first `<*:Tag>...</*:Tag>` element,
/// regardless of namespace prefix.
fn extract_element_text(xml: &str, tag: &str) -> Option<String> {
    let pattern = format!(r"(?s)<(?:\w+:)?{tag}[^>]*>(.*?)</(?:\w+:)?{tag}>", tag = regex::escape(tag));
    let re = Regex::new(&pattern).ok()?;
    re.captures(xml).map(|c| c[1].trim().to_string())
}

fn apply_onvif_scope(device: &mut DeviceInfo, scope: &str) {
    if let Some(name) = scope.strip_prefix("onvif://www.onvif.org/name/") {
        let decoded = percent_decode(name);
        DeviceInfo::fill_if_empty(&mut device.friendly_name, Some(decoded));
    } else if let Some(hardware) = scope.strip_prefix("onvif://www.onvif.org/hardware/") {
        let decoded = percent_decode(hardware);
        DeviceInfo::fill_if_empty(&mut device.model, Some(decoded));
    } else if let Some(kind) = scope.strip_prefix("onvif://www.onvif.org/type/") {
        device.add_tag(percent_decode(kind));
    }
}

/// Decodes `%XX` percent-escapes; anything else passes through unchanged.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn camera_scope_sets_friendly_name_and_model() {
        let raw = r#"<e:Envelope xmlns:e="http://www.w3.org/2003/05/soap-envelope"
            xmlns:d="http://schemas.xmlsoap.org/ws/2005/04/discovery">
          <e:Body><d:ProbeMatches><d:ProbeMatch>
            <d:Scopes>onvif://www.onvif.org/name/Camera%20A onvif://www.onvif.org/hardware/AXIS-P1344</d:Scopes>
          </d:ProbeMatch></d:ProbeMatches></e:Body>
        </e:Envelope>"#;

        let mut device = DeviceInfo::new(ProtocolTag::Wsd, "10.0.0.7");
        let mut raw_data = BTreeMap::new();
        raw_data.insert("raw_response".to_string(), raw.to_string());
        device.raw_data = raw_data;

        let enricher = WsdMetadataEnricher;
        enricher.enrich(&mut device, Duration::from_secs(1)).await.unwrap();

        assert_eq!(device.friendly_name.as_deref(), Some("Camera A"));
        assert_eq!(device.model.as_deref(), Some("AXIS-P1344"));
    }

    #[tokio::test]
    async fn xaddrs_populates_device_url_and_types_become_tags() {
        let raw = r#"<e:Envelope xmlns:e="http://www.w3.org/2003/05/soap-envelope"
            xmlns:d="http://schemas.xmlsoap.org/ws/2005/04/discovery">
          <e:Body><d:ProbeMatches><d:ProbeMatch>
            <d:Types>tds:Device trt:PTZ</d:Types>
            <d:XAddrs>http://10.0.0.7:80/onvif/device_service</d:XAddrs>
          </d:ProbeMatch></d:ProbeMatches></e:Body>
        </e:Envelope>"#;

        let mut device = DeviceInfo::new(ProtocolTag::Wsd, "10.0.0.7");
        let mut raw_data = BTreeMap::new();
        raw_data.insert("raw_response".to_string(), raw.to_string());
        device.raw_data = raw_data;

        let enricher = WsdMetadataEnricher;
        enricher.enrich(&mut device, Duration::from_secs(1)).await.unwrap();

        assert_eq!(device.device_url.as_deref(), Some("http://10.0.0.7:80/onvif/device_service"));
        assert!(device.device_tags.contains(&"tds:Device".to_string()));
        assert!(device.device_tags.contains(&"trt:PTZ".to_string()));
    }

    #[tokio::test]
    async fn xaddrs_does_not_clobber_existing_device_url() {
        let raw = r#"<d:XAddrs>http://10.0.0.7:80/onvif/device_service</d:XAddrs>"#;

        let mut device = DeviceInfo::new(ProtocolTag::Wsd, "10.0.0.7");
        device.device_url = Some("http://existing".to_string());
        let mut raw_data = BTreeMap::new();
        raw_data.insert("raw_response".to_string(), raw.to_string());
        device.raw_data = raw_data;

        let enricher = WsdMetadataEnricher;
        enricher.enrich(&mut device, Duration::from_secs(1)).await.unwrap();

        assert_eq!(device.device_url.as_deref(), Some("http://existing"));
    }
}
