//! Top-level `discover()` entry point.
//!
//! Validates the request, runs whichever engines `request.protocol` selects,
//! and — when `request.enrich` is set — lifts every raw record into a
//! `DeviceInfo`, runs the enrichment pipeline over the whole batch at once
//! (so the worker pool is shared across protocols rather than per-protocol),
//! and merges each resulting `DeviceFingerprint` back onto the raw record it
//! came from by original index.

use crate::enrich::EnrichmentPipeline;
use crate::error::{DiscoveryError, Result};
use crate::engines::{coap, mdns, mqtt, upnp, wsd};
use crate::model::{
    CoapRecord, DeviceInfo, DiscoveryRequest, DiscoveryResponse, MdnsRecord, MqttRecord,
    Protocol, ProtocolTag, UpnpRecord, WsdRecord,
};

pub async fn discover(request: DiscoveryRequest) -> Result<DiscoveryResponse> {
    request.validate()?;

    let mut response = DiscoveryResponse::default();

    if request.protocol.wants(Protocol::Upnp) {
        response.upnp = upnp::discover(
            request.timeout,
            &request.upnp_search_target,
            request.upnp_mx,
            request.multicast_ttl,
            request.interface_ip,
        )
        .await;
    }

    if request.protocol.wants(Protocol::Mdns) {
        let service_types = match &request.mdns_service {
            crate::model::MdnsServiceSelector::All => {
                mdns::WELL_KNOWN_SERVICE_TYPES.iter().map(|s| s.to_string()).collect()
            }
            crate::model::MdnsServiceSelector::One(s) => vec![s.clone()],
        };
        response.mdns = mdns::discover(request.timeout, &service_types).await;
    }

    if request.protocol.wants(Protocol::Wsd) {
        response.wsd = wsd::discover(request.timeout, request.multicast_ttl, request.interface_ip).await;
    }

    if request.protocol.wants(Protocol::Mqtt) {
        response.mqtt = mqtt::discover(&request.mqtt_target_ips, request.timeout).await;
    }

    if request.protocol.wants(Protocol::Coap) {
        response.coap =
            coap::discover(&request.coap_target_ips, request.timeout, request.interface_ip).await;
    }

    if request.enrich {
        enrich_response(&mut response, request.timeout).await;
    }

    Ok(response)
}

/// Lifts every raw record into a `DeviceInfo`, keeping a parallel list of
/// where each one came from (which array, which index) so the resulting
/// fingerprint can be written back to the exact record it was built from,
/// regardless of which protocol mix produced the batch.
async fn enrich_response(response: &mut DiscoveryResponse, overall_timeout: std::time::Duration) {
    enum Origin {
        Upnp(usize),
        Mdns(usize),
        Wsd(usize),
        Mqtt(usize),
        Coap(usize),
    }

    let mut devices = Vec::new();
    let mut origins = Vec::new();

    for (i, r) in response.upnp.iter().enumerate() {
        devices.push(upnp_to_device(r));
        origins.push(Origin::Upnp(i));
    }
    for (i, r) in response.mdns.iter().enumerate() {
        devices.push(mdns_to_device(r));
        origins.push(Origin::Mdns(i));
    }
    for (i, r) in response.wsd.iter().enumerate() {
        devices.push(wsd_to_device(r));
        origins.push(Origin::Wsd(i));
    }
    for (i, r) in response.mqtt.iter().enumerate() {
        devices.push(mqtt_to_device(r));
        origins.push(Origin::Mqtt(i));
    }
    for (i, r) in response.coap.iter().enumerate() {
        devices.push(coap_to_device(r));
        origins.push(Origin::Coap(i));
    }

    if devices.is_empty() {
        return;
    }

    let pipeline = EnrichmentPipeline::default_pipeline();
    let per_device_budget = overall_timeout / (devices.len() as u32).max(1);
    let enriched = pipeline.enrich_all(devices, per_device_budget).await;

    for (device, origin) in enriched.into_iter().zip(origins) {
        let fingerprint = device.to_fingerprint();
        match origin {
            Origin::Upnp(i) => response.upnp[i].fingerprint = Some(fingerprint),
            Origin::Mdns(i) => response.mdns[i].fingerprint = Some(fingerprint),
            Origin::Wsd(i) => response.wsd[i].fingerprint = Some(fingerprint),
            Origin::Mqtt(i) => response.mqtt[i].fingerprint = Some(fingerprint),
            Origin::Coap(i) => response.coap[i].fingerprint = Some(fingerprint),
        }
    }
}

fn upnp_to_device(record: &UpnpRecord) -> DeviceInfo {
    let mut device = DeviceInfo::new(ProtocolTag::Upnp, record.source_addr.clone());
    device.raw_data = record.headers.clone();
    device.friendly_name = record.friendly_name.clone();
    if let Some(location) = record.header("LOCATION") {
        if let Ok(url) = url::Url::parse(location) {
            if let Some(port) = url.port() {
                device.port = Some(port);
            }
        }
    }
    device
}

fn mdns_to_device(record: &MdnsRecord) -> DeviceInfo {
    let address = record.addresses.first().cloned().unwrap_or_default();
    let mut device = DeviceInfo::new(ProtocolTag::Mdns, address);
    device.port = record.port;
    device.friendly_name = Some(record.name.clone());
    for (k, v) in &record.properties {
        device.raw_data.insert(k.clone(), String::from_utf8_lossy(v).into_owned());
    }
    device
}

fn wsd_to_device(record: &WsdRecord) -> DeviceInfo {
    let mut device = DeviceInfo::new(ProtocolTag::Wsd, record.source_addr.clone());
    device.raw_data.insert("raw_response".to_string(), record.raw_response.clone());
    device
}

fn mqtt_to_device(record: &MqttRecord) -> DeviceInfo {
    let mut device = DeviceInfo::new(ProtocolTag::Mqtt, record.address.clone());
    device.port = Some(record.port);
    device.friendly_name = record.broker_name.clone();
    if let Some(version) = &record.broker_version {
        device.raw_data.insert("broker_version".to_string(), version.clone());
    }
    device
        .raw_data
        .insert("tls_supported".to_string(), record.flags.tls_supported.to_string());
    for (k, v) in &record.sys_metadata {
        device.raw_data.insert(k.clone(), v.clone());
    }
    device.device_tags.extend(record.risk_flags.iter().cloned());
    device
}

fn coap_to_device(record: &CoapRecord) -> DeviceInfo {
    let mut device = DeviceInfo::new(ProtocolTag::Coap, record.address.clone());
    device.port = Some(record.port);
    // `record.device_type` is already the human-readable inference (the
    // `oic.d.` prefix stripped); `raw_data["resource_type"]` instead carries
    // the untouched `rt` string so CoapResourceEnricher can strip it itself.
    let raw_resource_type = record
        .resources
        .iter()
        .find_map(|r| r.rt.as_deref().filter(|rt| rt.starts_with("oic.d.")))
        .or_else(|| record.resources.iter().find_map(|r| r.rt.as_deref()))
        .map(str::to_string);
    if let Some(rt) = raw_resource_type {
        device.raw_data.insert("resource_type".to_string(), rt);
    }
    if !record.observable_resources.is_empty() {
        device
            .raw_data
            .insert("observable_resources".to_string(), record.observable_resources.join(","));
    }
    device.device_tags.extend(record.risk_flags.iter().cloned());
    device
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upnp_to_device_copies_headers_into_raw_data() {
        let mut headers = std::collections::BTreeMap::new();
        headers.insert("SERVER".to_string(), "Linux/3.10 UPnP/1.0 Hikvision/1.0".to_string());
        headers.insert("LOCATION".to_string(), "http://192.168.1.5:80/desc.xml".to_string());
        let record = UpnpRecord {
            source_addr: "192.168.1.5".to_string(),
            headers,
            friendly_name: None,
            device_type: None,
            fingerprint: None,
        };

        let device = upnp_to_device(&record);
        assert_eq!(device.raw_data.get("SERVER").map(String::as_str), Some("Linux/3.10 UPnP/1.0 Hikvision/1.0"));
        assert_eq!(device.port, Some(80));
    }

    #[test]
    fn coap_to_device_keeps_resource_type_unstripped_for_enricher() {
        let record = CoapRecord {
            address: "10.0.0.21".to_string(),
            port: crate::engines::coap::COAP_PORT,
            resources: vec![crate::model::CoapResource {
                uri: "/oic/d".to_string(),
                rt: Some("oic.d.sensor".to_string()),
                ..Default::default()
            }],
            device_type: Some("sensor".to_string()),
            ..Default::default()
        };

        let device = coap_to_device(&record);
        assert_eq!(device.raw_data.get("resource_type").map(String::as_str), Some("oic.d.sensor"));
    }

    #[tokio::test]
    async fn non_observable_oic_resource_gets_device_category_end_to_end() {
        use crate::enrich::coap_resource::CoapResourceEnricher;
        use crate::enrich::Enricher;

        let record = CoapRecord {
            address: "10.0.0.21".to_string(),
            port: crate::engines::coap::COAP_PORT,
            resources: vec![crate::model::CoapResource {
                uri: "/oic/d".to_string(),
                rt: Some("oic.d.light".to_string()),
                ..Default::default()
            }],
            device_type: Some("light".to_string()),
            observable_resources: Vec::new(),
            ..Default::default()
        };

        let mut device = coap_to_device(&record);
        CoapResourceEnricher
            .enrich(&mut device, std::time::Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(device.device_category.as_deref(), Some("light"));
    }

    #[tokio::test]
    async fn validate_runs_before_any_engine_call() {
        let mut req = DiscoveryRequest::default();
        req.upnp_mx = 0;
        let result = discover(req).await;
        assert!(matches!(result, Err(DiscoveryError::InvalidRequest(_))));
    }
}
