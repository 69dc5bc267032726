//! Request/response data model shared by every discovery engine.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DiscoveryError;
use crate::safety::is_loopback_interface;

/// Which protocol(s) a scan should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Upnp,
    Mdns,
    Wsd,
    Mqtt,
    Coap,
    All,
}

impl Protocol {
    pub fn wants(self, other: Protocol) -> bool {
        self == Protocol::All || self == other
    }
}

/// Parameters for a single discovery run, validated before any engine runs.
#[derive(Debug, Clone)]
pub struct DiscoveryRequest {
    pub protocol: Protocol,
    pub timeout: Duration,
    pub mdns_service: MdnsServiceSelector,
    pub upnp_search_target: String,
    pub upnp_mx: u8,
    pub multicast_ttl: u32,
    pub interface_ip: Option<IpAddr>,
    pub enrich: bool,
    /// Extra unicast targets to feed the MQTT/CoAP engines (e.g. carried
    /// over from a prior UPnP/mDNS pass). Optional — engines also discover
    /// targets on their own via multicast.
    pub mqtt_target_ips: Vec<IpAddr>,
    pub coap_target_ips: Vec<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MdnsServiceSelector {
    All,
    One(String),
}

pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 300;
pub const MIN_MX: u8 = 1;
pub const MAX_MX: u8 = 5;
pub const MIN_TTL: u32 = 1;
pub const MAX_TTL: u32 = 16;

pub const DEFAULT_UPNP_ST: &str = "ssdp:all";
pub const DEFAULT_UPNP_MX: u8 = 3;
pub const DEFAULT_TTL: u32 = 2;
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

impl Default for DiscoveryRequest {
    fn default() -> Self {
        Self {
            protocol: Protocol::All,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            mdns_service: MdnsServiceSelector::One(
                "_services._dns-sd._udp.local.".to_string(),
            ),
            upnp_search_target: DEFAULT_UPNP_ST.to_string(),
            upnp_mx: DEFAULT_UPNP_MX,
            multicast_ttl: DEFAULT_TTL,
            interface_ip: None,
            enrich: false,
            mqtt_target_ips: Vec::new(),
            coap_target_ips: Vec::new(),
        }
    }
}

impl DiscoveryRequest {
    /// Validates bounds and rejects a loopback `interface_ip` such as
    /// `127.0.0.1`, which can never be a real multicast-capable interface.
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        let secs = self.timeout.as_secs();
        if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&secs) {
            return Err(DiscoveryError::InvalidRequest(format!(
                "timeout must be within [{MIN_TIMEOUT_SECS}, {MAX_TIMEOUT_SECS}] seconds, got {secs}"
            )));
        }
        if !(MIN_MX..=MAX_MX).contains(&self.upnp_mx) {
            return Err(DiscoveryError::InvalidRequest(format!(
                "upnp_mx must be within [{MIN_MX}, {MAX_MX}], got {}",
                self.upnp_mx
            )));
        }
        if !(MIN_TTL..=MAX_TTL).contains(&self.multicast_ttl) {
            return Err(DiscoveryError::InvalidRequest(format!(
                "multicast_ttl must be within [{MIN_TTL}, {MAX_TTL}], got {}",
                self.multicast_ttl
            )));
        }
        if let MdnsServiceSelector::One(s) = &self.mdns_service {
            if s.trim().is_empty() {
                return Err(DiscoveryError::InvalidRequest(
                    "mdns_service must not be blank".to_string(),
                ));
            }
        }
        if let Some(ip) = self.interface_ip {
            if is_loopback_interface(ip) {
                return Err(DiscoveryError::InvalidRequest(format!(
                    "interface_ip must not be a loopback address, got {ip}"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Raw protocol records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpnpRecord {
    pub source_addr: String,
    /// Case-normalized (uppercased) SSDP header map; duplicates kept
    /// last-wins.
    pub headers: BTreeMap<String, String>,
    pub friendly_name: Option<String>,
    pub device_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<DeviceFingerprint>,
}

impl UpnpRecord {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdnsRecord {
    pub name: String,
    pub service_type: String,
    pub addresses: Vec<String>,
    pub port: Option<u16>,
    pub properties: BTreeMap<String, Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<DeviceFingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsdRecord {
    pub source_addr: String,
    pub raw_response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<DeviceFingerprint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttFlags {
    pub anonymous_access: bool,
    pub anonymous_publish: bool,
    pub tls_supported: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttCounters {
    pub connected_clients: Option<u64>,
    pub uptime_seconds: Option<u64>,
    pub messages_received: Option<u64>,
    pub messages_sent: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttRecord {
    pub address: String,
    pub port: u16,
    pub broker_name: Option<String>,
    pub broker_version: Option<String>,
    pub flags: MqttFlags,
    pub counters: MqttCounters,
    pub sampled_topics: Vec<String>,
    pub sys_metadata: BTreeMap<String, String>,
    pub risk_flags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<DeviceFingerprint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoapResource {
    pub uri: String,
    pub rt: Option<String>,
    pub if_desc: Option<String>,
    pub ct: Option<String>,
    pub observable: bool,
    pub title: Option<String>,
    /// Content-format value observed during resource enumeration, if any GET
    /// was attempted for this URI.
    pub ct_detected: Option<String>,
    /// Size of the payload observed during enumeration. The payload bytes
    /// themselves are never retained, only their length.
    pub payload_size: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoapRecord {
    pub address: String,
    pub port: u16,
    pub resources: Vec<CoapResource>,
    pub device_type: Option<String>,
    pub observable_resources: Vec<String>,
    pub dtls_supported: bool,
    pub unauthenticated_access: bool,
    pub risk_flags: Vec<String>,
    pub raw_link_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<DeviceFingerprint>,
}

// ---------------------------------------------------------------------------
// Unified device record produced during enrichment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolTag {
    Upnp,
    Mdns,
    Wsd,
    Mqtt,
    Coap,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub port: u16,
    pub name: String,
    pub banner: String,
    pub tls: bool,
    pub tls_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub protocol: ProtocolTag,
    pub address: String,
    pub port: Option<u16>,
    /// Protocol-specific key/value bag carried from the raw record (e.g. the
    /// SSDP header map, or the `$SYS` metadata map) so later stages can read
    /// it without knowing the originating protocol's concrete type.
    pub raw_data: BTreeMap<String, String>,

    pub friendly_name: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub firmware_version: Option<String>,
    pub serial_number: Option<String>,
    pub device_url: Option<String>,

    pub device_category: Option<String>,
    pub device_tags: Vec<String>,

    pub os_guess: Option<String>,

    pub services: Vec<ServiceEntry>,
    pub banners: BTreeMap<u16, String>,

    pub enrichment_errors: Vec<String>,
}

impl DeviceInfo {
    pub fn new(protocol: ProtocolTag, address: impl Into<String>) -> Self {
        Self {
            protocol,
            address: address.into(),
            port: None,
            raw_data: BTreeMap::new(),
            friendly_name: None,
            manufacturer: None,
            model: None,
            firmware_version: None,
            serial_number: None,
            device_url: None,
            device_category: None,
            device_tags: Vec::new(),
            os_guess: None,
            services: Vec::new(),
            banners: BTreeMap::new(),
            enrichment_errors: Vec::new(),
        }
    }

    /// Sets `field` unless it already holds a non-empty value (spec
    /// invariant 3: enrichment is additive, later stages fill gaps but don't
    /// clobber).
    pub fn fill_if_empty(slot: &mut Option<String>, value: Option<String>) {
        if slot.is_none() || slot.as_deref() == Some("") {
            if let Some(v) = value {
                if !v.is_empty() {
                    *slot = Some(v);
                }
            }
        }
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.device_tags.contains(&tag) {
            self.device_tags.push(tag);
        }
    }

    pub fn to_fingerprint(&self) -> DeviceFingerprint {
        DeviceFingerprint {
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
            firmware_version: self.firmware_version.clone(),
            serial_number: self.serial_number.clone(),
            device_url: self.device_url.clone(),
            device_category: self.device_category.clone(),
            device_tags: self.device_tags.clone(),
            os_guess: self.os_guess.clone(),
            services: self.services.clone(),
            banners: self
                .banners
                .iter()
                .map(|(port, text)| (port.to_string(), text.clone()))
                .collect(),
        }
    }
}

/// The subset of `DeviceInfo` attached back onto a raw record after
/// enrichment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub firmware_version: Option<String>,
    pub serial_number: Option<String>,
    pub device_url: Option<String>,
    pub device_category: Option<String>,
    pub device_tags: Vec<String>,
    pub os_guess: Option<String>,
    pub services: Vec<ServiceEntry>,
    pub banners: BTreeMap<String, String>,
}

/// Aggregate result of a discovery run across every engine that ran.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub upnp: Vec<UpnpRecord>,
    pub mdns: Vec<MdnsRecord>,
    pub wsd: Vec<WsdRecord>,
    pub mqtt: Vec<MqttRecord>,
    pub coap: Vec<CoapRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn rejects_loopback_interface() {
        let mut req = DiscoveryRequest::default();
        req.interface_ip = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(matches!(
            req.validate(),
            Err(DiscoveryError::InvalidRequest(_))
        ));
    }

    #[test]
    fn rejects_timeout_out_of_range() {
        let mut req = DiscoveryRequest::default();
        req.timeout = Duration::from_secs(0);
        assert!(req.validate().is_err());
        req.timeout = Duration::from_secs(301);
        assert!(req.validate().is_err());
    }

    #[test]
    fn accepts_defaults() {
        assert!(DiscoveryRequest::default().validate().is_ok());
    }

    #[test]
    fn fill_if_empty_does_not_clobber() {
        let mut slot = Some("existing".to_string());
        DeviceInfo::fill_if_empty(&mut slot, Some("new".to_string()));
        assert_eq!(slot.as_deref(), Some("existing"));

        let mut empty: Option<String> = None;
        DeviceInfo::fill_if_empty(&mut empty, Some("new".to_string()));
        assert_eq!(empty.as_deref(), Some("new"));
    }
}
