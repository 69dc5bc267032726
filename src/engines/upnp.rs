//! UPnP/SSDP engine.
//!
//! Sends an `M-SEARCH` multicast request, parses the SSDP responses, and
//! fetches each device's root description document for deep enrichment
//! (manufacturer, UDN, friendly name, service list).

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, trace, warn};
use url::Url;

use crate::model::UpnpRecord;
use crate::safety::resolve_is_safe;
use crate::transport::open_best_effort;

pub const SSDP_MULTICAST_GROUP: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900));

const MAX_DESCRIPTION_BYTES: usize = 1024 * 1024;

/// Builds an `M-SEARCH * HTTP/1.1` request.
pub fn make_msearch(search_target: &str, mx: u8) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {mx}\r\n\
         ST: {search_target}\r\n\
         \r\n"
    )
}

/// Parses an SSDP response's `Key: Value` lines. Keys are uppercased;
/// duplicate headers keep the last value seen.
pub fn parse_ssdp_headers(buf: &[u8]) -> Option<BTreeMap<String, String>> {
    let mut headers_buf = [httparse::EMPTY_HEADER; 32];
    let mut resp = httparse::Response::new(&mut headers_buf);
    match resp.parse(buf) {
        Ok(httparse::Status::Complete(_)) | Ok(httparse::Status::Partial) => {}
        Err(e) => {
            trace!("failed to parse SSDP response as HTTP: {e:#}");
            return None;
        }
    }
    let mut map = BTreeMap::new();
    for h in resp.headers.iter() {
        if h.name.is_empty() {
            continue;
        }
        let value = std::str::from_utf8(h.value).ok()?.trim().to_string();
        map.insert(h.name.to_ascii_uppercase(), value);
    }
    Some(map)
}

/// Runs M-SEARCH, collects responses until `timeout`, and performs a basic
/// (non-deep) description fetch for records with a LOCATION header.
pub async fn discover(
    timeout: Duration,
    search_target: &str,
    mx: u8,
    ttl: u32,
    interface_ip: Option<IpAddr>,
) -> Vec<UpnpRecord> {
    let Some(sock) = open_best_effort(SSDP_MULTICAST_GROUP, ttl, interface_ip).await else {
        return Vec::new();
    };

    let message = make_msearch(search_target, mx);
    if let Err(e) = sock.send(message.as_bytes(), SSDP_MULTICAST_GROUP).await {
        warn!("failed to send SSDP M-SEARCH: {e:#}");
        return Vec::new();
    }

    let mut records: Vec<UpnpRecord> = Vec::new();
    sock.collect_until(timeout, |addr, payload| {
        let Some(headers) = parse_ssdp_headers(payload) else {
            return;
        };
        let record = UpnpRecord {
            source_addr: addr.ip().to_string(),
            headers,
            friendly_name: None,
            device_type: None,
            fingerprint: None,
        };
        if !records
            .iter()
            .any(|r: &UpnpRecord| r.source_addr == record.source_addr && r.headers == record.headers)
        {
            records.push(record);
        }
    })
    .await;

    for record in records.iter_mut() {
        let Some(location) = record.header("LOCATION") else {
            continue;
        };
        let Ok(url) = Url::parse(location) else {
            continue;
        };
        match fetch_root_desc(&url).await {
            Ok(root) => {
                if let Some(dev) = root.devices.first() {
                    record.friendly_name = non_empty(dev.friendly_name.clone());
                    record.device_type = non_empty(Some(dev.device_type.clone()));
                }
            }
            Err(e) => {
                debug!(%location, "UPnP description fetch skipped or failed: {e:#}");
            }
        }
    }

    records
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|v| !v.is_empty())
}

#[derive(Debug, thiserror::Error)]
pub enum DescriptionFetchError {
    #[error("unsupported URL scheme {0:?}")]
    Scheme(String),
    #[error("host does not resolve to a private/link-local/loopback address")]
    UnsafeHost,
    #[error("response too large (> {MAX_DESCRIPTION_BYTES} bytes)")]
    TooLarge,
    #[error("non-200 status {0}")]
    BadStatus(reqwest::StatusCode),
    #[error("content-type {0:?} is not XML")]
    NotXml(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("xml parse error: {0}")]
    Xml(#[from] quick_xml::DeError),
}

/// Fetches and parses `location` as UPnP device-description XML. Enforces
/// http(s) scheme only, host must resolve to a private/link-local/loopback
/// address, no proxy, no redirects, response capped at ~1 MiB, content-type
/// must contain "xml", status must be 200.
pub async fn fetch_root_desc(location: &Url) -> Result<RootDesc, DescriptionFetchError> {
    let scheme = location.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(DescriptionFetchError::Scheme(scheme.to_string()));
    }
    let host = location
        .host_str()
        .ok_or(DescriptionFetchError::UnsafeHost)?;
    let port = location
        .port_or_known_default()
        .unwrap_or(if scheme == "https" { 443 } else { 80 });
    match resolve_is_safe(host, port) {
        Some(true) => {}
        _ => return Err(DescriptionFetchError::UnsafeHost),
    }

    let client = reqwest::Client::builder()
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(10))
        .build()?;

    let resp = client.get(location.clone()).send().await?;
    if resp.status() != reqwest::StatusCode::OK {
        return Err(DescriptionFetchError::BadStatus(resp.status()));
    }
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if !content_type.to_ascii_lowercase().contains("xml") {
        return Err(DescriptionFetchError::NotXml(content_type));
    }

    let body = read_capped(resp).await?;
    let root: RootDesc = quick_xml::de::from_str(&body)?;
    Ok(root)
}

async fn read_capped(resp: reqwest::Response) -> Result<String, DescriptionFetchError> {
    use futures::StreamExt;
    let mut stream = resp.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if buf.len() + chunk.len() > MAX_DESCRIPTION_BYTES {
            return Err(DescriptionFetchError::TooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

// ---------------------------------------------------------------------------
// UPnP device-description XML model
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct RootDesc {
    #[serde(rename = "device")]
    pub devices: Vec<Device>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct DeviceList {
    #[serde(rename = "device", default)]
    pub devices: Vec<Device>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct Device {
    #[serde(rename = "deviceType", default)]
    pub device_type: String,
    #[serde(rename = "friendlyName", default)]
    pub friendly_name: String,
    #[serde(rename = "manufacturer", default)]
    pub manufacturer: Option<String>,
    #[serde(rename = "modelName", default)]
    pub model_name: Option<String>,
    #[serde(rename = "modelNumber", default)]
    pub model_number: Option<String>,
    #[serde(rename = "firmwareVersion", default)]
    pub firmware_version: Option<String>,
    #[serde(rename = "serialNumber", default)]
    pub serial_number: Option<String>,
    #[serde(rename = "UDN", default)]
    pub udn: Option<String>,
    #[serde(rename = "presentationURL", default)]
    pub presentation_url: Option<String>,
    #[serde(rename = "serviceList", default)]
    pub service_list: ServiceList,
    #[serde(rename = "deviceList", default)]
    pub device_list: DeviceList,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ServiceList {
    #[serde(rename = "service", default)]
    pub services: Vec<Service>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct Service {
    #[serde(rename = "serviceType", default)]
    pub service_type: String,
    #[serde(rename = "controlURL", default)]
    pub control_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssdp_headers_uppercased() {
        let raw = b"HTTP/1.1 200 OK\r\nLOCATION: http://10.0.0.2/d.xml\r\nUSN: uuid:x::y\r\n\r\n";
        let headers = parse_ssdp_headers(raw).unwrap();
        assert_eq!(
            headers.get("LOCATION").map(|s| s.as_str()),
            Some("http://10.0.0.2/d.xml")
        );
        assert_eq!(headers.get("USN").map(|s| s.as_str()), Some("uuid:x::y"));
    }

    #[test]
    fn duplicate_headers_last_wins() {
        let raw = b"HTTP/1.1 200 OK\r\nST: a\r\nST: b\r\n\r\n";
        let headers = parse_ssdp_headers(raw).unwrap();
        assert_eq!(headers.get("ST").map(|s| s.as_str()), Some("b"));
    }

    #[test]
    fn msearch_contains_required_headers() {
        let msg = make_msearch("ssdp:all", 3);
        assert!(msg.contains("M-SEARCH * HTTP/1.1"));
        assert!(msg.contains("HOST: 239.255.255.250:1900"));
        assert!(msg.contains("MAN: \"ssdp:discover\""));
        assert!(msg.contains("MX: 3"));
        assert!(msg.contains("ST: ssdp:all"));
    }

    #[test]
    fn parse_root_desc_xml() {
        let xml = r#"<root><device>
            <deviceType>urn:schemas-upnp-org:device:Basic:1</deviceType>
            <friendlyName>IPC</friendlyName>
            <manufacturer>Hikvision</manufacturer>
        </device></root>"#;
        let root: RootDesc = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(root.devices[0].friendly_name, "IPC");
        assert_eq!(root.devices[0].manufacturer.as_deref(), Some("Hikvision"));
    }
}
