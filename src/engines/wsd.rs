//! WS-Discovery engine.
//!
//! Sends a SOAP-over-UDP Probe to the WS-Discovery multicast group and
//! collects raw responses; parsing is deferred to the enrichment stage.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use uuid::Uuid;

use crate::model::WsdRecord;
use crate::transport::open_best_effort;

pub const WSD_MULTICAST_GROUP: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 3702));

/// Builds a SOAP 1.2 Probe with a fresh `urn:uuid:`-style MessageID.
pub fn make_probe() -> String {
    make_probe_with_id(&format!("uuid:{}", Uuid::new_v4()))
}

fn make_probe_with_id(message_id: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<e:Envelope xmlns:e="http://www.w3.org/2003/05/soap-envelope"
            xmlns:w="http://schemas.xmlsoap.org/ws/2004/08/addressing"
            xmlns:d="http://schemas.xmlsoap.org/ws/2005/04/discovery">
  <e:Header>
    <w:MessageID>{message_id}</w:MessageID>
    <w:To>urn:schemas-xmlsoap-org:ws:2005:04:discovery</w:To>
    <w:Action>http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe</w:Action>
  </e:Header>
  <e:Body>
    <d:Probe/>
  </e:Body>
</e:Envelope>"#
    )
}

/// Sends a Probe and collects raw SOAP responses until `timeout`. Responses
/// are not parsed here — the raw XML is preserved for `WSDMetadataEnricher`
/// to parse during enrichment.
pub async fn discover(timeout: Duration, ttl: u32, interface_ip: Option<IpAddr>) -> Vec<WsdRecord> {
    let Some(sock) = open_best_effort(WSD_MULTICAST_GROUP, ttl, interface_ip).await else {
        return Vec::new();
    };

    let probe = make_probe();
    if sock.send(probe.as_bytes(), WSD_MULTICAST_GROUP).await.is_err() {
        return Vec::new();
    }

    let mut records = Vec::new();
    sock.collect_until(timeout, |addr, payload| {
        let response = String::from_utf8_lossy(payload).into_owned();
        records.push(WsdRecord {
            source_addr: addr.ip().to_string(),
            raw_response: response,
            fingerprint: None,
        });
    })
    .await;

    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_carries_required_headers() {
        let probe = make_probe_with_id("uuid:test-id");
        assert!(probe.contains("uuid:test-id"));
        assert!(probe.contains("http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe"));
        assert!(probe.contains("<d:Probe/>"));
    }
}
