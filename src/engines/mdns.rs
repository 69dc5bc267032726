//! mDNS/DNS-SD engine.
//!
//! Uses `mdns-sd`'s `ServiceDaemon` exactly once per scan, browsing every
//! requested service type concurrently on one daemon instance rather than
//! spinning up one daemon per type.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent};
use tracing::{debug, warn};

use crate::model::MdnsRecord;

pub const WELL_KNOWN_SERVICE_TYPES: &[&str] = &[
    "_services._dns-sd._udp.local.",
    "_http._tcp.local.",
    "_workstation._tcp.local.",
    "_ipp._tcp.local.",
    "_printer._tcp.local.",
];

const META_SERVICE_TYPE: &str = "_services._dns-sd._udp.local.";

/// Browses `service_types` concurrently on a single `ServiceDaemon`, waits
/// `timeout`, then closes the daemon and returns every service observed
/// (insertion order). `remove` events are intentionally ignored — a service
/// seen during the scan window stays in the result set, favoring scan
/// stability over strict live truth.
pub async fn discover(timeout: Duration, service_types: &[String]) -> Vec<MdnsRecord> {
    let daemon = match ServiceDaemon::new() {
        Ok(d) => d,
        Err(e) => {
            warn!("failed to start mDNS daemon: {e:#}");
            return Vec::new();
        }
    };

    let mut order: Vec<String> = Vec::new();
    let mut services: BTreeMap<String, MdnsRecord> = BTreeMap::new();
    let mut receivers = Vec::new();

    for service_type in service_types {
        match daemon.browse(service_type) {
            Ok(rx) => receivers.push((service_type.clone(), rx)),
            Err(e) => warn!(%service_type, "failed to browse mDNS service type: {e:#}"),
        }
    }

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    'outer: loop {
        if receivers.is_empty() {
            break;
        }
        tokio::select! {
            _ = &mut deadline => break 'outer,
            _ = async {
                // Poll every receiver's channel without blocking any single one
                // out for the whole collection window.
                for (service_type, rx) in receivers.iter() {
                    while let Ok(event) = rx.try_recv() {
                        handle_event(service_type, event, &mut order, &mut services);
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            } => {}
        }
    }

    if let Err(e) = daemon.shutdown() {
        debug!("mDNS daemon shutdown reported an error: {e:#}");
    }

    order
        .into_iter()
        .filter_map(|name| services.remove(&name))
        .collect()
}

fn handle_event(
    service_type: &str,
    event: ServiceEvent,
    order: &mut Vec<String>,
    services: &mut BTreeMap<String, MdnsRecord>,
) {
    match event {
        ServiceEvent::ServiceResolved(info) => {
            let fullname = info.fullname.clone();
            if !services.contains_key(&fullname) {
                order.push(fullname.clone());
            }
            let addresses = info
                .addresses
                .iter()
                .map(|scoped| scoped.to_ip_addr())
                .filter_map(|addr| match addr {
                    IpAddr::V4(v4) => Some(v4.to_string()),
                    IpAddr::V6(_) => None,
                })
                .collect();
            let properties = info
                .txt_properties
                .iter()
                .map(|(k, v)| (k.clone(), v.val_str().as_bytes().to_vec()))
                .collect();
            services.insert(
                fullname.clone(),
                MdnsRecord {
                    name: fullname,
                    service_type: service_type.to_string(),
                    addresses,
                    port: Some(info.port),
                    properties,
                    fingerprint: None,
                },
            );
        }
        ServiceEvent::ServiceFound(_, fullname) => {
            // Meta-type records (e.g. `_services._dns-sd._udp.local.`) need
            // no further resolution — record the name as seen.
            if service_type == META_SERVICE_TYPE && !services.contains_key(&fullname) {
                order.push(fullname.clone());
                services.insert(
                    fullname.clone(),
                    MdnsRecord {
                        name: fullname,
                        service_type: service_type.to_string(),
                        addresses: Vec::new(),
                        port: None,
                        properties: BTreeMap::new(),
                        fingerprint: None,
                    },
                );
            }
        }
        ServiceEvent::ServiceRemoved(_, _) => {
            // No-op by design: a service already seen stays in the result set.
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_list_matches_spec_order() {
        assert_eq!(
            WELL_KNOWN_SERVICE_TYPES,
            &[
                "_services._dns-sd._udp.local.",
                "_http._tcp.local.",
                "_workstation._tcp.local.",
                "_ipp._tcp.local.",
                "_printer._tcp.local.",
            ]
        );
    }
}
