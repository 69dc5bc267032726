//! CoAP resource discovery.
//!
//! Four phases: multicast well-known/core, unicast well-known/core, resource
//! enumeration, and DTLS liveness. Socket handling for the multicast phase
//! reuses `transport::MulticastSocket`; the unicast phases use a connected
//! `UdpSocket` directly since each exchange is a single request/response
//! against one already-safety-checked host.

pub mod link_format;
pub mod wire;

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::model::{CoapRecord, CoapResource};
use crate::safety::is_safe_ip;
use crate::transport::open_best_effort;
use wire::{build_ack, build_request, parse_response, MsgType, CODE_UNAUTHORIZED};

pub const COAP_MCAST_V4: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(224, 0, 1, 187), 5683));
pub const COAP_MCAST_V6: SocketAddr = SocketAddr::V6(SocketAddrV6::new(
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfd),
    5683,
    0,
    0,
));
pub const COAP_PORT: u16 = 5683;
pub const COAP_DTLS_PORT: u16 = 5684;
const MAX_RESOURCES_PER_DEVICE: usize = 10;
const MAX_RESPONSE_SIZE: usize = 4096;
const PROBE_DELAY: Duration = Duration::from_millis(100);

struct Discovering {
    resources: Vec<CoapResource>,
    raw_link_format: Option<String>,
}

/// Runs the full discovery sequence against `target_ips` plus whatever
/// multicast turns up. `overall_timeout` is split across phases: roughly
/// 40% for multicast, the remainder split across unicast/enumeration, with
/// the DTLS check capped separately.
pub async fn discover(
    target_ips: &[IpAddr],
    overall_timeout: Duration,
    interface_ip: Option<IpAddr>,
) -> Vec<CoapRecord> {
    let start = tokio::time::Instant::now();
    let mut devices: BTreeMap<IpAddr, Discovering> = BTreeMap::new();

    let multicast_budget = overall_timeout.mul_f32(0.4).min(Duration::from_secs(3));
    multicast_discover(&mut devices, multicast_budget, interface_ip).await;

    let remaining = overall_timeout.saturating_sub(start.elapsed());
    if remaining > Duration::from_millis(500) {
        let mut all_ips: Vec<IpAddr> = target_ips.to_vec();
        for ip in devices.keys() {
            if !all_ips.contains(ip) {
                all_ips.push(*ip);
            }
        }
        unicast_discover(&mut devices, &all_ips, remaining).await;
    }

    let remaining = overall_timeout.saturating_sub(start.elapsed());
    if remaining > Duration::from_millis(500) {
        enumerate_resources(&mut devices, remaining).await;
    }

    let remaining = overall_timeout.saturating_sub(start.elapsed());
    let mut dtls_supported: BTreeMap<IpAddr, bool> = BTreeMap::new();
    if remaining > Duration::from_millis(300) {
        check_dtls(&devices, remaining, &mut dtls_supported).await;
    }

    devices
        .into_iter()
        .map(|(ip, dev)| {
            let observable_resources: Vec<String> = dev
                .resources
                .iter()
                .filter(|r| r.observable)
                .map(|r| r.uri.clone())
                .collect();
            let unauthenticated_access = !dev.resources.is_empty();
            let device_type = infer_device_type(&dev.resources);
            let dtls = dtls_supported.get(&ip).copied().unwrap_or(false);

            let mut record = CoapRecord {
                address: ip.to_string(),
                port: COAP_PORT,
                resources: dev.resources,
                device_type,
                observable_resources,
                dtls_supported: dtls,
                unauthenticated_access,
                raw_link_format: dev.raw_link_format,
                risk_flags: Vec::new(),
                fingerprint: None,
            };
            record.risk_flags = generate_risk_flags(&record);
            record
        })
        .collect()
}

fn infer_device_type(resources: &[CoapResource]) -> Option<String> {
    let mut device_type = None;
    for res in resources {
        let Some(rt) = res.rt.as_deref() else { continue };
        if let Some(suffix) = rt.strip_prefix("oic.d.") {
            return Some(suffix.to_string());
        }
        let lower = rt.to_ascii_lowercase();
        if device_type.is_none() && lower.contains("temperature") {
            device_type = Some("sensor".to_string());
        } else if device_type.is_none() && lower.contains("light") {
            device_type = Some("light".to_string());
        }
    }
    device_type
}

fn generate_risk_flags(record: &CoapRecord) -> Vec<String> {
    let mut flags = Vec::new();
    if record.unauthenticated_access {
        flags.push("unauthenticated_access".to_string());
    }
    if !record.dtls_supported {
        flags.push("no_dtls".to_string());
    }
    if !record.observable_resources.is_empty() {
        flags.push("observable_data_leak".to_string());
    }
    flags
}

fn random_token(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

async fn multicast_discover(
    devices: &mut BTreeMap<IpAddr, Discovering>,
    budget: Duration,
    interface_ip: Option<IpAddr>,
) {
    if let Some(sock) = open_best_effort(COAP_MCAST_V4, 2, interface_ip).await {
        let msg_id: u16 = rand::thread_rng().gen();
        let token = random_token(4);
        let request = build_request(MsgType::NonConfirmable, msg_id, &token, "/.well-known/core");
        if sock.send(&request, COAP_MCAST_V4).await.is_ok() {
            sock.collect_until(budget.min(Duration::from_secs(1)), |addr, payload| {
                if !is_safe_ip(addr.ip()) {
                    return;
                }
                handle_wellknown_response(devices, addr.ip(), payload);
            })
            .await;
        }
    }

    // IPv6 multicast is best-effort; many hosts have no IPv6 multicast route.
    if let Some(sock) = open_best_effort(COAP_MCAST_V6, 2, None).await {
        let msg_id: u16 = rand::thread_rng().gen();
        let token = random_token(4);
        let request = build_request(MsgType::NonConfirmable, msg_id, &token, "/.well-known/core");
        if sock.send(&request, COAP_MCAST_V6).await.is_ok() {
            sock.collect_until(budget.min(Duration::from_secs(1)), |addr, payload| {
                handle_wellknown_response(devices, addr.ip(), payload);
            })
            .await;
        }
    }
}

fn handle_wellknown_response(
    devices: &mut BTreeMap<IpAddr, Discovering>,
    source_ip: IpAddr,
    payload: &[u8],
) {
    let Some(resp) = parse_response(payload) else { return };
    handle_wellknown_content(devices, source_ip, &resp);
}

fn handle_wellknown_content(
    devices: &mut BTreeMap<IpAddr, Discovering>,
    source_ip: IpAddr,
    resp: &wire::Response,
) {
    if !resp.is_content() {
        return;
    }
    let text = String::from_utf8_lossy(&resp.payload).into_owned();
    let entries = link_format::parse(&text);
    if entries.is_empty() {
        return;
    }
    let resources = entries
        .into_iter()
        .map(|e| CoapResource {
            uri: e.uri,
            rt: e.rt,
            if_desc: e.if_desc,
            ct: e.ct,
            observable: e.observable,
            title: e.title,
            ct_detected: None,
            payload_size: None,
        })
        .collect();
    devices.insert(
        source_ip,
        Discovering {
            resources,
            raw_link_format: Some(text),
        },
    );
}

async fn unicast_discover(
    devices: &mut BTreeMap<IpAddr, Discovering>,
    target_ips: &[IpAddr],
    budget: Duration,
) {
    if target_ips.is_empty() {
        return;
    }
    let per_host = budget.div_f64(target_ips.len() as f64).min(Duration::from_secs(2));
    let deadline = tokio::time::Instant::now() + budget;

    for &ip in target_ips {
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        if !is_safe_ip(ip) {
            continue;
        }
        if devices.get(&ip).is_some_and(|d| !d.resources.is_empty()) {
            continue;
        }

        if let Some((resp, local)) = send_request(ip, COAP_PORT, MsgType::Confirmable, "/.well-known/core", per_host).await {
            if resp.msg_type == MsgType::Confirmable {
                let ack = build_ack(resp.message_id, &resp.token);
                let _ = local.send_to(&ack, SocketAddr::new(ip, COAP_PORT)).await;
            }
            if resp.is_content() {
                handle_wellknown_content(devices, ip, &resp);
            } else if resp.code == CODE_UNAUTHORIZED {
                devices.entry(ip).or_insert(Discovering {
                    resources: Vec::new(),
                    raw_link_format: None,
                });
            }
        }

        tokio::time::sleep(PROBE_DELAY).await;
    }
}

async fn enumerate_resources(devices: &mut BTreeMap<IpAddr, Discovering>, budget: Duration) {
    let deadline = tokio::time::Instant::now() + budget;

    for (ip, dev) in devices.iter_mut() {
        if dev.resources.is_empty() {
            continue;
        }
        for res in dev.resources.iter_mut().take(MAX_RESOURCES_PER_DEVICE) {
            if tokio::time::Instant::now() >= deadline || res.uri == "/.well-known/core" || res.uri.is_empty() {
                continue;
            }
            let per_request = deadline
                .saturating_duration_since(tokio::time::Instant::now())
                .min(Duration::from_secs(2));
            if let Some((resp, local)) = send_request(*ip, COAP_PORT, MsgType::Confirmable, &res.uri, per_request).await {
                if resp.msg_type == MsgType::Confirmable {
                    let ack = build_ack(resp.message_id, &resp.token);
                    let _ = local.send_to(&ack, SocketAddr::new(*ip, COAP_PORT)).await;
                }
                res.ct_detected = resp.content_format().map(|c| c.to_string());
                res.payload_size = Some(resp.payload.len());
            }
            tokio::time::sleep(PROBE_DELAY).await;
        }
    }
}

async fn check_dtls(
    devices: &BTreeMap<IpAddr, Discovering>,
    budget: Duration,
    out: &mut BTreeMap<IpAddr, bool>,
) {
    if devices.is_empty() {
        return;
    }
    let per_host = budget.div_f64(devices.len() as f64).min(Duration::from_secs(1));
    for &ip in devices.keys() {
        let msg_id: u16 = rand::thread_rng().gen();
        let token = random_token(2);
        let probe = build_request(MsgType::Confirmable, msg_id, &token, "/.well-known/core");
        let supported = send_raw(ip, COAP_DTLS_PORT, &probe, per_host).await.is_some();
        out.insert(ip, supported);
    }
}

/// Sends `request` to `ip:port` and waits for one datagram back, within
/// `probe_timeout`. The local ephemeral socket is returned alongside the
/// response so the caller can send an ACK from the same socket.
async fn send_request(
    ip: IpAddr,
    port: u16,
    msg_type: MsgType,
    uri_path: &str,
    probe_timeout: Duration,
) -> Option<(wire::Response, UdpSocket)> {
    let msg_id: u16 = rand::thread_rng().gen();
    let token = random_token(4);
    let request = build_request(msg_type, msg_id, &token, uri_path);
    let (raw, sock) = send_raw_keep_socket(ip, port, &request, probe_timeout).await?;
    let resp = parse_response(&raw)?;
    Some((resp, sock))
}

async fn send_raw(ip: IpAddr, port: u16, payload: &[u8], probe_timeout: Duration) -> Option<Vec<u8>> {
    send_raw_keep_socket(ip, port, payload, probe_timeout)
        .await
        .map(|(data, _)| data)
}

async fn send_raw_keep_socket(
    ip: IpAddr,
    port: u16,
    payload: &[u8],
    probe_timeout: Duration,
) -> Option<(Vec<u8>, UdpSocket)> {
    let bind_addr = match ip {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let sock = UdpSocket::bind(bind_addr).await.ok()?;
    sock.send_to(payload, SocketAddr::new(ip, port)).await.ok()?;

    let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
    match tokio::time::timeout(probe_timeout, sock.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Some((buf[..len].to_vec(), sock)),
        Ok(Err(e)) => {
            debug!(%ip, port, "CoAP unicast probe failed: {e:#}");
            None
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_oic_device_type() {
        let resources = vec![CoapResource {
            uri: "/oic/d".to_string(),
            rt: Some("oic.d.light".to_string()),
            ..Default::default()
        }];
        assert_eq!(infer_device_type(&resources), Some("light".to_string()));
    }

    #[test]
    fn infers_sensor_from_temperature_rt() {
        let resources = vec![CoapResource {
            uri: "/temp".to_string(),
            rt: Some("temperature".to_string()),
            ..Default::default()
        }];
        assert_eq!(infer_device_type(&resources), Some("sensor".to_string()));
    }

    #[test]
    fn risk_flags_include_observable_leak() {
        let record = CoapRecord {
            unauthenticated_access: true,
            observable_resources: vec!["/temp".to_string()],
            dtls_supported: false,
            ..Default::default()
        };
        let flags = generate_risk_flags(&record);
        assert!(flags.contains(&"unauthenticated_access".to_string()));
        assert!(flags.contains(&"no_dtls".to_string()));
        assert!(flags.contains(&"observable_data_leak".to_string()));
    }
}
