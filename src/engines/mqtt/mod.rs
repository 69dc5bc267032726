//! MQTT broker discovery.
//!
//! Probe shape: a TCP connect check, then CONNECT/SUBSCRIBE/PUBLISH phases
//! with a time budget split across them. The wire framing itself is
//! hand-rolled in `wire.rs` rather than pulling in a full client crate.

pub mod wire;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::model::{MqttCounters, MqttFlags, MqttRecord};
use wire::{decode_packet, Packet};

pub const DEFAULT_PORTS: &[(u16, &str, bool)] =
    &[(1883, "MQTT", false), (8883, "MQTT-TLS", true)];

const MAX_SYS_COLLECT: Duration = Duration::from_secs(3);
const MAX_TOPIC_COLLECT: Duration = Duration::from_secs(2);
const MAX_SAMPLED_TOPICS: usize = 50;
const MAX_SYS_ENTRIES: usize = 200;
const PROBE_DELAY: Duration = Duration::from_millis(100);

/// The topic used for the zero-byte anonymous-publish liveness check. Chosen
/// to read unambiguously as scan traffic to anyone grepping broker logs.
const PUBLISH_PROBE_TOPIC: &str = "net-discovery-probe/liveness";

/// Probes `target_ips` on the configured MQTT ports, within `timeout`. For
/// each IP: a TCP liveness check across both ports, then one full
/// CONNECT/$SYS/topic-sample/publish probe against whichever port answered
/// (plaintext preferred over TLS).
pub async fn discover(target_ips: &[IpAddr], overall_timeout: Duration) -> Vec<MqttRecord> {
    let deadline = tokio::time::Instant::now() + overall_timeout;
    let mut results = Vec::new();

    for ip in target_ips {
        if tokio::time::Instant::now() >= deadline {
            break;
        }

        let mut open_ports: Vec<(u16, &str, bool)> = Vec::new();
        for &(port, name, is_tls) in DEFAULT_PORTS {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            if tcp_port_open(*ip, port, Duration::from_secs(2)).await {
                open_ports.push((port, name, is_tls));
            }
        }
        if open_ports.is_empty() {
            continue;
        }
        let tls_supported = open_ports.iter().any(|(_, _, tls)| *tls);
        let (port, _name, use_tls) = open_ports
            .iter()
            .find(|(_, _, tls)| !tls)
            .copied()
            .unwrap_or(open_ports[0]);

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining < Duration::from_millis(500) {
            break;
        }

        if let Some(record) = probe_broker(*ip, port, use_tls, tls_supported, remaining).await {
            results.push(record);
        }

        tokio::time::sleep(PROBE_DELAY).await;
    }

    results
}

async fn tcp_port_open(ip: IpAddr, port: u16, probe_timeout: Duration) -> bool {
    timeout(probe_timeout, TcpStream::connect((ip, port)))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

/// Wraps a connected `TcpStream` in TLS, certificate and hostname
/// verification both disabled. This is a read-only liveness/metadata probe,
/// never an authenticated session, so a broker behind a self-signed or
/// expired certificate is still worth CONNECT-ing to.
async fn wrap_tls(stream: TcpStream, ip: IpAddr) -> Option<tokio_native_tls::TlsStream<TcpStream>> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .ok()?;
    let connector = tokio_native_tls::TlsConnector::from(connector);
    connector.connect(&ip.to_string(), stream).await.ok()
}

/// A broker connection, either plaintext or TLS-wrapped. Both the
/// CONNECT/$SYS/topic-sample/publish sequence below and `PacketReader` are
/// written once against this and work identically either way.
enum MqttStream {
    Plain(TcpStream),
    Tls(tokio_native_tls::TlsStream<TcpStream>),
}

impl AsyncRead for MqttStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MqttStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MqttStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MqttStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MqttStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MqttStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MqttStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MqttStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MqttStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MqttStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Runs the CONNECT/$SYS/topic-sample/publish sequence against whichever
/// port answered, over plaintext or TLS as `use_tls` requires.
async fn probe_broker(
    ip: IpAddr,
    port: u16,
    use_tls: bool,
    tls_supported: bool,
    budget: Duration,
) -> Option<MqttRecord> {
    let tcp = timeout(Duration::from_secs(5), TcpStream::connect((ip, port)))
        .await
        .ok()?
        .ok()?;

    let mut stream = if use_tls {
        MqttStream::Tls(wrap_tls(tcp, ip).await?)
    } else {
        MqttStream::Plain(tcp)
    };

    let client_id = format!("net-discovery-{:08x}", rand::random::<u32>());
    let connect_timeout = budget.mul_f32(0.3).min(Duration::from_secs(5));

    if stream.write_all(&wire::encode_connect(&client_id, 30)).await.is_err() {
        return None;
    }

    let mut reader = PacketReader::new(stream);
    let connack = match timeout(connect_timeout, reader.read_one()).await {
        Ok(Ok(Some(Packet::ConnAck(ack)))) => ack,
        _ => {
            debug!(%ip, port, "MQTT CONNECT timed out or was refused");
            return None;
        }
    };

    let mut record = MqttRecord {
        address: ip.to_string(),
        port,
        flags: MqttFlags {
            anonymous_access: connack.accepted(),
            tls_supported,
            ..Default::default()
        },
        ..Default::default()
    };

    if !connack.accepted() {
        record.risk_flags = generate_risk_flags(&record.flags);
        let _ = reader.into_inner().shutdown().await;
        return Some(record);
    }

    let sys_collect = budget.mul_f32(0.4).min(MAX_SYS_COLLECT);
    let mut sys_data: BTreeMap<String, String> = BTreeMap::new();
    let mut packet_id: u16 = 1;

    let subscribe = wire::encode_subscribe(packet_id, "$SYS/#");
    packet_id = packet_id.wrapping_add(1);
    let _ = reader.inner_mut().write_all(&subscribe).await;
    collect_publishes(&mut reader, sys_collect, |topic, payload| {
        if topic.starts_with("$SYS/") && sys_data.len() < MAX_SYS_ENTRIES {
            sys_data.insert(topic.to_string(), String::from_utf8_lossy(payload).into_owned());
        }
    })
    .await;

    parse_sys_data(&sys_data, &mut record);
    record.sys_metadata = sys_data;

    let topic_collect = budget.mul_f32(0.3).min(MAX_TOPIC_COLLECT);
    let mut sampled: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    let subscribe_all = wire::encode_subscribe(packet_id, "#");
    packet_id = packet_id.wrapping_add(1);
    let _ = reader.inner_mut().write_all(&subscribe_all).await;
    collect_publishes(&mut reader, topic_collect, |topic, _payload| {
        if !topic.starts_with('$') && sampled.len() < MAX_SAMPLED_TOPICS {
            sampled.insert(topic.to_string());
        }
    })
    .await;
    let _ = reader
        .inner_mut()
        .write_all(&wire::encode_unsubscribe(packet_id, "#"))
        .await;
    record.sampled_topics = sampled.into_iter().collect();

    let publish = wire::encode_publish_empty(PUBLISH_PROBE_TOPIC);
    record.flags.anonymous_publish = reader.inner_mut().write_all(&publish).await.is_ok();

    let _ = reader.inner_mut().write_all(&wire::encode_disconnect()).await;
    let _ = reader.into_inner().shutdown().await;

    record.risk_flags = generate_risk_flags(&record.flags);
    Some(record)
}

fn generate_risk_flags(flags: &MqttFlags) -> Vec<String> {
    let mut out = Vec::new();
    if flags.anonymous_access {
        out.push("open_broker".to_string());
    }
    if flags.anonymous_publish {
        out.push("anonymous_publish".to_string());
    }
    if !flags.tls_supported {
        out.push("no_tls".to_string());
    }
    out
}

fn parse_sys_data(sys: &BTreeMap<String, String>, record: &mut MqttRecord) {
    if let Some(version) = sys.get("$SYS/broker/version") {
        record.broker_version = Some(version.clone());
        if let Some(first_word) = version.split_whitespace().next() {
            let mut chars = first_word.chars();
            let name = match chars.next() {
                Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
                None => first_word.to_string(),
            };
            record.broker_name = Some(name);
        }
    }

    let uptime = sys
        .get("$SYS/broker/uptime")
        .or_else(|| sys.get("$SYS/broker/uptime/seconds"));
    if let Some(uptime) = uptime {
        record.counters.uptime_seconds = uptime.split_whitespace().next().and_then(|s| s.parse().ok());
    }

    let clients = sys
        .get("$SYS/broker/clients/connected")
        .or_else(|| sys.get("$SYS/broker/clients/active"));
    if let Some(clients) = clients {
        record.counters.connected_clients = clients.trim().parse().ok();
    }

    if let Some(recv) = sys.get("$SYS/broker/messages/received") {
        record.counters.messages_received = recv.trim().parse().ok();
    }
    if let Some(sent) = sys.get("$SYS/broker/messages/sent") {
        record.counters.messages_sent = sent.trim().parse().ok();
    }
}

struct PacketReader {
    stream: MqttStream,
    buf: Vec<u8>,
}

impl PacketReader {
    fn new(stream: MqttStream) -> Self {
        Self { stream, buf: Vec::new() }
    }

    fn inner_mut(&mut self) -> &mut MqttStream {
        &mut self.stream
    }

    fn into_inner(self) -> MqttStream {
        self.stream
    }

    async fn read_one(&mut self) -> std::io::Result<Option<Packet>> {
        loop {
            if let Some((packet, consumed)) = decode_packet(&self.buf)? {
                self.buf.drain(..consumed);
                return Ok(Some(packet));
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

async fn collect_publishes(
    reader: &mut PacketReader,
    window: Duration,
    mut on_publish: impl FnMut(&str, &[u8]),
) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, reader.read_one()).await {
            Ok(Ok(Some(Packet::Publish(p)))) => on_publish(&p.topic, &p.payload),
            Ok(Ok(Some(_))) => continue,
            Ok(Ok(None)) => break,
            Ok(Err(_)) | Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_flags_flag_open_broker_and_no_tls() {
        let flags = MqttFlags {
            anonymous_access: true,
            anonymous_publish: false,
            tls_supported: false,
        };
        let risks = generate_risk_flags(&flags);
        assert!(risks.contains(&"open_broker".to_string()));
        assert!(risks.contains(&"no_tls".to_string()));
        assert!(!risks.contains(&"anonymous_publish".to_string()));
    }

    #[test]
    fn parses_broker_version_and_name() {
        let mut sys = BTreeMap::new();
        sys.insert("$SYS/broker/version".to_string(), "mosquitto version 2.0.18".to_string());
        let mut record = MqttRecord::default();
        parse_sys_data(&sys, &mut record);
        assert_eq!(record.broker_version.as_deref(), Some("mosquitto version 2.0.18"));
        assert_eq!(record.broker_name.as_deref(), Some("Mosquitto"));
    }

    #[test]
    fn parses_uptime_with_unit_suffix() {
        let mut sys = BTreeMap::new();
        sys.insert("$SYS/broker/uptime".to_string(), "86400 seconds".to_string());
        let mut record = MqttRecord::default();
        parse_sys_data(&sys, &mut record);
        assert_eq!(record.counters.uptime_seconds, Some(86400));
    }
}
