//! BannerGrabber.
//!
//! Connects to a curated set of common service ports and reads back
//! whatever greeting or response the service sends, truncated to a safe
//! length. This is a read-only banner capture, never an authenticated
//! session.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::model::{DeviceInfo, ServiceEntry};

use super::Enricher;

/// Either half of a banner connection, plaintext or TLS-wrapped, read and
/// written through identically.
trait BannerStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> BannerStream for T {}

const MAX_BANNER_LEN: usize = 512;
const PER_PORT_TIMEOUT: Duration = Duration::from_secs(2);

struct PortProbe {
    port: u16,
    name: &'static str,
    http_style: bool,
    tls: bool,
}

const BANNER_PORTS: &[PortProbe] = &[
    PortProbe { port: 21, name: "FTP", http_style: false, tls: false },
    PortProbe { port: 22, name: "SSH", http_style: false, tls: false },
    PortProbe { port: 23, name: "Telnet", http_style: false, tls: false },
    PortProbe { port: 80, name: "HTTP", http_style: true, tls: false },
    PortProbe { port: 443, name: "HTTPS", http_style: true, tls: true },
    PortProbe { port: 554, name: "RTSP", http_style: false, tls: false },
    PortProbe { port: 1883, name: "MQTT", http_style: false, tls: false },
    PortProbe { port: 8080, name: "HTTP-Alt", http_style: true, tls: false },
    PortProbe { port: 8443, name: "HTTPS-Alt", http_style: true, tls: true },
    PortProbe { port: 8883, name: "MQTT-TLS", http_style: false, tls: true },
];

#[derive(Default)]
pub struct BannerGrabber;

#[async_trait::async_trait]
impl Enricher for BannerGrabber {
    fn name(&self) -> &'static str {
        "banner_grabber"
    }

    fn can_enrich(&self, device: &DeviceInfo) -> bool {
        !device.address.is_empty()
    }

    async fn enrich(&self, device: &mut DeviceInfo, budget: Duration) -> anyhow::Result<()> {
        let host = device.address.clone();
        let mut ports: Vec<(u16, &'static str, bool, bool)> = BANNER_PORTS
            .iter()
            .map(|p| (p.port, p.name, p.http_style, p.tls))
            .collect();
        if let Some(own_port) = device.port {
            if !ports.iter().any(|(p, ..)| *p == own_port) {
                ports.push((own_port, "Port", true, false));
            }
        }

        let per_port = budget
            .checked_div(ports.len() as u32)
            .unwrap_or(PER_PORT_TIMEOUT)
            .min(PER_PORT_TIMEOUT);

        for (port, name, http_style, use_tls) in ports {
            if let Some(banner) = grab_single(&host, port, name, http_style, use_tls, per_port).await {
                device.banners.insert(port, banner.clone());
                device.services.push(ServiceEntry {
                    port,
                    name: name.to_string(),
                    banner,
                    tls: use_tls,
                    tls_version: None,
                });
            }
        }
        Ok(())
    }
}

/// Wraps a connected `TcpStream` in TLS, certificate and hostname
/// verification both disabled — this is a read-only banner capture, never
/// an authenticated session.
async fn wrap_tls(stream: TcpStream, host: &str) -> Option<tokio_native_tls::TlsStream<TcpStream>> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .ok()?;
    let connector = tokio_native_tls::TlsConnector::from(connector);
    connector.connect(host, stream).await.ok()
}

async fn grab_single(
    host: &str,
    port: u16,
    name: &str,
    http_style: bool,
    use_tls: bool,
    per_port: Duration,
) -> Option<String> {
    let tcp = timeout(per_port, TcpStream::connect((host, port))).await.ok()?.ok()?;
    let mut stream: Box<dyn BannerStream> = if use_tls {
        Box::new(wrap_tls(tcp, host).await?)
    } else {
        Box::new(tcp)
    };

    if http_style {
        let probe = format!("GET / HTTP/1.0\r\nHost: {host}\r\n\r\n");
        let _ = stream.write_all(probe.as_bytes()).await;
    } else if name == "RTSP" {
        let _ = stream.write_all(b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n").await;
    }

    let mut buf = vec![0u8; 1024];
    let n = timeout(per_port, stream.read(&mut buf)).await.ok()?.ok()?;
    if n == 0 {
        return None;
    }
    let mut banner = String::from_utf8_lossy(&buf[..n]).trim().to_string();
    if banner.is_empty() {
        return None;
    }
    if banner.len() > MAX_BANNER_LEN {
        banner.truncate(MAX_BANNER_LEN);
        banner.push_str("...");
    }
    Some(banner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProtocolTag;

    #[test]
    fn requires_a_non_empty_address() {
        let grabber = BannerGrabber;
        let mut device = DeviceInfo::new(ProtocolTag::Upnp, "");
        device.address.clear();
        assert!(!grabber.can_enrich(&device));
    }
}
