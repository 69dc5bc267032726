//! ServerHeaderFingerprinter.
//!
//! Regex pattern table ordered from specific products to generic OS
//! families; the first match wins.

use std::sync::LazyLock;
use std::time::Duration;

use regex::RegexBuilder;

use crate::model::DeviceInfo;

use super::Enricher;

struct OsPattern {
    regex: regex::Regex,
    name: &'static str,
}

static OS_PATTERNS: LazyLock<Vec<OsPattern>> = LazyLock::new(|| {
    [
        (r"Synology", "Synology DSM (Linux)"),
        (r"QNAP", "QNAP QTS (Linux)"),
        (r"MikroTik", "MikroTik RouterOS"),
        (r"OpenWrt", "OpenWrt (Linux)"),
        (r"DD-WRT", "DD-WRT (Linux)"),
        (r"Ubiquiti|UniFi", "Ubiquiti (Linux)"),
        (r"FreeNAS|TrueNAS", "TrueNAS (FreeBSD)"),
        (r"pfSense", "pfSense (FreeBSD)"),
        (r"ESXi|VMware", "VMware ESXi"),
        (r"Cisco", "Cisco IOS"),
        (r"Roku", "Roku OS"),
        (r"Tizen", "Samsung Tizen"),
        (r"webOS", "LG webOS"),
        (r"Android", "Android"),
        (r"AirPort", "Apple AirPort"),
        (r"Ubuntu", "Linux (Ubuntu)"),
        (r"Debian", "Linux (Debian)"),
        (r"CentOS|Red\s?Hat|RHEL", "Linux (RHEL)"),
        (r"Fedora", "Linux (Fedora)"),
        (r"Arch\s?Linux", "Linux (Arch)"),
        (r"Linux", "Linux"),
        (r"FreeBSD", "FreeBSD"),
        (r"Windows\s*NT\s*10", "Windows 10/11"),
        (r"Windows\s*NT\s*6\.3", "Windows 8.1"),
        (r"Windows\s*NT\s*6\.[12]", "Windows 7/8"),
        (r"Windows", "Windows"),
        (r"Darwin|macOS|Mac\s?OS", "macOS"),
        (r"iPhone\s?OS|iOS", "iOS"),
    ]
    .into_iter()
    .map(|(pattern, name)| OsPattern {
        regex: RegexBuilder::new(pattern).case_insensitive(true).build().expect("static pattern"),
        name,
    })
    .collect()
});

pub struct ServerHeaderFingerprinter;

#[async_trait::async_trait]
impl Enricher for ServerHeaderFingerprinter {
    fn name(&self) -> &'static str {
        "server_header_fingerprint"
    }

    fn can_enrich(&self, device: &DeviceInfo) -> bool {
        device.raw_data.contains_key("SERVER") || !device.banners.is_empty()
    }

    async fn enrich(&self, device: &mut DeviceInfo, _timeout: Duration) -> anyhow::Result<()> {
        let mut candidates = Vec::new();
        if let Some(server) = device.raw_data.get("SERVER") {
            candidates.push(server.clone());
        }
        for banner in device.banners.values() {
            for line in banner.lines() {
                if line.to_ascii_lowercase().starts_with("server:") {
                    if let Some((_, value)) = line.split_once(':') {
                        candidates.push(value.trim().to_string());
                    }
                }
            }
        }

        for candidate in candidates {
            if let Some(guess) = match_os(&candidate) {
                device.os_guess = Some(guess.to_string());
                break;
            }
        }
        Ok(())
    }
}

fn match_os(text: &str) -> Option<&'static str> {
    OS_PATTERNS.iter().find(|p| p.regex.is_match(text)).map(|p| p.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specific_product_wins_over_generic_linux() {
        assert_eq!(match_os("Linux/3.10 UPnP/1.0 Synology/1.0"), Some("Synology DSM (Linux)"));
    }

    #[test]
    fn bare_linux_falls_through_to_generic() {
        assert_eq!(match_os("Linux/3.10 UPnP/1.0 Hikvision/1.0"), Some("Linux"));
    }

    #[test]
    fn windows_10_more_specific_than_bare_windows() {
        assert_eq!(match_os("Windows NT 10.0"), Some("Windows 10/11"));
    }

    #[test]
    fn unmatched_text_yields_none() {
        assert_eq!(match_os("totally-custom-firmware/9"), None);
    }
}
