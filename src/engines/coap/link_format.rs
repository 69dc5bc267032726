//! RFC 6690 CoRE Link Format parsing.
//!
//! Splits on commas that precede a `<`, pulls the URI out of the angle
//! brackets, then walks `;key=value`/boolean attribute pairs.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkEntry {
    pub uri: String,
    pub rt: Option<String>,
    pub if_desc: Option<String>,
    pub ct: Option<String>,
    pub observable: bool,
    pub title: Option<String>,
}

/// Parses a `/.well-known/core` payload into its link entries. Malformed or
/// empty input yields an empty list rather than an error — CoAP payloads
/// come from untrusted devices and a parse failure here must not abort a
/// scan.
pub fn parse(payload: &str) -> Vec<LinkEntry> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Vec::new();
    }

    split_top_level(payload)
        .into_iter()
        .filter_map(parse_entry)
        .collect()
}

/// Splits on commas that are followed (after optional whitespace) by `<`,
/// i.e. commas that actually separate link-format entries rather than ones
/// embedded inside an attribute value.
fn split_top_level(payload: &str) -> Vec<&str> {
    let bytes = payload.as_bytes();
    let mut entries = Vec::new();
    let mut start = 0usize;

    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b',' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            if j < bytes.len() && bytes[j] == b'<' {
                entries.push(&payload[start..i]);
                start = i + 1;
            }
        }
        i += 1;
    }
    entries.push(&payload[start..]);
    entries
}

fn parse_entry(entry: &str) -> Option<LinkEntry> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }
    if !entry.starts_with('<') {
        return None;
    }
    let close = entry.find('>')?;
    let uri = entry[1..close].to_string();
    let attrs_str = &entry[close + 1..];

    let mut out = LinkEntry {
        uri,
        ..Default::default()
    };

    for (key, value) in parse_attrs(attrs_str) {
        match key.as_str() {
            "rt" => out.rt = value,
            "if" => out.if_desc = value,
            "ct" => out.ct = value,
            "title" => out.title = value,
            "obs" => out.observable = true,
            _ => {}
        }
    }
    Some(out)
}

/// Parses `;key` and `;key=value`/`;key="value"` attribute pairs.
fn parse_attrs(s: &str) -> Vec<(String, Option<String>)> {
    let mut out = Vec::new();
    for part in s.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((key, value)) => {
                let value = value.trim().trim_matches('"').to_string();
                out.push((key.trim().to_string(), Some(value)));
            }
            None => out.push((part.to_string(), None)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_resources() {
        let payload = r#"</temp>;rt="temperature";obs;ct=50,</humidity>;rt="humidity""#;
        let entries = parse(payload);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].uri, "/temp");
        assert_eq!(entries[0].rt.as_deref(), Some("temperature"));
        assert!(entries[0].observable);
        assert_eq!(entries[0].ct.as_deref(), Some("50"));
        assert_eq!(entries[1].uri, "/humidity");
        assert!(!entries[1].observable);
    }

    #[test]
    fn empty_payload_yields_no_entries() {
        assert!(parse("").is_empty());
        assert!(parse("   ").is_empty());
    }

    #[test]
    fn entry_without_attributes() {
        let entries = parse("</.well-known/core>");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].uri, "/.well-known/core");
        assert!(entries[0].rt.is_none());
    }
}
