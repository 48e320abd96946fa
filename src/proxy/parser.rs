//! Candidate input loading
//!
//! Accepts the upstream parser's output in either of two shapes:
//! - a JSON (or YAML) list of candidate records
//! - a Clash-style document with a top-level `proxies:` list
//!
//! Clash field spellings (`network` + `ws-opts`, `cipher` on vmess,
//! `client-fingerprint`, ...) are normalized before decoding. Entries that
//! still fail to decode are skipped and counted.

use crate::proxy::models::Candidate;
use crate::Result;
use anyhow::bail;
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Candidates loaded from one input plus what had to be dropped
#[derive(Debug, Clone, Default)]
pub struct ParseReport {
    pub candidates: Vec<Candidate>,
    pub skipped: usize,
}

/// Loads candidate lists from files or strings
pub struct CandidateParser;

impl CandidateParser {
    /// Parse a whole document; `default_source` fills in missing provenance
    pub fn parse_str(content: &str, default_source: &str) -> Result<ParseReport> {
        let document: serde_yaml::Value = serde_yaml::from_str(content)?;
        let entries = match document {
            serde_yaml::Value::Sequence(entries) => entries,
            serde_yaml::Value::Mapping(mut map) => match map.remove("proxies") {
                Some(serde_yaml::Value::Sequence(entries)) => entries,
                Some(serde_yaml::Value::Null) | None => Vec::new(),
                Some(_) => bail!("`proxies` is not a list"),
            },
            serde_yaml::Value::Null => Vec::new(),
            _ => bail!("expected a list of candidates or a `proxies:` document"),
        };

        let mut report = ParseReport::default();
        for (index, entry) in entries.into_iter().enumerate() {
            match Self::parse_entry(entry, default_source) {
                Some(candidate) => report.candidates.push(candidate),
                None => {
                    debug!("skipping entry #{} of {}", index, default_source);
                    report.skipped += 1;
                }
            }
        }

        if report.skipped > 0 {
            warn!(
                "{}: skipped {} unusable entries",
                default_source, report.skipped
            );
        }
        Ok(report)
    }

    /// Parse a file; provenance defaults to the file name
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<ParseReport> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let source = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let report = Self::parse_str(&content, &source)?;
        info!(
            "Loaded {} candidates from {:?} ({} skipped)",
            report.candidates.len(),
            path,
            report.skipped
        );
        Ok(report)
    }

    fn parse_entry(entry: serde_yaml::Value, default_source: &str) -> Option<Candidate> {
        let Value::Object(mut fields) = serde_json::to_value(entry).ok()? else {
            return None;
        };
        normalize(&mut fields);

        let mut candidate: Candidate = match serde_json::from_value(Value::Object(fields)) {
            Ok(candidate) => candidate,
            Err(e) => {
                debug!("undecodable entry: {}", e);
                return None;
            }
        };
        if candidate.server.trim().is_empty() || candidate.port == 0 {
            return None;
        }
        if candidate.name.trim().is_empty() {
            candidate.name = candidate.key().to_string();
        }
        if candidate.source.is_empty() {
            candidate.source = default_source.to_string();
        }
        Some(candidate)
    }
}

/// Rewrite Clash spellings into the candidate record shape
fn normalize(fields: &mut Map<String, Value>) {
    // Ports sometimes arrive quoted
    let quoted_port = fields
        .get("port")
        .and_then(Value::as_str)
        .and_then(|p| p.trim().parse::<u16>().ok());
    if let Some(port) = quoted_port {
        fields.insert("port".to_string(), Value::from(port));
    }
    fields.entry("name").or_insert_with(|| Value::from(""));

    let is_vmess = fields.get("type").and_then(Value::as_str) == Some("vmess");
    if is_vmess && !fields.contains_key("security") {
        if let Some(cipher) = fields.remove("cipher") {
            fields.insert("security".to_string(), cipher);
        }
    }

    if !fields.contains_key("fingerprint") {
        if let Some(fp) = fields.remove("client-fingerprint") {
            fields.insert("fingerprint".to_string(), fp);
        }
    }

    if fields.contains_key("transport") {
        return;
    }
    let network = fields
        .remove("network")
        .and_then(|n| n.as_str().map(str::to_ascii_lowercase));
    let transport = match network.as_deref() {
        Some("ws") => {
            let opts = fields.remove("ws-opts").unwrap_or(Value::Null);
            let mut t = Map::new();
            t.insert("network".to_string(), Value::from("ws"));
            if let Some(path) = opts.get("path").filter(|p| p.is_string()) {
                t.insert("path".to_string(), path.clone());
            }
            let host = opts
                .get("headers")
                .and_then(|h| h.get("Host").or_else(|| h.get("host")))
                .filter(|h| h.is_string());
            if let Some(host) = host {
                t.insert("host".to_string(), host.clone());
            }
            Some(t)
        }
        Some("grpc") => {
            let opts = fields.remove("grpc-opts").unwrap_or(Value::Null);
            let mut t = Map::new();
            t.insert("network".to_string(), Value::from("grpc"));
            if let Some(name) = opts.get("grpc-service-name").filter(|n| n.is_string()) {
                t.insert("service-name".to_string(), name.clone());
            }
            Some(t)
        }
        Some("h2") | Some("http") => {
            let opts = fields.remove("h2-opts").unwrap_or(Value::Null);
            let mut t = Map::new();
            t.insert("network".to_string(), Value::from("h2"));
            let path = match opts.get("path") {
                Some(Value::Array(paths)) => paths.first().cloned(),
                Some(path @ Value::String(_)) => Some(path.clone()),
                _ => None,
            };
            if let Some(path) = path {
                t.insert("path".to_string(), path);
            }
            Some(t)
        }
        _ => None,
    };
    if let Some(transport) = transport {
        fields.insert("transport".to_string(), Value::Object(transport));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::{Protocol, ProtocolKind, Transport};

    #[test]
    fn test_parse_json_list() {
        let content = r#"[
            {"name": "a", "server": "1.1.1.1", "port": 443, "type": "trojan", "password": "p", "source": "sub-a"},
            {"name": "b", "server": "2.2.2.2", "port": 8388, "type": "ss", "cipher": "aes-128-gcm", "password": "p"},
            {"name": "c", "server": "3.3.3.3", "port": 1, "type": "wireguard"},
            {"name": "d", "port": 443, "type": "trojan", "password": "p"}
        ]"#;
        let report = CandidateParser::parse_str(content, "input.json").unwrap();

        assert_eq!(report.candidates.len(), 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.candidates[0].source, "sub-a");
        assert_eq!(report.candidates[1].source, "input.json");
    }

    #[test]
    fn test_parse_clash_document() {
        let content = r#"
port: 7890
proxies:
  - name: "hk vmess"
    type: vmess
    server: hk.example.com
    port: "443"
    uuid: b831381d-6324-4d53-ad4f-8cda48b30811
    alterId: 0
    cipher: auto
    tls: true
    servername: hk.example.com
    network: ws
    ws-opts:
      path: /ray
      headers:
        Host: cdn.example.com
  - name: grpc-trojan
    type: trojan
    server: 5.5.5.5
    port: 443
    password: pw
    sni: t.example.com
    network: grpc
    grpc-opts:
      grpc-service-name: svc
  - name: reality
    type: vless
    server: 6.6.6.6
    port: 443
    uuid: b831381d-6324-4d53-ad4f-8cda48b30811
    flow: xtls-rprx-vision
    client-fingerprint: chrome
    reality-opts:
      public-key: pubkey
      short-id: abcd
  - name: broken
    type: vmess
    server: 7.7.7.7
"#;
        let report = CandidateParser::parse_str(content, "clash.yaml").unwrap();
        assert_eq!(report.candidates.len(), 3);
        assert_eq!(report.skipped, 1);

        let vmess = &report.candidates[0];
        assert_eq!(vmess.port, 443);
        assert_eq!(vmess.tls.sni.as_deref(), Some("hk.example.com"));
        assert_eq!(
            vmess.transport,
            Some(Transport::Ws {
                path: Some("/ray".to_string()),
                host: Some("cdn.example.com".to_string()),
            })
        );
        match &vmess.protocol {
            Protocol::Vmess { security, .. } => assert_eq!(security, "auto"),
            other => panic!("unexpected {:?}", other),
        }

        let trojan = &report.candidates[1];
        assert_eq!(
            trojan.transport,
            Some(Transport::Grpc {
                service_name: "svc".to_string()
            })
        );

        let vless = &report.candidates[2];
        assert_eq!(vless.kind(), ProtocolKind::Vless);
        assert_eq!(vless.tls.fingerprint.as_deref(), Some("chrome"));
        match &vless.protocol {
            Protocol::Vless { reality: Some(r), flow, .. } => {
                assert_eq!(r.short_id, "abcd");
                assert_eq!(flow.as_deref(), Some("xtls-rprx-vision"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_and_invalid_documents() {
        assert!(CandidateParser::parse_str("", "x").unwrap().candidates.is_empty());
        assert!(CandidateParser::parse_str("proxies:\n", "x").unwrap().candidates.is_empty());
        assert!(CandidateParser::parse_str("proxies: 3\n", "x").is_err());
        assert!(CandidateParser::parse_str("42", "x").is_err());
    }

    #[test]
    fn test_missing_name_uses_endpoint() {
        let report =
            CandidateParser::parse_str(r#"[{"server":"h.example","port":8443,"type":"hy2","password":"p"}]"#, "x")
                .unwrap();
        assert_eq!(report.candidates[0].name, "h.example:8443");
    }

    #[test]
    fn test_parse_file_defaults_source_to_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub_jp.yaml");
        fs::write(
            &path,
            "proxies:\n  - {name: a, type: ss, server: 1.2.3.4, port: 8388, cipher: aes-256-gcm, password: x}\n",
        )
        .unwrap();

        let report = CandidateParser::parse_file(&path).unwrap();
        assert_eq!(report.candidates[0].source, "sub_jp.yaml");
        assert!(CandidateParser::parse_file(dir.path().join("missing.json")).is_err());
    }
}
