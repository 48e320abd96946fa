//! Candidate data models

use crate::proxy::geo::GeoLocation;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

/// Latency reported for nodes that never produced a measurement
pub const UNKNOWN_LATENCY_MS: u32 = 9999;

/// Protocol kind of a candidate, used for ranking and display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Vless,
    Vmess,
    Trojan,
    Hysteria2,
    Tuic,
    #[serde(rename = "ss")]
    Shadowsocks,
    #[serde(rename = "ssr")]
    ShadowsocksR,
}

impl ProtocolKind {
    /// Preference rank, lower is better
    pub fn priority(self) -> u8 {
        match self {
            ProtocolKind::Vless => 1,
            ProtocolKind::Vmess => 2,
            ProtocolKind::Trojan => 3,
            ProtocolKind::Hysteria2 => 4,
            ProtocolKind::Tuic => 5,
            ProtocolKind::Shadowsocks => 7,
            ProtocolKind::ShadowsocksR => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolKind::Vless => "vless",
            ProtocolKind::Vmess => "vmess",
            ProtocolKind::Trojan => "trojan",
            ProtocolKind::Hysteria2 => "hysteria2",
            ProtocolKind::Tuic => "tuic",
            ProtocolKind::Shadowsocks => "ss",
            ProtocolKind::ShadowsocksR => "ssr",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn default_security() -> String {
    "auto".to_string()
}

fn default_ssr_protocol() -> String {
    "origin".to_string()
}

fn default_ssr_obfs() -> String {
    "plain".to_string()
}

fn default_bandwidth() -> u32 {
    100
}

/// REALITY options for VLESS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealityOpts {
    #[serde(rename = "public-key")]
    pub public_key: String,
    #[serde(rename = "short-id", default)]
    pub short_id: String,
}

/// Protocol-specific credentials, one variant per supported protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Protocol {
    #[serde(rename = "ss")]
    Shadowsocks { cipher: String, password: String },
    #[serde(rename = "ssr")]
    ShadowsocksR {
        cipher: String,
        password: String,
        #[serde(default = "default_ssr_protocol")]
        protocol: String,
        #[serde(default = "default_ssr_obfs")]
        obfs: String,
    },
    #[serde(rename = "vmess")]
    Vmess {
        uuid: String,
        #[serde(rename = "alterId", default)]
        alter_id: u32,
        #[serde(default = "default_security")]
        security: String,
    },
    #[serde(rename = "trojan")]
    Trojan { password: String },
    #[serde(rename = "vless")]
    Vless {
        uuid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        flow: Option<String>,
        #[serde(rename = "reality-opts", default, skip_serializing_if = "Option::is_none")]
        reality: Option<RealityOpts>,
    },
    #[serde(rename = "hysteria2", alias = "hy2")]
    Hysteria2 {
        password: String,
        #[serde(default = "default_bandwidth")]
        up: u32,
        #[serde(default = "default_bandwidth")]
        down: u32,
    },
    #[serde(rename = "tuic")]
    Tuic { uuid: String, password: String },
}

impl Protocol {
    pub fn kind(&self) -> ProtocolKind {
        match self {
            Protocol::Shadowsocks { .. } => ProtocolKind::Shadowsocks,
            Protocol::ShadowsocksR { .. } => ProtocolKind::ShadowsocksR,
            Protocol::Vmess { .. } => ProtocolKind::Vmess,
            Protocol::Trojan { .. } => ProtocolKind::Trojan,
            Protocol::Vless { .. } => ProtocolKind::Vless,
            Protocol::Hysteria2 { .. } => ProtocolKind::Hysteria2,
            Protocol::Tuic { .. } => ProtocolKind::Tuic,
        }
    }
}

/// TLS options shared by the TLS-capable protocols
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tls: bool,
    #[serde(default, alias = "servername", skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    #[serde(rename = "skip-cert-verify", default, skip_serializing_if = "Option::is_none")]
    pub skip_cert_verify: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// Stream transport carried on top of the protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "network", rename_all = "lowercase")]
pub enum Transport {
    Ws {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
    },
    Grpc {
        #[serde(rename = "service-name", default)]
        service_name: String,
    },
    H2 {
        #[serde(default)]
        path: String,
    },
}

/// Identity of a candidate: the endpoint it points at
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidateKey {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for CandidateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One parsed proxy descriptor awaiting validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    pub server: String,
    pub port: u16,
    #[serde(flatten)]
    pub protocol: Protocol,
    #[serde(flatten)]
    pub tls: TlsOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
    /// Subscription the candidate was parsed from
    #[serde(default)]
    pub source: String,
}

impl Candidate {
    pub fn new(name: impl Into<String>, server: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            name: name.into(),
            server: server.into(),
            port,
            protocol,
            tls: TlsOptions::default(),
            transport: None,
            source: String::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn key(&self) -> CandidateKey {
        CandidateKey {
            host: self.server.clone(),
            port: self.port,
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        self.protocol.kind()
    }
}

/// Keep the first occurrence of every `(host, port)` pair, preserving input order
pub fn dedup_candidates(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.key()))
        .collect()
}

/// Per-stage measurements; `None` means the stage never ran for this node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_latency_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_delay_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_score: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_bps: Option<f64>,
}

/// A candidate travelling through the pipeline with its stage results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(flatten)]
    pub candidate: Candidate,
    #[serde(flatten)]
    pub result: StageResult,
    /// Unique entry name used inside proxy-core configs
    #[serde(skip)]
    pub core_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoLocation>,
}

impl Node {
    pub fn new(candidate: Candidate) -> Self {
        let core_name = candidate.name.clone();
        Self {
            candidate,
            result: StageResult::default(),
            core_name,
            original_name: None,
            location: None,
        }
    }

    pub fn key(&self) -> CandidateKey {
        self.candidate.key()
    }

    pub fn kind(&self) -> ProtocolKind {
        self.candidate.kind()
    }

    /// Best latency known so far, core delay preferred over TCP connect time
    pub fn latency_ms(&self) -> u32 {
        self.result
            .core_delay_ms
            .or(self.result.tcp_latency_ms)
            .unwrap_or(UNKNOWN_LATENCY_MS)
    }

    /// Ranking order: protocol priority, then latency ascending
    pub fn rank_cmp(&self, other: &Node) -> Ordering {
        self.kind()
            .priority()
            .cmp(&other.kind().priority())
            .then_with(|| self.latency_ms().cmp(&other.latency_ms()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ss(name: &str, host: &str, port: u16) -> Candidate {
        Candidate::new(
            name,
            host,
            port,
            Protocol::Shadowsocks {
                cipher: "aes-256-gcm".to_string(),
                password: "secret".to_string(),
            },
        )
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let input = vec![
            ss("a", "1.1.1.1", 443),
            ss("b", "2.2.2.2", 443),
            ss("c", "1.1.1.1", 443),
            ss("d", "1.1.1.1", 8443),
            ss("e", "2.2.2.2", 443),
        ];
        let names: Vec<_> = dedup_candidates(input).into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["a", "b", "d"]);
    }

    #[test]
    fn test_priority_order() {
        assert!(ProtocolKind::Vless.priority() < ProtocolKind::Vmess.priority());
        assert!(ProtocolKind::Tuic.priority() < ProtocolKind::Shadowsocks.priority());
        assert!(ProtocolKind::Shadowsocks.priority() < ProtocolKind::ShadowsocksR.priority());
    }

    #[test]
    fn test_rank_cmp_uses_priority_then_latency() {
        let mut vless = Node::new(Candidate::new(
            "v",
            "3.3.3.3",
            443,
            Protocol::Vless {
                uuid: "id".to_string(),
                flow: None,
                reality: None,
            },
        ));
        vless.result.core_delay_ms = Some(900);
        let mut fast_ss = Node::new(ss("s1", "1.1.1.1", 1));
        fast_ss.result.core_delay_ms = Some(50);
        let mut slow_ss = Node::new(ss("s2", "2.2.2.2", 1));
        slow_ss.result.core_delay_ms = Some(300);

        let mut nodes = vec![slow_ss, fast_ss, vless];
        nodes.sort_by(|a, b| a.rank_cmp(b));
        let names: Vec<_> = nodes.iter().map(|n| n.candidate.name.as_str()).collect();
        assert_eq!(names, vec!["v", "s1", "s2"]);
    }

    #[test]
    fn test_candidate_json_shape() {
        let json = r#"{
            "name": "jp-1",
            "server": "example.com",
            "port": 443,
            "type": "vmess",
            "uuid": "b831381d-6324-4d53-ad4f-8cda48b30811",
            "alterId": 0,
            "tls": true,
            "servername": "example.com",
            "transport": {"network": "ws", "path": "/ray"},
            "source": "https://sub.example/a"
        }"#;
        let candidate: Candidate = serde_json::from_str(json).unwrap();
        assert_eq!(candidate.kind(), ProtocolKind::Vmess);
        assert!(candidate.tls.tls);
        assert_eq!(candidate.tls.sni.as_deref(), Some("example.com"));
        assert_eq!(
            candidate.transport,
            Some(Transport::Ws {
                path: Some("/ray".to_string()),
                host: None
            })
        );
        match &candidate.protocol {
            Protocol::Vmess { security, .. } => assert_eq!(security, "auto"),
            other => panic!("unexpected protocol {:?}", other),
        }
    }

    #[test]
    fn test_hy2_alias() {
        let json = r#"{"name":"h","server":"h.example","port":8443,"type":"hy2","password":"p"}"#;
        let candidate: Candidate = serde_json::from_str(json).unwrap();
        assert_eq!(candidate.kind(), ProtocolKind::Hysteria2);
    }

    #[test]
    fn test_node_latency_fallback() {
        let mut node = Node::new(ss("a", "1.1.1.1", 1));
        assert_eq!(node.latency_ms(), UNKNOWN_LATENCY_MS);
        node.result.tcp_latency_ms = Some(40);
        assert_eq!(node.latency_ms(), 40);
        node.result.core_delay_ms = Some(120);
        assert_eq!(node.latency_ms(), 120);
    }
}
