//! Renders a working set of nodes into a proxy-core test config
//!
//! The document has one `select` group named [`TEST_GROUP`] listing every
//! emitted entry, and a single `MATCH` rule routing all traffic through it.
//! Entry names are the nodes' `core_name`s, which must already be unique.

use crate::config::CoreFlavor;
use crate::core::ports::PortTriple;
use crate::proxy::models::{Node, Protocol, RealityOpts, TlsOptions, Transport};
use crate::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml::{Mapping, Value};
use std::path::Path;
use tracing::debug;

/// Selector group the heavy tests switch
pub const TEST_GROUP: &str = "TEST";

static SHORT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{2,16}$").expect("Invalid short-id regex"));

/// Where the rendered core listens
#[derive(Debug, Clone)]
pub struct Listen<'a> {
    pub ports: PortTriple,
    pub api_host: &'a str,
    pub secret: Option<&'a str>,
}

/// A rendered config plus what made it in
#[derive(Debug, Clone)]
pub struct RenderedConfig {
    document: Mapping,
    /// Entry names in emission order
    pub entries: Vec<String>,
    /// Nodes skipped as unsupported or incomplete
    pub filtered: usize,
}

impl RenderedConfig {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn document(&self) -> &Mapping {
        &self.document
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.document)?)
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }
}

/// Converts nodes into proxy-core entries for one core flavor
#[derive(Debug, Clone, Copy)]
pub struct ConfigEmitter {
    flavor: CoreFlavor,
}

impl ConfigEmitter {
    pub fn new(flavor: CoreFlavor) -> Self {
        Self { flavor }
    }

    pub fn render(&self, nodes: &[Node], listen: &Listen<'_>) -> RenderedConfig {
        let mut proxies = Vec::with_capacity(nodes.len());
        let mut entries = Vec::with_capacity(nodes.len());
        let mut filtered = 0;

        for node in nodes {
            match self.proxy_entry(node) {
                Some(entry) => {
                    proxies.push(Value::Mapping(entry));
                    entries.push(node.core_name.clone());
                }
                None => {
                    debug!("filtered {} ({}) from core config", node.core_name, node.kind());
                    filtered += 1;
                }
            }
        }

        let mut group = Mapping::new();
        put(&mut group, "name", TEST_GROUP);
        put(&mut group, "type", "select");
        put(
            &mut group,
            "proxies",
            entries.iter().cloned().map(Value::from).collect::<Vec<_>>(),
        );

        let mut doc = Mapping::new();
        put(&mut doc, "mixed-port", listen.ports.mixed);
        put(&mut doc, "socks-port", listen.ports.socks);
        put(&mut doc, "allow-lan", false);
        put(&mut doc, "bind-address", "127.0.0.1");
        put(&mut doc, "mode", "rule");
        put(&mut doc, "log-level", "warning");
        put(&mut doc, "ipv6", true);
        put(
            &mut doc,
            "external-controller",
            format!("{}:{}", listen.api_host, listen.ports.api),
        );
        if let Some(secret) = listen.secret {
            put(&mut doc, "secret", secret);
        }
        put(&mut doc, "proxies", proxies);
        put(&mut doc, "proxy-groups", vec![Value::Mapping(group)]);
        put(&mut doc, "rules", vec![Value::from(format!("MATCH,{}", TEST_GROUP))]);

        RenderedConfig {
            document: doc,
            entries,
            filtered,
        }
    }

    /// One entry per protocol variant; `None` when the core cannot load it
    fn proxy_entry(&self, node: &Node) -> Option<Mapping> {
        let c = &node.candidate;
        let mut m = Mapping::new();
        put(&mut m, "name", node.core_name.as_str());

        match &c.protocol {
            Protocol::Shadowsocks { cipher, password } => {
                require(cipher)?;
                require(password)?;
                header(&mut m, "ss", &c.server, c.port);
                put(&mut m, "cipher", cipher.as_str());
                put(&mut m, "password", password.as_str());
                put(&mut m, "udp", true);
            }
            Protocol::ShadowsocksR {
                cipher,
                password,
                protocol,
                obfs,
            } => {
                require(cipher)?;
                require(password)?;
                header(&mut m, "ssr", &c.server, c.port);
                put(&mut m, "cipher", cipher.as_str());
                put(&mut m, "password", password.as_str());
                put(&mut m, "protocol", protocol.as_str());
                put(&mut m, "obfs", obfs.as_str());
                put(&mut m, "udp", true);
            }
            Protocol::Vmess {
                uuid,
                alter_id,
                security,
            } => {
                require(uuid)?;
                header(&mut m, "vmess", &c.server, c.port);
                put(&mut m, "uuid", uuid.as_str());
                put(&mut m, "alterId", *alter_id);
                put(&mut m, "cipher", security.as_str());
                put(&mut m, "udp", true);
                tls_options(&mut m, &c.tls, "servername", true);
                transport(&mut m, c.transport.as_ref());
            }
            Protocol::Trojan { password } => {
                require(password)?;
                header(&mut m, "trojan", &c.server, c.port);
                put(&mut m, "password", password.as_str());
                put(&mut m, "udp", true);
                tls_options(&mut m, &c.tls, "sni", false);
                transport(&mut m, c.transport.as_ref());
            }
            Protocol::Vless { uuid, flow, reality } => {
                if !self.flavor.supports_vless() {
                    return None;
                }
                require(uuid)?;
                header(&mut m, "vless", &c.server, c.port);
                put(&mut m, "uuid", uuid.as_str());
                put(&mut m, "udp", true);
                if let Some(flow) = flow.as_deref().filter(|f| !f.is_empty()) {
                    put(&mut m, "flow", flow);
                }
                match reality {
                    Some(reality) => {
                        put(&mut m, "reality-opts", reality_opts(reality)?);
                        let mut tls = c.tls.clone();
                        tls.tls = true;
                        tls_options(&mut m, &tls, "servername", true);
                        if let Some(fp) = &c.tls.fingerprint {
                            put(&mut m, "client-fingerprint", fp.as_str());
                        }
                    }
                    None => tls_options(&mut m, &c.tls, "servername", true),
                }
                transport(&mut m, c.transport.as_ref());
            }
            Protocol::Hysteria2 { password, up, down } => {
                if !self.flavor.supports_hysteria2() {
                    return None;
                }
                require(password)?;
                header(&mut m, "hysteria2", &c.server, c.port);
                put(&mut m, "password", password.as_str());
                put(&mut m, "up", format!("{} Mbps", up));
                put(&mut m, "down", format!("{} Mbps", down));
                tls_options(&mut m, &c.tls, "sni", false);
            }
            Protocol::Tuic { uuid, password } => {
                if self.flavor != CoreFlavor::Meta {
                    return None;
                }
                require(uuid)?;
                require(password)?;
                header(&mut m, "tuic", &c.server, c.port);
                put(&mut m, "uuid", uuid.as_str());
                put(&mut m, "password", password.as_str());
                tls_options(&mut m, &c.tls, "sni", false);
            }
        }

        Some(m)
    }
}

fn put(map: &mut Mapping, key: &str, value: impl Into<Value>) {
    map.insert(Value::from(key), value.into());
}

fn require(field: &str) -> Option<()> {
    (!field.trim().is_empty()).then_some(())
}

fn header(m: &mut Mapping, kind: &str, server: &str, port: u16) {
    put(m, "type", kind);
    put(m, "server", server);
    put(m, "port", port);
}

fn tls_options(m: &mut Mapping, tls: &TlsOptions, sni_key: &str, emit_flag: bool) {
    if emit_flag && tls.tls {
        put(m, "tls", true);
    }
    if let Some(sni) = tls.sni.as_deref().filter(|s| !s.is_empty()) {
        put(m, sni_key, sni);
    }
    if let Some(skip) = tls.skip_cert_verify {
        put(m, "skip-cert-verify", skip);
    }
}

fn reality_opts(reality: &RealityOpts) -> Option<Mapping> {
    require(&reality.public_key)?;
    if !SHORT_ID.is_match(&reality.short_id) {
        return None;
    }
    let mut opts = Mapping::new();
    put(&mut opts, "public-key", reality.public_key.as_str());
    put(&mut opts, "short-id", reality.short_id.as_str());
    Some(opts)
}

fn transport(m: &mut Mapping, transport: Option<&Transport>) {
    match transport {
        Some(Transport::Ws { path, host }) => {
            put(m, "network", "ws");
            let mut opts = Mapping::new();
            if let Some(path) = path {
                put(&mut opts, "path", path.as_str());
            }
            if let Some(host) = host {
                let mut headers = Mapping::new();
                put(&mut headers, "Host", host.as_str());
                put(&mut opts, "headers", headers);
            }
            if !opts.is_empty() {
                put(m, "ws-opts", opts);
            }
        }
        Some(Transport::Grpc { service_name }) => {
            put(m, "network", "grpc");
            let mut opts = Mapping::new();
            put(&mut opts, "grpc-service-name", service_name.as_str());
            put(m, "grpc-opts", opts);
        }
        Some(Transport::H2 { path }) => {
            put(m, "network", "h2");
            let mut opts = Mapping::new();
            put(&mut opts, "path", path.as_str());
            put(m, "h2-opts", opts);
        }
        None => {}
    }
}
