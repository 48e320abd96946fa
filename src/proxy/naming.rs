//! Node naming: config-safe entry names and final geolocated labels

use crate::proxy::geo::{GeoLocation, GeoLookup};
use crate::proxy::models::{Node, UNKNOWN_LATENCY_MS};
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Maximum length of a sanitized entry name
const MAX_ENTRY_NAME_LEN: usize = 50;

/// Fallback for names that sanitize to nothing
const FALLBACK_NAME: &str = "Node";

/// Country code used when nothing better is known
pub const UNKNOWN_COUNTRY: &str = "NA";

/// Concurrent geolocation lookups while renaming
const GEO_LOOKUP_CONCURRENCY: usize = 50;

const UNSAFE_CHARS: &[char] = &[
    ':', '{', '}', '[', ']', ',', '&', '*', '?', '|', '-', '<', '>', '=', '!', '%', '@', '\\',
    '/', ' ', '\'', '"',
];

static ASCII_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-z]+").expect("Invalid ASCII word regex"));

/// Multi-word and CJK keywords, matched as substrings
const PHRASE_KEYWORDS: &[(&str, &str)] = &[
    ("united states", "US"),
    ("united kingdom", "GB"),
    ("hong kong", "HK"),
    ("hongkong", "HK"),
    ("中国", "CN"),
    ("美国", "US"),
    ("日本", "JP"),
    ("韩国", "KR"),
    ("南韩", "KR"),
    ("新加坡", "SG"),
    ("狮城", "SG"),
    ("香港", "HK"),
    ("台湾", "TW"),
    ("英国", "GB"),
    ("德国", "DE"),
    ("法国", "FR"),
    ("澳大利亚", "AU"),
    ("加拿大", "CA"),
    ("荷兰", "NL"),
    ("意大利", "IT"),
    ("西班牙", "ES"),
    ("巴西", "BR"),
    ("印度", "IN"),
    ("俄罗斯", "RU"),
    ("俄国", "RU"),
];

/// Single ASCII words, matched against whole letter runs of the name
const WORD_KEYWORDS: &[(&str, &str)] = &[
    ("china", "CN"),
    ("cn", "CN"),
    ("usa", "US"),
    ("us", "US"),
    ("america", "US"),
    ("japan", "JP"),
    ("jp", "JP"),
    ("tokyo", "JP"),
    ("korea", "KR"),
    ("kr", "KR"),
    ("seoul", "KR"),
    ("singapore", "SG"),
    ("sg", "SG"),
    ("hk", "HK"),
    ("taiwan", "TW"),
    ("tw", "TW"),
    ("uk", "GB"),
    ("gb", "GB"),
    ("london", "GB"),
    ("germany", "DE"),
    ("de", "DE"),
    ("frankfurt", "DE"),
    ("france", "FR"),
    ("fr", "FR"),
    ("paris", "FR"),
    ("australia", "AU"),
    ("au", "AU"),
    ("canada", "CA"),
    ("ca", "CA"),
    ("netherlands", "NL"),
    ("nl", "NL"),
    ("amsterdam", "NL"),
    ("italy", "IT"),
    ("it", "IT"),
    ("spain", "ES"),
    ("es", "ES"),
    ("brazil", "BR"),
    ("br", "BR"),
    ("india", "IN"),
    ("in", "IN"),
    ("russia", "RU"),
    ("ru", "RU"),
];

/// Make a display name safe for use as a proxy-core entry name
pub fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .filter(char::is_ascii)
        .map(|c| if UNSAFE_CHARS.contains(&c) { '_' } else { c })
        .take(MAX_ENTRY_NAME_LEN)
        .collect();

    if sanitized.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        sanitized
    }
}

/// Hands out unique names by suffixing `_2`, `_3`, ... on collision
#[derive(Debug, Default)]
pub struct UniqueNames {
    used: HashSet<String>,
}

impl UniqueNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&mut self, base: &str) -> String {
        if self.used.insert(base.to_string()) {
            return base.to_string();
        }
        let mut counter = 2usize;
        loop {
            let candidate = format!("{}_{}", base, counter);
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            counter += 1;
        }
    }
}

/// Give every node a sanitized entry name that is unique within the batch
pub fn assign_core_names(nodes: &mut [Node]) {
    let mut names = UniqueNames::new();
    for node in nodes.iter_mut() {
        node.core_name = names.claim(&sanitize_name(&node.candidate.name));
    }
}

/// Country code hinted at by a display name, if any
pub fn country_from_name(name: &str) -> Option<&'static str> {
    let lower = name.to_lowercase();

    if let Some((_, code)) = PHRASE_KEYWORDS.iter().find(|(kw, _)| lower.contains(kw)) {
        return Some(*code);
    }

    ASCII_WORD.find_iter(&lower).find_map(|word| {
        WORD_KEYWORDS
            .iter()
            .find(|(kw, _)| *kw == word.as_str())
            .map(|(_, code)| *code)
    })
}

/// Final label: `{CC}{index:02}_{unlock}_{latency}` when unlock >= 10,
/// otherwise `{CC}{index:02}_{latency}`
pub fn node_label(country: &str, index: usize, unlock: u8, latency_ms: u32, max_len: usize) -> String {
    let latency = latency_ms.min(UNKNOWN_LATENCY_MS);
    let label = if unlock >= 10 {
        format!("{}{:02}_{}_{}", country, index, unlock, latency)
    } else {
        format!("{}{:02}_{}", country, index, latency)
    };
    label.chars().take(max_len).collect()
}

/// Renames finalized nodes with country-indexed labels
pub struct NodeRenamer {
    geo: Arc<dyn GeoLookup>,
    dns_timeout: Duration,
    max_len: usize,
}

impl NodeRenamer {
    pub fn new(geo: Arc<dyn GeoLookup>, dns_timeout: Duration, max_len: usize) -> Self {
        Self {
            geo,
            dns_timeout,
            max_len,
        }
    }

    /// Rename in ranked order; indices count up per country
    pub async fn rename(&self, nodes: &mut [Node]) {
        let mut countries: Vec<Option<String>> = nodes
            .iter()
            .map(|n| country_from_name(&n.candidate.name).map(String::from))
            .collect();

        let pending: Vec<(usize, String)> = countries
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_none())
            .map(|(i, _)| (i, nodes[i].candidate.server.clone()))
            .collect();

        let resolved: Vec<(usize, Option<IpAddr>)> = stream::iter(pending)
            .map(|(i, host)| async move { (i, self.resolve(&host).await) })
            .buffer_unordered(GEO_LOOKUP_CONCURRENCY)
            .collect()
            .await;

        let mut by_ip: HashMap<IpAddr, Vec<usize>> = HashMap::new();
        for (i, ip) in resolved {
            if let Some(ip) = ip {
                by_ip.entry(ip).or_default().push(i);
            }
        }

        let located: Vec<(IpAddr, Option<GeoLocation>)> =
            stream::iter(by_ip.keys().copied().collect::<Vec<_>>())
                .map(|ip| async move { (ip, self.geo.locate(ip).await) })
                .buffer_unordered(GEO_LOOKUP_CONCURRENCY)
                .collect()
                .await;

        for (ip, location) in located {
            let Some(location) = location else { continue };
            let code = location.country();
            for &i in by_ip.get(&ip).map(Vec::as_slice).unwrap_or_default() {
                countries[i] = code.clone();
                nodes[i].location = Some(location.clone());
            }
        }

        let mut counters: HashMap<String, usize> = HashMap::new();
        for (node, country) in nodes.iter_mut().zip(countries) {
            let country = country.unwrap_or_else(|| UNKNOWN_COUNTRY.to_string());
            let index = counters.entry(country.clone()).or_insert(0);
            *index += 1;

            let label = node_label(
                &country,
                *index,
                node.result.unlock_score.unwrap_or(0),
                node.latency_ms(),
                self.max_len,
            );
            debug!("renaming {:?} -> {}", node.candidate.name, label);
            node.original_name = Some(std::mem::replace(&mut node.candidate.name, label));
        }

        info!("Renamed {} nodes across {} countries", nodes.len(), counters.len());
    }

    async fn resolve(&self, host: &str) -> Option<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
        match tokio::time::timeout(self.dns_timeout, tokio::net::lookup_host((host, 0))).await {
            Ok(Ok(mut addrs)) => addrs.next().map(|a| a.ip()),
            _ => None,
        }
    }
}
