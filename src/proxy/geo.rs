//! Geolocation for node renaming: MMDB or ip-api lookups behind an on-disk cache

use crate::Result;
use async_trait::async_trait;
use maxminddb::{geoip2, Reader};
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default ip-api endpoint
const IP_API_BASE: &str = "http://ip-api.com/json";

/// Timeout for a single ip-api request
const IP_API_TIMEOUT: Duration = Duration::from_secs(10);

/// Geographic location information for an IP address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GeoLocation {
    /// ISO 3166-1 alpha-2 country code (e.g., "US", "CN")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city_name: Option<String>,
}

impl GeoLocation {
    pub fn with_country(country_code: Option<String>, country_name: Option<String>) -> Self {
        Self {
            country_code,
            country_name,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.country_code.is_none() && self.country_name.is_none() && self.city_name.is_none()
    }

    /// Upper-cased country code, if known
    pub fn country(&self) -> Option<String> {
        self.country_code
            .as_deref()
            .filter(|cc| !cc.is_empty())
            .map(str::to_ascii_uppercase)
    }
}

impl std::fmt::Display for GeoLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = [self.city_name.clone(), self.country_name.clone()]
            .into_iter()
            .flatten()
            .collect();

        if parts.is_empty() {
            write!(f, "Unknown Location")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

/// Source of IP geolocation data
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn locate(&self, ip: IpAddr) -> Option<GeoLocation>;
}

/// GeoLocator for looking up IP addresses in MMDB databases
#[derive(Clone)]
pub struct GeoLocator {
    reader: Arc<Reader<Vec<u8>>>,
}

impl GeoLocator {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = Reader::open_readfile(path)?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    pub fn lookup_ip(&self, ip: IpAddr) -> Result<GeoLocation> {
        let lookup_result = self.reader.lookup(ip)?;
        let city: Option<geoip2::City> = lookup_result.decode()?;

        let Some(city) = city else {
            return Ok(GeoLocation::default());
        };

        Ok(GeoLocation {
            country_code: city.country.iso_code.map(String::from),
            country_name: city.country.names.english.map(String::from),
            city_name: city.city.names.english.map(String::from),
        })
    }
}

#[async_trait]
impl GeoLookup for GeoLocator {
    async fn locate(&self, ip: IpAddr) -> Option<GeoLocation> {
        match self.lookup_ip(ip) {
            Ok(location) if !location.is_empty() => Some(location),
            Ok(_) => None,
            Err(e) => {
                debug!("mmdb lookup failed for {}: {}", ip, e);
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpApiResponse {
    status: String,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    city: Option<String>,
}

/// Lookup against the public ip-api.com JSON endpoint
pub struct IpApiLookup {
    client: Client,
    base_url: String,
}

impl IpApiLookup {
    pub fn new() -> Result<Self> {
        Self::with_base_url(IP_API_BASE)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let client = Client::builder().timeout(IP_API_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GeoLookup for IpApiLookup {
    async fn locate(&self, ip: IpAddr) -> Option<GeoLocation> {
        let url = format!(
            "{}/{}?fields=status,country,countryCode,city,query",
            self.base_url, ip
        );
        let response = match self.client.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!("ip-api returned {} for {}", r.status(), ip);
                return None;
            }
            Err(e) => {
                debug!("ip-api request failed for {}: {}", ip, e);
                return None;
            }
        };
        let body: IpApiResponse = response.json().await.ok()?;
        if body.status != "success" {
            return None;
        }
        Some(GeoLocation {
            country_code: body.country_code,
            country_name: body.country,
            city_name: body.city.filter(|c| !c.is_empty()),
        })
    }
}

/// IP -> location cache persisted as JSON. Entries are only ever added.
pub struct GeoCache {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, GeoLocation>>,
}

impl GeoCache {
    /// Load the cache file; a missing or unreadable file yields an empty cache
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("ignoring corrupt geo cache {:?}: {}", path, e);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    pub fn get(&self, ip: &IpAddr) -> Option<GeoLocation> {
        self.entries.read().get(&ip.to_string()).cloned()
    }

    /// Insert a location unless the IP is already cached
    pub fn insert(&self, ip: IpAddr, location: GeoLocation) {
        self.entries.write().entry(ip.to_string()).or_insert(location);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(&*self.entries.read())?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

/// A lookup source fronted by the shared cache
pub struct CachedGeoLookup {
    cache: Arc<GeoCache>,
    inner: Box<dyn GeoLookup>,
}

impl CachedGeoLookup {
    pub fn new(cache: Arc<GeoCache>, inner: Box<dyn GeoLookup>) -> Self {
        Self { cache, inner }
    }

    pub fn cache(&self) -> &GeoCache {
        &self.cache
    }
}

#[async_trait]
impl GeoLookup for CachedGeoLookup {
    async fn locate(&self, ip: IpAddr) -> Option<GeoLocation> {
        if let Some(hit) = self.cache.get(&ip) {
            return Some(hit);
        }
        let location = self.inner.locate(ip).await?;
        self.cache.insert(ip, location.clone());
        Some(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct CountingLookup {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GeoLookup for CountingLookup {
        async fn locate(&self, _ip: IpAddr) -> Option<GeoLocation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(GeoLocation::with_country(Some("jp".to_string()), None))
        }
    }

    #[test]
    fn test_geo_location_default() {
        let loc = GeoLocation::default();
        assert!(loc.is_empty());
        assert_eq!(loc.country(), None);
        assert_eq!(format!("{}", loc), "Unknown Location");
    }

    #[test]
    fn test_country_is_uppercased() {
        let loc = GeoLocation::with_country(Some("us".to_string()), Some("United States".to_string()));
        assert_eq!(loc.country().as_deref(), Some("US"));
    }

    #[test]
    fn test_cache_insert_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let cache = GeoCache::load(dir.path().join("cache.json"));
        let ip: IpAddr = "1.1.1.1".parse().unwrap();
        cache.insert(ip, GeoLocation::with_country(Some("AU".to_string()), None));
        cache.insert(ip, GeoLocation::with_country(Some("US".to_string()), None));
        assert_eq!(cache.get(&ip).unwrap().country_code.as_deref(), Some("AU"));
    }

    #[test]
    fn test_cache_flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("nested").join("cache.json");
        let cache = GeoCache::load(&file);
        assert!(cache.is_empty());
        cache.insert(
            "8.8.8.8".parse().unwrap(),
            GeoLocation::with_country(Some("US".to_string()), None),
        );
        cache.flush().unwrap();

        let reloaded = GeoCache::load(&file);
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn test_corrupt_cache_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cache.json");
        std::fs::write(&file, "{not json").unwrap();
        assert!(GeoCache::load(&file).is_empty());
    }

    #[tokio::test]
    async fn test_cached_lookup_hits_inner_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(GeoCache::load(dir.path().join("cache.json")));
        let inner = Box::new(CountingLookup {
            calls: AtomicUsize::new(0),
        });
        let lookup = CachedGeoLookup::new(Arc::clone(&cache), inner);
        let ip: IpAddr = "9.9.9.9".parse().unwrap();

        assert!(lookup.locate(ip).await.is_some());
        assert!(lookup.locate(ip).await.is_some());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_ip_api_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/1.2.3.4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "country": "Japan",
                "countryCode": "JP",
                "city": "Tokyo",
                "query": "1.2.3.4"
            })))
            .mount(&server)
            .await;

        let lookup = IpApiLookup::with_base_url(&server.uri()).unwrap();
        let loc = lookup.locate("1.2.3.4".parse().unwrap()).await.unwrap();
        assert_eq!(loc.country().as_deref(), Some("JP"));
        assert_eq!(loc.city_name.as_deref(), Some("Tokyo"));
    }

    #[tokio::test]
    async fn test_ip_api_failure_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "fail"
            })))
            .mount(&server)
            .await;

        let lookup = IpApiLookup::with_base_url(&server.uri()).unwrap();
        assert!(lookup.locate("10.0.0.1".parse().unwrap()).await.is_none());
    }
}
