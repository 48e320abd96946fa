//! Throughput probe
//!
//! Downloads from the first configured URL that answers 200 and reports the
//! observed rate. Reading stops at the byte budget or the time budget,
//! whichever comes first.

use crate::config::SpeedConfig;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Floor applied to the measured duration
const MIN_DURATION: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedResult {
    pub bytes_per_sec: f64,
    pub bytes: u64,
    pub url: String,
}

impl SpeedResult {
    pub fn human(&self) -> String {
        format_speed(self.bytes_per_sec)
    }
}

/// `512.0 B/s`, `12.5 KB/s`, `3.2 MB/s`
pub fn format_speed(bytes_per_sec: f64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;

    if bytes_per_sec < KIB {
        format!("{:.1} B/s", bytes_per_sec)
    } else if bytes_per_sec < MIB {
        format!("{:.1} KB/s", bytes_per_sec / KIB)
    } else {
        format!("{:.1} MB/s", bytes_per_sec / MIB)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpeedTester {
    config: SpeedConfig,
}

impl SpeedTester {
    pub fn new(config: SpeedConfig) -> Self {
        Self { config }
    }

    /// Measure throughput through `client`; `None` when no URL yielded data
    pub async fn measure(&self, client: &Client) -> Option<SpeedResult> {
        for url in &self.config.urls {
            match self.download(client, url).await {
                Ok(Some(result)) => {
                    debug!("speed via {}: {}", url, result.human());
                    return Some(result);
                }
                Ok(None) => debug!("speed URL {} returned no data", url),
                Err(e) => debug!("speed URL {} failed: {}", url, e),
            }
        }
        None
    }

    async fn download(&self, client: &Client, url: &str) -> reqwest::Result<Option<SpeedResult>> {
        let start = Instant::now();
        let mut response = client.get(url).timeout(self.config.timeout).send().await?;
        if response.status() != StatusCode::OK {
            debug!("speed URL {} answered {}", url, response.status());
            return Ok(None);
        }

        let mut bytes: u64 = 0;
        loop {
            if start.elapsed() >= self.config.max_duration || bytes >= self.config.byte_budget {
                break;
            }
            let remaining = self.config.max_duration.saturating_sub(start.elapsed());
            match tokio::time::timeout(remaining, response.chunk()).await {
                Ok(Ok(Some(chunk))) => bytes += chunk.len() as u64,
                Ok(Ok(None)) | Err(_) => break,
                // A broken stream still counts what arrived
                Ok(Err(e)) => {
                    debug!("speed stream from {} broke: {}", url, e);
                    break;
                }
            }
        }

        if bytes == 0 {
            return Ok(None);
        }
        let elapsed = start.elapsed().max(MIN_DURATION);
        Ok(Some(SpeedResult {
            bytes_per_sec: bytes as f64 / elapsed.as_secs_f64(),
            bytes,
            url: url.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(urls: Vec<String>) -> SpeedConfig {
        SpeedConfig {
            urls,
            timeout: Duration::from_secs(2),
            max_duration: Duration::from_secs(1),
            byte_budget: 256 * 1024,
        }
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(512.0), "512.0 B/s");
        assert_eq!(format_speed(2048.0), "2.0 KB/s");
        assert_eq!(format_speed(3.5 * 1024.0 * 1024.0), "3.5 MB/s");
    }

    #[tokio::test]
    async fn test_falls_back_to_next_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/empty"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/blob"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 100 * 1024]))
            .mount(&server)
            .await;

        let urls = ["/broken", "/empty", "/blob"]
            .iter()
            .map(|p| format!("{}{}", server.uri(), p))
            .collect();
        let tester = SpeedTester::new(config(urls));
        let result = tester.measure(&Client::new()).await.unwrap();

        assert!(result.url.ends_with("/blob"));
        assert_eq!(result.bytes, 100 * 1024);
        assert!(result.bytes_per_sec > 0.0);
        // 100 KiB over at least the 0.1s floor
        assert!(result.bytes_per_sec <= 1024.0 * 1024.0);
    }

    #[tokio::test]
    async fn test_hanging_url_falls_back_within_heavy_timeout() {
        use crate::config::{HeavyMode, PipelineConfig};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hang"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![1u8; 1024])
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 32 * 1024]))
            .mount(&server)
            .await;

        let mut config = PipelineConfig::new().with_heavy_mode(HeavyMode::Speed);
        config.speed = SpeedConfig {
            urls: vec![format!("{}/hang", server.uri()), format!("{}/ok", server.uri())],
            timeout: Duration::from_secs(1),
            max_duration: Duration::from_millis(500),
            byte_budget: 256 * 1024,
        };

        let tester = SpeedTester::new(config.speed.clone());
        let client = Client::new();
        let result = tokio::time::timeout(config.heavy_probe_timeout(), tester.measure(&client))
            .await
            .expect("speed test outlived the heavy probe timeout")
            .unwrap();
        assert!(result.url.ends_with("/ok"));
        assert_eq!(result.bytes, 32 * 1024);
    }

    #[tokio::test]
    async fn test_no_usable_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let tester = SpeedTester::new(config(vec![format!("{}/x", server.uri())]));
        assert!(tester.measure(&Client::new()).await.is_none());
    }
}
