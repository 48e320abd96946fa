//! Unlock-capability probe
//!
//! Hits a fixed list of target services through the active proxy. The score
//! is the weighted share of services answering with an expected status,
//! scaled to 0-100.

use futures::future::join_all;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// One target service
#[derive(Debug, Clone)]
pub struct UnlockService {
    pub name: String,
    pub url: String,
    pub method: Method,
    pub timeout: Duration,
    pub weight: u32,
    pub expected_status: Vec<u16>,
}

impl UnlockService {
    pub fn new(name: &str, url: &str, method: Method, timeout: Duration, weight: u32, expected: &[u16]) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            method,
            timeout,
            weight,
            expected_status: expected.to_vec(),
        }
    }
}

/// Google, YouTube and OpenAI reachability checks
pub fn default_services() -> Vec<UnlockService> {
    vec![
        UnlockService::new(
            "Google",
            "https://www.google.com/generate_204",
            Method::GET,
            Duration::from_secs(3),
            50,
            &[204],
        ),
        UnlockService::new(
            "YouTube",
            "https://www.youtube.com/generate_204",
            Method::GET,
            Duration::from_secs(3),
            30,
            &[204],
        ),
        UnlockService::new(
            "OpenAI",
            "https://api.openai.com/v1/models",
            Method::HEAD,
            Duration::from_secs(4),
            20,
            &[200, 401, 403],
        ),
    ]
}

/// Outcome of one service check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCheck {
    pub service: String,
    pub success: bool,
    /// HTTP status, 0 when no response arrived
    pub status: u16,
    pub latency_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlockResult {
    pub score: u8,
    pub checks: Vec<ServiceCheck>,
}

impl UnlockResult {
    /// Compact form such as `80[+-+]`
    pub fn detail(&self) -> String {
        let marks: String = self
            .checks
            .iter()
            .map(|c| if c.success { '+' } else { '-' })
            .collect();
        format!("{}[{}]", self.score, marks)
    }
}

#[derive(Debug, Clone)]
pub struct UnlockTester {
    services: Vec<UnlockService>,
}

impl Default for UnlockTester {
    fn default() -> Self {
        Self::new(default_services())
    }
}

impl UnlockTester {
    pub fn new(services: Vec<UnlockService>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &[UnlockService] {
        &self.services
    }

    /// Check all services concurrently with `client`, which should route
    /// through the proxy under test and not follow redirects
    pub async fn test_all(&self, client: &Client) -> UnlockResult {
        let checks = join_all(self.services.iter().map(|s| check_service(client, s))).await;

        let max: u32 = self.services.iter().map(|s| s.weight).sum();
        let earned: u32 = self
            .services
            .iter()
            .zip(&checks)
            .filter(|(_, c)| c.success)
            .map(|(s, _)| s.weight)
            .sum();
        let score = if max == 0 { 0 } else { (earned * 100 / max).min(100) as u8 };

        UnlockResult { score, checks }
    }
}

async fn check_service(client: &Client, service: &UnlockService) -> ServiceCheck {
    let start = Instant::now();
    let response = client
        .request(service.method.clone(), &service.url)
        .timeout(service.timeout)
        .send()
        .await;
    let latency_ms = u32::try_from(start.elapsed().as_millis()).unwrap_or(u32::MAX);

    match response {
        Ok(response) => {
            let status = response.status().as_u16();
            ServiceCheck {
                service: service.name.clone(),
                success: service.expected_status.contains(&status),
                status,
                latency_ms,
            }
        }
        Err(e) => {
            debug!("{} check failed: {}", service.name, e);
            ServiceCheck {
                service: service.name.clone(),
                success: false,
                status: 0,
                latency_ms: crate::proxy::models::UNKNOWN_LATENCY_MS,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::redirect::Policy;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> Client {
        Client::builder().redirect(Policy::none()).build().unwrap()
    }

    async fn services(server: &MockServer) -> Vec<UnlockService> {
        let base = server.uri();
        vec![
            UnlockService::new("A", &format!("{}/a", base), Method::GET, Duration::from_secs(1), 50, &[204]),
            UnlockService::new("B", &format!("{}/b", base), Method::GET, Duration::from_secs(1), 30, &[204]),
            UnlockService::new("C", &format!("{}/c", base), Method::HEAD, Duration::from_secs(1), 20, &[200, 401, 403]),
        ]
    }

    #[tokio::test]
    async fn test_weighted_score() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/blocked"))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/c"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let tester = UnlockTester::new(services(&server).await);
        let result = tester.test_all(&client()).await;
        assert_eq!(result.score, 70);
        assert_eq!(result.detail(), "70[+-+]");
        assert_eq!(result.checks[1].status, 302);
    }

    #[tokio::test]
    async fn test_timeouts_score_zero() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let base = server.uri();
        let tester = UnlockTester::new(vec![UnlockService::new(
            "slow",
            &format!("{}/a", base),
            Method::GET,
            Duration::from_millis(200),
            10,
            &[204],
        )]);
        let result = tester.test_all(&client()).await;
        assert_eq!(result.score, 0);
        assert_eq!(result.checks[0].status, 0);
        assert_eq!(result.detail(), "0[-]");
    }

    #[test]
    fn test_default_services() {
        let services = default_services();
        assert_eq!(services.iter().map(|s| s.weight).sum::<u32>(), 100);
        assert_eq!(services[2].method, Method::HEAD);
    }
}
