//! Client for the proxy-core control API
//!
//! Only the narrow surface the pipeline needs: version, proxy listing,
//! per-proxy delay measurement and selector switching.

use crate::error::ApiError;
use crate::Result;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Entry types the core creates itself; never real proxies
const SYNTHETIC_TYPES: &[&str] = &[
    "selector",
    "urltest",
    "fallback",
    "loadbalance",
    "relay",
    "direct",
    "reject",
    "rejectdrop",
    "compatible",
    "pass",
];

/// Result of one delay measurement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelayOutcome {
    /// Measured within the latency ceiling
    Measured(u32),
    /// Measured, but slower than the ceiling
    OverThreshold(u32),
    /// The core answered but had no delay for the proxy
    NoDelay,
    /// The core rejected the request
    ApiError { status: u16, message: String },
    /// No answer within the client timeout
    Timeout,
    /// Connection-level failure reaching the control API
    Transport(String),
}

impl DelayOutcome {
    pub fn delay_ms(&self) -> Option<u32> {
        match self {
            DelayOutcome::Measured(ms) => Some(*ms),
            _ => None,
        }
    }

    /// Short label for the failure histogram
    pub fn reason(&self) -> &'static str {
        match self {
            DelayOutcome::Measured(_) => "measured",
            DelayOutcome::OverThreshold(_) => "over_threshold",
            DelayOutcome::NoDelay => "no_delay",
            DelayOutcome::ApiError { .. } => "api_error",
            DelayOutcome::Timeout => "timeout",
            DelayOutcome::Transport(_) => "transport",
        }
    }
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProxiesResponse {
    #[serde(default)]
    proxies: BTreeMap<String, ProxyInfo>,
}

#[derive(Debug, Deserialize)]
struct ProxyInfo {
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct DelayResponse {
    #[serde(default)]
    delay: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(default)]
    message: Option<String>,
}

/// HTTP client bound to one core's control API
#[derive(Debug, Clone)]
pub struct ControlApi {
    client: Client,
    base_url: String,
    secret: Option<String>,
}

impl ControlApi {
    pub fn new(host: &str, port: u16, secret: Option<String>, timeout: Duration) -> Result<Self> {
        Self::with_base_url(&format!("http://{}:{}", host, port), secret, timeout)
    }

    pub fn with_base_url(base_url: &str, secret: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).no_proxy().build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.secret {
            Some(secret) => request.bearer_auth(secret),
            None => request,
        }
    }

    /// Version string reported by the core; doubles as a readiness probe
    pub async fn version(&self) -> std::result::Result<String, ApiError> {
        let request = self.client.get(format!("{}/version", self.base_url));
        let response = self.authorize(request).send().await.map_err(classify)?;
        let response = expect_status(response, StatusCode::OK).await?;
        let body: VersionResponse = response.json().await.map_err(decode)?;
        Ok(body.version.unwrap_or_else(|| "unknown".to_string()))
    }

    /// Names of genuine proxy entries, group and sentinel entries removed
    pub async fn list_proxies(&self) -> std::result::Result<Vec<String>, ApiError> {
        let request = self.client.get(format!("{}/proxies", self.base_url));
        let response = self.authorize(request).send().await.map_err(classify)?;
        let response = expect_status(response, StatusCode::OK).await?;
        let body: ProxiesResponse = response.json().await.map_err(decode)?;

        Ok(body
            .proxies
            .into_iter()
            .filter(|(_, info)| !is_synthetic(&info.kind))
            .map(|(name, _)| name)
            .collect())
    }

    /// Ask the core to measure one proxy against `test_url`
    pub async fn measure_delay(
        &self,
        name: &str,
        test_url: &str,
        timeout_ms: u32,
        ceiling_ms: u32,
    ) -> DelayOutcome {
        let url = format!(
            "{}/proxies/{}/delay",
            self.base_url,
            urlencoding::encode(name)
        );
        let timeout = timeout_ms.to_string();
        let request = self
            .client
            .get(url)
            .query(&[("url", test_url), ("timeout", timeout.as_str())]);

        let response = match self.authorize(request).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return DelayOutcome::Timeout,
            Err(e) => return DelayOutcome::Transport(e.to_string()),
        };

        let status = response.status();
        if status != StatusCode::OK {
            return DelayOutcome::ApiError {
                status: status.as_u16(),
                message: error_message(response).await,
            };
        }

        match response.json::<DelayResponse>().await {
            Ok(DelayResponse { delay: Some(ms) }) if ms > 0 => {
                if ms < ceiling_ms {
                    DelayOutcome::Measured(ms)
                } else {
                    DelayOutcome::OverThreshold(ms)
                }
            }
            Ok(_) => DelayOutcome::NoDelay,
            Err(e) if e.is_timeout() => DelayOutcome::Timeout,
            Err(e) => DelayOutcome::Transport(e.to_string()),
        }
    }

    /// Route `group` through `proxy`; the core answers 204 on success
    pub async fn switch(&self, group: &str, proxy: &str) -> std::result::Result<(), ApiError> {
        let url = format!("{}/proxies/{}", self.base_url, urlencoding::encode(group));
        let request = self
            .client
            .put(url)
            .json(&serde_json::json!({ "name": proxy }));
        let response = self.authorize(request).send().await.map_err(classify)?;
        expect_status(response, StatusCode::NO_CONTENT).await?;
        Ok(())
    }
}

fn is_synthetic(kind: &str) -> bool {
    let kind = kind.to_ascii_lowercase();
    SYNTHETIC_TYPES.contains(&kind.as_str())
}

fn classify(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Transport(e)
    }
}

fn decode(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Decode(e.to_string())
    }
}

async fn expect_status(
    response: reqwest::Response,
    expected: StatusCode,
) -> std::result::Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status == expected {
        Ok(response)
    } else {
        Err(ApiError::status(status.as_u16(), error_message(response).await))
    }
}

async fn error_message(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str::<MessageResponse>(&text)
        .ok()
        .and_then(|m| m.message)
        .unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn api(server: &MockServer, secret: Option<&str>) -> ControlApi {
        ControlApi::with_base_url(
            &server.uri(),
            secret.map(String::from),
            Duration::from_millis(500),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_version_with_secret() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/version"))
            .and(header("Authorization", "Bearer s3cret"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"version": "v1.18.0"})),
            )
            .mount(&server)
            .await;

        assert_eq!(api(&server, Some("s3cret")).await.version().await.unwrap(), "v1.18.0");
        assert!(api(&server, None).await.version().await.is_err());
    }

    #[tokio::test]
    async fn test_list_proxies_filters_synthetic_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/proxies"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "proxies": {
                    "TEST": {"type": "Selector"},
                    "GLOBAL": {"type": "Selector"},
                    "DIRECT": {"type": "Direct"},
                    "REJECT": {"type": "Reject"},
                    "REJECT-DROP": {"type": "RejectDrop"},
                    "COMPATIBLE": {"type": "Compatible"},
                    "PASS": {"type": "Pass"},
                    "auto": {"type": "URLTest"},
                    "jp_1": {"type": "Vmess"},
                    "hk_2": {"type": "Trojan"}
                }
            })))
            .mount(&server)
            .await;

        let names = api(&server, None).await.list_proxies().await.unwrap();
        assert_eq!(names, vec!["hk_2", "jp_1"]);
    }

    #[tokio::test]
    async fn test_measure_delay_outcomes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/proxies/fast/delay"))
            .and(query_param("timeout", "5000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"delay": 120})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/proxies/slow/delay"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"delay": 3100})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/proxies/edge/delay"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"delay": 2000})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/proxies/empty/delay"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"delay": null})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/proxies/dead/delay"))
            .respond_with(
                ResponseTemplate::new(504).set_body_json(serde_json::json!({"message": "Timeout"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/proxies/stuck/delay"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"delay": 1}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let api = api(&server, None).await;
        let url = "http://www.gstatic.com/generate_204";
        assert_eq!(api.measure_delay("fast", url, 5000, 2000).await, DelayOutcome::Measured(120));
        assert_eq!(
            api.measure_delay("slow", url, 5000, 2000).await,
            DelayOutcome::OverThreshold(3100)
        );
        // The ceiling itself is already too slow
        assert_eq!(
            api.measure_delay("edge", url, 5000, 2000).await,
            DelayOutcome::OverThreshold(2000)
        );
        assert_eq!(api.measure_delay("empty", url, 5000, 1999).await, DelayOutcome::NoDelay);
        assert_eq!(
            api.measure_delay("dead", url, 5000, 2000).await,
            DelayOutcome::ApiError {
                status: 504,
                message: "Timeout".to_string()
            }
        );
        assert_eq!(api.measure_delay("stuck", url, 5000, 2000).await, DelayOutcome::Timeout);
    }

    #[tokio::test]
    async fn test_delay_name_is_url_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/proxies/a%20b/delay"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"delay": 80})))
            .mount(&server)
            .await;

        let outcome = api(&server, None)
            .await
            .measure_delay("a b", "http://x.test", 1000, 2000)
            .await;
        assert_eq!(outcome.delay_ms(), Some(80));
    }

    #[tokio::test]
    async fn test_switch() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/proxies/TEST"))
            .and(body_json(serde_json::json!({"name": "jp_1"})))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/proxies/TEST"))
            .and(body_json(serde_json::json!({"name": "missing"})))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(serde_json::json!({"message": "Selector update error: proxy not exist"})),
            )
            .mount(&server)
            .await;

        let api = api(&server, None).await;
        assert!(api.switch("TEST", "jp_1").await.is_ok());
        match api.switch("TEST", "missing").await {
            Err(ApiError::Status { status, message }) => {
                assert_eq!(status, 400);
                assert!(message.contains("proxy not exist"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
