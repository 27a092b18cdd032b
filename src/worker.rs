use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use tracing::debug;

use crate::config::{WorkerEndpointEntry, WorkerSection};

/// Upper bound on error-body snippets carried in `UpstreamError`.
const MAX_SNIPPET_BYTES: usize = 512;

/// Markers identifying an anti-automation interstitial rather than a
/// genuine application error.
const CHALLENGE_MARKERS: &[&str] = &[
    "Checking your browser",
    "Just a moment",
    "cf-browser-verification",
    "_cf_chl_opt",
    "challenge-platform",
    "captcha-delivery",
    "Attention Required! | Cloudflare",
    "DDoS protection by",
];

/// Fixed request headers shaped to resemble an ordinary browser navigation.
/// The worker's own outbound fetch is subject to anti-automation defenses
/// at the target site, so the invocation itself must not look automated.
const BROWSER_HEADERS: &[(&str, &str)] = &[
    (
        "User-Agent",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    ),
    (
        "Accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
    ),
    ("Accept-Language", "en-US,en;q=0.9"),
    ("Sec-Fetch-Dest", "document"),
    ("Sec-Fetch-Mode", "navigate"),
    ("Sec-Fetch-Site", "none"),
    ("Sec-Fetch-User", "?1"),
    ("Upgrade-Insecure-Requests", "1"),
];

/// A ranked remote worker endpoint. Selected per invocation attempt, never
/// pinned for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEndpoint {
    pub base_url: String,
    pub region: String,
}

impl WorkerEndpoint {
    pub fn from_entry(entry: &WorkerEndpointEntry) -> Self {
        Self {
            base_url: entry.url.trim_end_matches('/').to_string(),
            region: entry.region.clone(),
        }
    }
}

/// Classified outcome of a single worker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    Success {
        status: u16,
        headers: HashMap<String, String>,
        body: String,
    },
    /// Challenge signature detected. Distinct from a generic error because
    /// it triggers endpoint fallback rather than a simple retry.
    Blocked {
        signature: String,
    },
    UpstreamError {
        status: u16,
        snippet: String,
    },
    TransportError {
        cause: String,
    },
}

impl FetchResult {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchResult::Success { .. } => "success",
            FetchResult::Blocked { .. } => "blocked",
            FetchResult::UpstreamError { .. } => "upstream-error",
            FetchResult::TransportError { .. } => "transport-error",
        }
    }

    /// The 401/403 flavor that warrants one forced credential refresh.
    pub fn is_authorization_failure(&self) -> bool {
        matches!(
            self,
            FetchResult::UpstreamError {
                status: 401 | 403,
                ..
            }
        )
    }
}

/// Classify a worker response. Pure; transport failures never reach here.
pub fn classify_response(
    status: u16,
    headers: HashMap<String, String>,
    body: String,
) -> FetchResult {
    if let Some(signature) = find_challenge_signature(&body) {
        return FetchResult::Blocked {
            signature: signature.to_string(),
        };
    }
    if (200..300).contains(&status) {
        FetchResult::Success {
            status,
            headers,
            body,
        }
    } else {
        FetchResult::UpstreamError {
            status,
            snippet: bounded_snippet(&body),
        }
    }
}

fn find_challenge_signature(body: &str) -> Option<&'static str> {
    CHALLENGE_MARKERS
        .iter()
        .copied()
        .find(|marker| body.contains(marker))
}

fn bounded_snippet(body: &str) -> String {
    if body.len() <= MAX_SNIPPET_BYTES {
        return body.to_string();
    }
    let mut end = MAX_SNIPPET_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Seam over the single-attempt fetch so the engine's fallback policy is
/// testable with scripted outcomes.
#[async_trait]
pub trait WorkerFetch: Send + Sync {
    async fn invoke(
        &self,
        target_url: &str,
        endpoint: &WorkerEndpoint,
        credential: &str,
    ) -> FetchResult;
}

/// Stateless single-attempt invocation client. Retry and fallback policy
/// belong to the engine, not here.
pub struct WorkerClient {
    client: reqwest::Client,
}

impl WorkerClient {
    pub fn from_settings(worker: &WorkerSection) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(worker.invoke_timeout_ms))
            .connect_timeout(Duration::from_millis(worker.connect_timeout_ms))
            .build()
            .map_err(|err| anyhow::anyhow!("Failed to build worker HTTP client: {err}"))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WorkerFetch for WorkerClient {
    async fn invoke(
        &self,
        target_url: &str,
        endpoint: &WorkerEndpoint,
        credential: &str,
    ) -> FetchResult {
        let mut request = self
            .client
            .get(format!("{}/", endpoint.base_url))
            .query(&[("TARGET", target_url)])
            .bearer_auth(credential);
        for (name, value) in BROWSER_HEADERS {
            request = request.header(*name, *value);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                return FetchResult::TransportError {
                    cause: err.to_string(),
                };
            }
        };

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                return FetchResult::TransportError {
                    cause: format!("failed to read worker response body: {err}"),
                };
            }
        };

        let result = classify_response(status, headers, body);
        debug!(
            endpoint = %endpoint.base_url,
            region = %endpoint.region,
            outcome = result.kind(),
            "Worker invocation classified"
        );
        result
    }
}
