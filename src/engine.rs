use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

use crate::classify::normalise_name;
use crate::config::{ApiSection, WorkerSection};
use crate::session::SessionCache;
use crate::worker::{FetchResult, WorkerEndpoint, WorkerFetch};

/// TTL applied to synthesized address records.
pub const SYNTHESIZED_TTL: u32 = 60;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(8);

/// Outcome of one proxied resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutcome {
    Resolved(ProxiedAnswer),
    /// Credentials missing or rejected. Fatal to this query only.
    AuthFailed,
    /// Every ranked endpoint was tried without a success.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxiedAnswer {
    pub address: Ipv4Addr,
    pub region: String,
    pub status: u16,
}

/// Supplies the ranked worker endpoint list for each resolution.
#[async_trait]
pub trait EndpointProvider: Send + Sync {
    async fn endpoints(&self) -> Result<Vec<WorkerEndpoint>>;
}

/// Fixed endpoint list taken from configuration, already in rank order.
pub struct StaticEndpointProvider {
    endpoints: Vec<WorkerEndpoint>,
}

impl StaticEndpointProvider {
    pub fn from_settings(worker: &WorkerSection) -> Self {
        Self {
            endpoints: worker
                .endpoints
                .iter()
                .map(WorkerEndpoint::from_entry)
                .collect(),
        }
    }
}

#[async_trait]
impl EndpointProvider for StaticEndpointProvider {
    async fn endpoints(&self) -> Result<Vec<WorkerEndpoint>> {
        Ok(self.endpoints.clone())
    }
}

/// Deployment entry returned by the management API. Unknown fields ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeploymentsResponse {
    #[serde(default)]
    deployments: Vec<DeploymentRecord>,
}

/// Polls the management API for live deployments instead of shelling out to
/// an external CLI tool.
pub struct ApiEndpointProvider {
    client: reqwest::Client,
    deployments_url: String,
    session: Arc<SessionCache>,
    regions: Vec<String>,
    count: usize,
    attributes: HashMap<String, String>,
}

impl ApiEndpointProvider {
    pub fn from_settings(
        api: &ApiSection,
        worker: &WorkerSection,
        session: Arc<SessionCache>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("PhantomDNS/0.1")
            .timeout(DISCOVERY_TIMEOUT)
            .build()
            .context("Failed to build discovery HTTP client")?;
        let deployments_url = format!(
            "{}/{}/deployments",
            api.base_url.trim_end_matches('/'),
            api.version.trim_matches('/')
        );
        Ok(Self {
            client,
            deployments_url,
            session,
            regions: worker.regions.clone(),
            count: worker.count,
            attributes: worker.attributes.clone(),
        })
    }
}

#[async_trait]
impl EndpointProvider for ApiEndpointProvider {
    async fn endpoints(&self) -> Result<Vec<WorkerEndpoint>> {
        let credential = self
            .session
            .ensure_authenticated()
            .await
            .map_err(|err| anyhow!("endpoint discovery needs authentication: {err}"))?;

        let mut request = self
            .client
            .get(&self.deployments_url)
            .bearer_auth(credential)
            .query(&[("limit", self.count.to_string())]);
        for (key, value) in &self.attributes {
            request = request.query(&[(format!("attr.{key}"), value.clone())]);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to query deployments at {}", self.deployments_url))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("deployment discovery failed (status {status})");
        }
        let payload: DeploymentsResponse = response
            .json()
            .await
            .context("Deployment discovery response was not JSON")?;

        let endpoints = rank_endpoints(map_deployments(payload.deployments), &self.regions);
        if endpoints.is_empty() {
            anyhow::bail!("deployment discovery returned no usable endpoints");
        }
        Ok(endpoints)
    }
}

fn map_deployments(deployments: Vec<DeploymentRecord>) -> Vec<WorkerEndpoint> {
    deployments
        .into_iter()
        .filter_map(|record| {
            let url = record.url?;
            if url.trim().is_empty() {
                return None;
            }
            Some(WorkerEndpoint {
                base_url: url.trim_end_matches('/').to_string(),
                region: record.region.unwrap_or_else(|| "unknown".into()),
            })
        })
        .collect()
}

/// Stable sort by the configured region ranking; unranked regions go last.
fn rank_endpoints(mut endpoints: Vec<WorkerEndpoint>, regions: &[String]) -> Vec<WorkerEndpoint> {
    let rank = |endpoint: &WorkerEndpoint| {
        regions
            .iter()
            .position(|region| region == &endpoint.region)
            .unwrap_or(regions.len())
    };
    endpoints.sort_by_key(rank);
    endpoints
}

/// Binding from a proxied domain to its synthesized loopback address, read
/// by the cooperating local transport layer.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub address: Ipv4Addr,
    pub fetched_at: Instant,
}

/// How long a binding stays readable. Re-fetches rewrite the entry, so an
/// actively queried domain never goes stale; abandoned ones age out instead
/// of accumulating for the process lifetime.
pub const ROUTE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
pub struct ProxyRouteTable {
    entries: Mutex<HashMap<String, RouteEntry>>,
}

impl ProxyRouteTable {
    pub fn bind(&self, domain: &str, address: Ipv4Addr) {
        self.bind_at(domain, address, Instant::now());
    }

    fn bind_at(&self, domain: &str, address: Ipv4Addr, now: Instant) {
        let mut entries = self.entries.lock().expect("route table mutex poisoned");
        entries.retain(|_, entry| now.duration_since(entry.fetched_at) < ROUTE_TTL);
        entries.insert(
            normalise_name(domain),
            RouteEntry {
                address,
                fetched_at: now,
            },
        );
    }

    pub fn lookup(&self, domain: &str) -> Option<RouteEntry> {
        self.lookup_at(domain, Instant::now())
    }

    fn lookup_at(&self, domain: &str, now: Instant) -> Option<RouteEntry> {
        let mut entries = self.entries.lock().expect("route table mutex poisoned");
        let key = normalise_name(domain);
        match entries.get(&key) {
            Some(entry) if now.duration_since(entry.fetched_at) < ROUTE_TTL => {
                Some(entry.clone())
            }
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("route table mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Map a proxied domain into the loopback pool `127.86.0.0/16`.
///
/// Deterministic so repeated queries for one domain stay stable for the
/// transport layer; both host octets avoid 0 and 255.
pub fn synthesize_address(domain: &str) -> Ipv4Addr {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in normalise_name(domain).bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let third = clamp_host_octet((hash >> 8) as u8);
    let fourth = clamp_host_octet(hash as u8);
    Ipv4Addr::new(127, 86, third, fourth)
}

fn clamp_host_octet(octet: u8) -> u8 {
    match octet {
        0 => 1,
        255 => 254,
        octet => octet,
    }
}

/// Drives a proxied query: authenticate, pick ranked endpoints, invoke with
/// fallback, synthesize the answer address.
pub struct ProxyEngine {
    session: Arc<SessionCache>,
    worker: Arc<dyn WorkerFetch>,
    provider: Arc<dyn EndpointProvider>,
    routes: ProxyRouteTable,
}

impl ProxyEngine {
    pub fn new(
        session: Arc<SessionCache>,
        worker: Arc<dyn WorkerFetch>,
        provider: Arc<dyn EndpointProvider>,
    ) -> Self {
        Self {
            session,
            worker,
            provider,
            routes: ProxyRouteTable::default(),
        }
    }

    pub fn routes(&self) -> &ProxyRouteTable {
        &self.routes
    }

    /// Resolve one proxied domain. Endpoint attempts are strictly
    /// sequential: each attempt may mutate shared session state, and
    /// parallel probing would multiply load on the fetch backend.
    pub async fn resolve_proxied(&self, domain: &str) -> EngineOutcome {
        let mut credential = match self.session.ensure_authenticated().await {
            Ok(credential) => credential,
            Err(err) => {
                warn!(domain = %domain, error = %err, "Authentication failed for proxied query");
                return EngineOutcome::AuthFailed;
            }
        };

        let target = match target_url(domain) {
            Ok(target) => target,
            Err(err) => {
                warn!(domain = %domain, error = %err, "Cannot build target URL for proxied query");
                return EngineOutcome::Exhausted;
            }
        };

        let endpoints = match self.provider.endpoints().await {
            Ok(endpoints) if !endpoints.is_empty() => endpoints,
            Ok(_) => {
                warn!(domain = %domain, "No worker endpoints available");
                return EngineOutcome::Exhausted;
            }
            Err(err) => {
                warn!(domain = %domain, error = %err, "Endpoint discovery failed");
                return EngineOutcome::Exhausted;
            }
        };

        for endpoint in &endpoints {
            // One self-loop per endpoint after a forced credential refresh.
            let mut refreshed = false;
            loop {
                let result = self
                    .worker
                    .invoke(target.as_str(), endpoint, &credential)
                    .await;
                match result {
                    FetchResult::Success { status, .. } => {
                        let address = synthesize_address(domain);
                        self.routes.bind(domain, address);
                        info!(
                            domain = %domain,
                            endpoint = %endpoint.base_url,
                            region = %endpoint.region,
                            address = %address,
                            status,
                            "Proxied resolution succeeded"
                        );
                        return EngineOutcome::Resolved(ProxiedAnswer {
                            address,
                            region: endpoint.region.clone(),
                            status,
                        });
                    }
                    FetchResult::Blocked { signature } => {
                        // A different region carries a different egress
                        // signature, so advance instead of retrying here.
                        warn!(
                            domain = %domain,
                            endpoint = %endpoint.base_url,
                            region = %endpoint.region,
                            signature = %signature,
                            "Challenge signature detected; advancing to next endpoint"
                        );
                        break;
                    }
                    other => {
                        let retryable = matches!(other, FetchResult::TransportError { .. })
                            || other.is_authorization_failure();
                        if retryable && !refreshed {
                            refreshed = true;
                            match self.session.force_refresh().await {
                                Ok(fresh) => {
                                    credential = fresh;
                                    continue;
                                }
                                Err(err) => {
                                    warn!(domain = %domain, error = %err, "Forced credential refresh failed");
                                    return EngineOutcome::AuthFailed;
                                }
                            }
                        }
                        warn!(
                            domain = %domain,
                            endpoint = %endpoint.base_url,
                            region = %endpoint.region,
                            outcome = other.kind(),
                            "Worker invocation failed; advancing to next endpoint"
                        );
                        break;
                    }
                }
            }
        }

        warn!(domain = %domain, attempted = endpoints.len(), "All worker endpoints exhausted");
        EngineOutcome::Exhausted
    }
}

/// Scheme + host reconstruction for the domain under query.
fn target_url(domain: &str) -> Result<Url> {
    let normalised = normalise_name(domain);
    if normalised.is_empty() {
        anyhow::bail!("empty domain");
    }
    Url::parse(&format!("https://{normalised}/"))
        .with_context(|| format!("invalid target domain {normalised}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{AuthError, AuthExchange, AuthResponse};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExchange {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingExchange {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthExchange for CountingExchange {
        async fn issue_token(&self) -> Result<AuthResponse, AuthError> {
            let seq = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(AuthError::Rejected {
                    status: 401,
                    message: "nope".into(),
                });
            }
            Ok(AuthResponse {
                access_token: Some(format!("token-{seq}")),
                token_type: Some("Bearer".into()),
                expires_in: Some(3600),
                refresh_token: None,
            })
        }
    }

    struct ScriptedWorker {
        scripts: Mutex<HashMap<String, VecDeque<FetchResult>>>,
        invocations: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedWorker {
        fn new(entries: Vec<(&str, Vec<FetchResult>)>) -> Self {
            Self {
                scripts: Mutex::new(
                    entries
                        .into_iter()
                        .map(|(url, results)| (url.to_string(), results.into()))
                        .collect(),
                ),
                invocations: Mutex::new(Vec::new()),
            }
        }

        fn invocations(&self) -> Vec<(String, String)> {
            self.invocations.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl WorkerFetch for ScriptedWorker {
        async fn invoke(
            &self,
            target_url: &str,
            endpoint: &WorkerEndpoint,
            credential: &str,
        ) -> FetchResult {
            self.invocations
                .lock()
                .expect("lock")
                .push((endpoint.base_url.clone(), credential.to_string()));
            assert!(target_url.starts_with("https://"));
            self.scripts
                .lock()
                .expect("lock")
                .get_mut(&endpoint.base_url)
                .and_then(|queue| queue.pop_front())
                .unwrap_or(FetchResult::TransportError {
                    cause: "script exhausted".into(),
                })
        }
    }

    fn endpoint(url: &str, region: &str) -> WorkerEndpoint {
        WorkerEndpoint {
            base_url: url.into(),
            region: region.into(),
        }
    }

    fn success() -> FetchResult {
        FetchResult::Success {
            status: 200,
            headers: HashMap::new(),
            body: "SUCCESS: Connected to target".into(),
        }
    }

    fn engine_with(
        worker: Arc<ScriptedWorker>,
        endpoints: Vec<WorkerEndpoint>,
        exchange: Arc<CountingExchange>,
    ) -> ProxyEngine {
        let session = Arc::new(SessionCache::new(exchange));
        let provider = Arc::new(StaticEndpointProvider {
            endpoints: endpoints.clone(),
        });
        ProxyEngine::new(session, worker, provider)
    }

    #[tokio::test]
    async fn fallback_walks_endpoints_in_rank_order() {
        let worker = Arc::new(ScriptedWorker::new(vec![
            (
                "https://e1",
                vec![FetchResult::Blocked {
                    signature: "Just a moment".into(),
                }],
            ),
            (
                "https://e2",
                vec![
                    FetchResult::TransportError {
                        cause: "timeout".into(),
                    },
                    FetchResult::TransportError {
                        cause: "timeout".into(),
                    },
                ],
            ),
            ("https://e3", vec![success()]),
        ]));
        let exchange = Arc::new(CountingExchange::new());
        let engine = engine_with(
            worker.clone(),
            vec![
                endpoint("https://e1", "us-east"),
                endpoint("https://e2", "eu-west"),
                endpoint("https://e3", "ap-east"),
            ],
            exchange,
        );

        let outcome = engine.resolve_proxied("news.blocked.org").await;
        match outcome {
            EngineOutcome::Resolved(answer) => {
                assert_eq!(answer.region, "ap-east");
                assert_eq!(answer.status, 200);
            }
            other => panic!("expected Resolved, got {other:?}"),
        }

        // Blocked advances immediately; the transport failure earns one
        // same-endpoint retry after a forced refresh; rank order holds.
        let contacted: Vec<String> = worker
            .invocations()
            .into_iter()
            .map(|(url, _)| url)
            .collect();
        assert_eq!(
            contacted,
            vec!["https://e1", "https://e2", "https://e2", "https://e3"]
        );
    }

    #[tokio::test]
    async fn authorization_failure_refreshes_once_and_retries_same_endpoint() {
        let worker = Arc::new(ScriptedWorker::new(vec![(
            "https://e1",
            vec![
                FetchResult::UpstreamError {
                    status: 401,
                    snippet: "token expired".into(),
                },
                success(),
            ],
        )]));
        let exchange = Arc::new(CountingExchange::new());
        let engine = engine_with(
            worker.clone(),
            vec![endpoint("https://e1", "us-east")],
            exchange.clone(),
        );

        let outcome = engine.resolve_proxied("news.blocked.org").await;
        assert!(matches!(outcome, EngineOutcome::Resolved(_)));

        let invocations = worker.invocations();
        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[0].0, "https://e1");
        assert_eq!(invocations[1].0, "https://e1");
        // First invocation with token-1, retry carries the refreshed token.
        assert_eq!(invocations[0].1, "token-1");
        assert_eq!(invocations[1].1, "token-2");
        assert_eq!(exchange.calls(), 2);
    }

    #[tokio::test]
    async fn plain_upstream_error_advances_without_refresh() {
        let worker = Arc::new(ScriptedWorker::new(vec![
            (
                "https://e1",
                vec![FetchResult::UpstreamError {
                    status: 502,
                    snippet: "bad gateway".into(),
                }],
            ),
            ("https://e2", vec![success()]),
        ]));
        let exchange = Arc::new(CountingExchange::new());
        let engine = engine_with(
            worker.clone(),
            vec![
                endpoint("https://e1", "us-east"),
                endpoint("https://e2", "eu-west"),
            ],
            exchange.clone(),
        );

        let outcome = engine.resolve_proxied("news.blocked.org").await;
        assert!(matches!(outcome, EngineOutcome::Resolved(_)));
        assert_eq!(exchange.calls(), 1);
        let contacted: Vec<String> = worker
            .invocations()
            .into_iter()
            .map(|(url, _)| url)
            .collect();
        assert_eq!(contacted, vec!["https://e1", "https://e2"]);
    }

    #[tokio::test]
    async fn exhausted_endpoints_yield_failure_outcome() {
        let worker = Arc::new(ScriptedWorker::new(vec![
            (
                "https://e1",
                vec![FetchResult::Blocked {
                    signature: "captcha-delivery".into(),
                }],
            ),
            (
                "https://e2",
                vec![FetchResult::UpstreamError {
                    status: 500,
                    snippet: "boom".into(),
                }],
            ),
        ]));
        let engine = engine_with(
            worker,
            vec![
                endpoint("https://e1", "us-east"),
                endpoint("https://e2", "eu-west"),
            ],
            Arc::new(CountingExchange::new()),
        );

        let outcome = engine.resolve_proxied("news.blocked.org").await;
        assert_eq!(outcome, EngineOutcome::Exhausted);
        assert!(engine.routes().is_empty());
    }

    #[tokio::test]
    async fn auth_failure_short_circuits_before_any_invocation() {
        let worker = Arc::new(ScriptedWorker::new(vec![("https://e1", vec![success()])]));
        let engine = engine_with(
            worker.clone(),
            vec![endpoint("https://e1", "us-east")],
            Arc::new(CountingExchange::failing()),
        );

        let outcome = engine.resolve_proxied("news.blocked.org").await;
        assert_eq!(outcome, EngineOutcome::AuthFailed);
        assert!(worker.invocations().is_empty());
    }

    #[tokio::test]
    async fn successful_resolution_records_a_route_binding() {
        let worker = Arc::new(ScriptedWorker::new(vec![("https://e1", vec![success()])]));
        let engine = engine_with(
            worker,
            vec![endpoint("https://e1", "us-east")],
            Arc::new(CountingExchange::new()),
        );

        let outcome = engine.resolve_proxied("News.Blocked.Org.").await;
        let answer = match outcome {
            EngineOutcome::Resolved(answer) => answer,
            other => panic!("expected Resolved, got {other:?}"),
        };

        let entry = engine
            .routes()
            .lookup("news.blocked.org")
            .expect("route recorded");
        assert_eq!(entry.address, answer.address);
    }

    #[test]
    fn synthesized_addresses_are_deterministic_and_loopback() {
        let first = synthesize_address("news.blocked.org");
        let second = synthesize_address("NEWS.blocked.org.");
        assert_eq!(first, second);

        let octets = first.octets();
        assert_eq!(octets[0], 127);
        assert_eq!(octets[1], 86);
        assert_ne!(octets[3], 0);
        assert_ne!(octets[3], 255);

        let other = synthesize_address("video.blocked.org");
        assert_ne!(first, other);
    }

    #[test]
    fn synthesized_host_octets_avoid_zero_and_broadcast() {
        for i in 0..4096 {
            let address = synthesize_address(&format!("sub{i}.blocked.org"));
            let octets = address.octets();
            assert_eq!(octets[0], 127, "{address} for sub{i}");
            assert_eq!(octets[1], 86, "{address} for sub{i}");
            assert_ne!(octets[2], 0, "{address} for sub{i}");
            assert_ne!(octets[2], 255, "{address} for sub{i}");
            assert_ne!(octets[3], 0, "{address} for sub{i}");
            assert_ne!(octets[3], 255, "{address} for sub{i}");
        }
    }

    #[test]
    fn route_entries_expire_after_ttl() {
        let table = ProxyRouteTable::default();
        let now = Instant::now();
        table.bind_at("a.blocked.org", Ipv4Addr::new(127, 86, 1, 1), now);

        assert!(table.lookup_at("a.blocked.org", now).is_some());
        let later = now + ROUTE_TTL + Duration::from_secs(1);
        assert!(table.lookup_at("a.blocked.org", later).is_none());
        // The expired lookup also drops the entry.
        assert!(table.is_empty());
    }

    #[test]
    fn stale_route_entries_are_pruned_on_insert() {
        let table = ProxyRouteTable::default();
        let now = Instant::now();
        table.bind_at("a.blocked.org", Ipv4Addr::new(127, 86, 1, 1), now);
        table.bind_at(
            "b.blocked.org",
            Ipv4Addr::new(127, 86, 1, 2),
            now + ROUTE_TTL + Duration::from_secs(1),
        );

        assert_eq!(table.len(), 1);
        assert!(
            table
                .lookup_at("b.blocked.org", now + ROUTE_TTL + Duration::from_secs(2))
                .is_some()
        );
    }

    #[test]
    fn deployments_map_and_rank_by_configured_regions() {
        let deployments = vec![
            DeploymentRecord {
                id: Some("d1".into()),
                url: Some("https://gamma.workers.example/".into()),
                region: Some("ap-east".into()),
            },
            DeploymentRecord {
                id: Some("d2".into()),
                url: None,
                region: Some("us-east".into()),
            },
            DeploymentRecord {
                id: Some("d3".into()),
                url: Some("https://alpha.workers.example".into()),
                region: Some("us-east".into()),
            },
            DeploymentRecord {
                id: None,
                url: Some("https://delta.workers.example".into()),
                region: None,
            },
        ];
        let regions = vec!["us-east".to_string(), "eu-west".to_string(), "ap-east".to_string()];

        let ranked = rank_endpoints(map_deployments(deployments), &regions);
        let urls: Vec<&str> = ranked.iter().map(|e| e.base_url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://alpha.workers.example",
                "https://gamma.workers.example",
                "https://delta.workers.example",
            ]
        );
        assert_eq!(ranked[2].region, "unknown");
    }
}
