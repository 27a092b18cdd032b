use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::Response,
    routing::get,
};
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};
use tokio::{
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
};
use tracing::{debug, error, info, warn};

use crate::classify::{ProxyDomainSet, Route, classify};
use crate::config::Settings;
use crate::engine::{
    ApiEndpointProvider, EndpointProvider, EngineOutcome, ProxyEngine, SYNTHESIZED_TTL,
    StaticEndpointProvider,
};
use crate::session::{HttpAuthExchange, SessionCache};
use crate::upstream::UpstreamResolver;
use crate::worker::{FetchResult, WorkerClient, WorkerFetch};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// EDNS-sized receive buffer for inbound datagrams.
const MAX_DATAGRAM: usize = 4096;

/// Well-known target fetched once at startup to verify the worker path
/// end to end. Failure is logged, never fatal.
const PROBE_TARGET: &str = "https://example.com/";

struct RouterMetrics {
    registry: Registry,
    queries_total: IntCounter,
    passthrough_responses_total: IntCounter,
    proxied_responses_total: IntCounter,
    proxy_failures_total: IntCounter,
    upstream_failures_total: IntCounter,
    parse_failures_total: IntCounter,
}

impl RouterMetrics {
    fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let opts = Opts::new(name, help);
            IntCounter::with_opts(opts)
        };

        let queries_total = counter(
            "phantomdns_queries_total",
            "Total number of DNS queries received",
        )?;
        let passthrough_responses_total = counter(
            "phantomdns_passthrough_responses_total",
            "Number of queries answered by upstream nameservers",
        )?;
        let proxied_responses_total = counter(
            "phantomdns_proxied_responses_total",
            "Number of queries answered through the worker indirection layer",
        )?;
        let proxy_failures_total = counter(
            "phantomdns_proxy_failures_total",
            "Number of proxied resolutions that failed on every endpoint",
        )?;
        let upstream_failures_total = counter(
            "phantomdns_upstream_failures_total",
            "Number of forwarded queries every upstream failed to answer",
        )?;
        let parse_failures_total = counter(
            "phantomdns_parse_failures_total",
            "Number of inbound payloads that were not valid DNS messages",
        )?;

        registry.register(Box::new(queries_total.clone()))?;
        registry.register(Box::new(passthrough_responses_total.clone()))?;
        registry.register(Box::new(proxied_responses_total.clone()))?;
        registry.register(Box::new(proxy_failures_total.clone()))?;
        registry.register(Box::new(upstream_failures_total.clone()))?;
        registry.register(Box::new(parse_failures_total.clone()))?;

        Ok(Self {
            registry,
            queries_total,
            passthrough_responses_total,
            proxied_responses_total,
            proxy_failures_total,
            upstream_failures_total,
            parse_failures_total,
        })
    }

    fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

/// Shared per-process context for query handling tasks.
struct RouterState {
    domains: ProxyDomainSet,
    upstream: UpstreamResolver,
    engine: ProxyEngine,
    session: Arc<SessionCache>,
    worker: Arc<dyn WorkerFetch>,
    provider: Arc<dyn EndpointProvider>,
    query_deadline: Duration,
    metrics: Arc<RouterMetrics>,
}

/// The DNS front end: a UDP listener, an optional TCP listener on the same
/// address, and an optional Prometheus endpoint.
pub struct DnsRouter {
    settings: Arc<Settings>,
    state: Arc<RouterState>,
}

impl DnsRouter {
    pub fn new(settings: Settings) -> Result<Self> {
        let metrics =
            Arc::new(RouterMetrics::new().context("Failed to initialise router metrics")?);

        let session = Arc::new(SessionCache::new(Arc::new(HttpAuthExchange::from_settings(
            &settings.api,
        )?)));
        let worker: Arc<dyn WorkerFetch> = Arc::new(WorkerClient::from_settings(&settings.worker)?);
        let provider: Arc<dyn EndpointProvider> = if settings.worker.discovery {
            Arc::new(ApiEndpointProvider::from_settings(
                &settings.api,
                &settings.worker,
                session.clone(),
            )?)
        } else {
            Arc::new(StaticEndpointProvider::from_settings(&settings.worker))
        };
        let engine = ProxyEngine::new(session.clone(), worker.clone(), provider.clone());

        let upstream = UpstreamResolver::new(
            settings.nameservers(),
            Duration::from_millis(settings.upstream.attempt_timeout_ms),
        );
        let domains = ProxyDomainSet::new(settings.proxy.domains.clone());

        let state = Arc::new(RouterState {
            domains,
            upstream,
            engine,
            session,
            worker,
            provider,
            query_deadline: Duration::from_millis(settings.server.query_deadline_ms),
            metrics,
        });

        Ok(Self {
            settings: Arc::new(settings),
            state,
        })
    }

    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = self
            .settings
            .server
            .listen
            .parse()
            .context("Invalid DNS listener address")?;

        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("Failed to bind UDP listener at {addr}"))?;

        info!(
            listener = %addr,
            proxy_domains = self.state.domains.len(),
            "Starting PhantomDNS router"
        );

        startup_probe(&self.state).await;

        let metrics_addr = self.settings.server.metrics_listen.clone();
        let tcp_addr = self
            .settings
            .server
            .tcp_enabled
            .then(|| self.settings.server.listen.clone());

        match (metrics_addr, tcp_addr) {
            (Some(metrics_addr), Some(tcp_addr)) => {
                tokio::try_join!(
                    run_udp_server(socket, self.state.clone()),
                    run_tcp_server(&tcp_addr, self.state.clone()),
                    run_metrics_server(&metrics_addr, self.state.metrics.clone()),
                )?;
            }
            (Some(metrics_addr), None) => {
                tokio::try_join!(
                    run_udp_server(socket, self.state.clone()),
                    run_metrics_server(&metrics_addr, self.state.metrics.clone()),
                )?;
            }
            (None, Some(tcp_addr)) => {
                tokio::try_join!(
                    run_udp_server(socket, self.state.clone()),
                    run_tcp_server(&tcp_addr, self.state.clone()),
                )?;
            }
            (None, None) => {
                run_udp_server(socket, self.state.clone()).await?;
            }
        }

        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received; stopping PhantomDNS");
}

/// Authenticate and fetch one well-known page through the top-ranked
/// endpoint so connectivity problems surface at startup rather than on the
/// first real query.
async fn startup_probe(state: &RouterState) {
    let endpoint = match state.provider.endpoints().await {
        Ok(endpoints) => match endpoints.into_iter().next() {
            Some(endpoint) => endpoint,
            None => return,
        },
        Err(err) => {
            warn!(error = %err, "Startup probe skipped; no endpoints available");
            return;
        }
    };
    let credential = match state.session.ensure_authenticated().await {
        Ok(credential) => credential,
        Err(err) => {
            warn!(error = %err, "Startup probe skipped; authentication unavailable");
            return;
        }
    };
    match state.worker.invoke(PROBE_TARGET, &endpoint, &credential).await {
        FetchResult::Success { status, .. } => {
            info!(
                endpoint = %endpoint.base_url,
                region = %endpoint.region,
                status,
                "Worker connectivity verified"
            );
        }
        other => {
            warn!(
                endpoint = %endpoint.base_url,
                outcome = other.kind(),
                "Worker connectivity probe failed; continuing anyway"
            );
        }
    }
}

async fn run_udp_server(socket: UdpSocket, state: Arc<RouterState>) -> Result<()> {
    let socket = Arc::new(socket);
    let mut buffer = vec![0u8; MAX_DATAGRAM];

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                break;
            }
            received = socket.recv_from(&mut buffer) => {
                let (len, peer) = match received {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "Failed to receive DNS datagram");
                        continue;
                    }
                };

                let payload = buffer[..len].to_vec();
                let socket = socket.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    let reply = handle_query_with_deadline(&state, &payload).await;
                    if let Some(reply) = reply {
                        if let Err(err) = socket.send_to(&reply, peer).await {
                            warn!(peer = %peer, error = %err, "Failed to send DNS reply");
                        }
                    }
                });
            }
        }
    }

    Ok(())
}

async fn run_tcp_server(addr: &str, state: Arc<RouterState>) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid TCP listener address: {addr}"))?;

    let listener = TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("Failed to bind TCP listener at {socket_addr}"))?;

    info!(listener = %socket_addr, "Starting PhantomDNS TCP listener");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                break;
            }
            accept_result = listener.accept() => {
                let (stream, peer) = match accept_result {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "Failed to accept TCP connection");
                        continue;
                    }
                };

                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_tcp_connection(stream, state).await {
                        warn!(peer = %peer, error = %err, "TCP connection terminated with error");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn handle_tcp_connection(mut stream: TcpStream, state: Arc<RouterState>) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err).context("Failed to read TCP frame length"),
        }
        let len = u16::from_be_bytes(len_buf) as usize;

        if len == 0 {
            continue;
        }

        let mut payload = vec![0u8; len];
        stream
            .read_exact(&mut payload)
            .await
            .context("Failed to read TCP frame payload")?;

        if let Some(reply) = handle_query_with_deadline(&state, &payload).await {
            write_tcp_response(&mut stream, &reply).await?;
        }
    }

    Ok(())
}

async fn write_tcp_response<S>(stream: &mut S, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    if payload.len() > u16::MAX as usize {
        anyhow::bail!("DNS message exceeds TCP frame size limit");
    }
    stream
        .write_u16(payload.len() as u16)
        .await
        .context("Failed to write TCP frame length")?;
    stream
        .write_all(payload)
        .await
        .context("Failed to write TCP frame payload")?;
    stream.flush().await.context("Failed to flush TCP frame")
}

/// Per-query deadline. A slow fallback walk still yields an empty reply
/// before the client's own read budget expires.
async fn handle_query_with_deadline(state: &RouterState, payload: &[u8]) -> Option<Vec<u8>> {
    match tokio::time::timeout(state.query_deadline, handle_query(state, payload)).await {
        Ok(reply) => reply,
        Err(_) => {
            warn!("Query deadline exceeded; replying empty");
            deadline_reply(payload)
        }
    }
}

/// Parse, classify, dispatch, reply. `None` means no reply is possible
/// (malformed payload).
async fn handle_query(state: &RouterState, payload: &[u8]) -> Option<Vec<u8>> {
    state.metrics.queries_total.inc();

    let request = match Message::from_vec(payload) {
        Ok(message) => message,
        Err(err) => {
            state.metrics.parse_failures_total.inc();
            warn!(error = %err, "Dropping malformed DNS payload");
            return None;
        }
    };

    let Some(question) = request.queries().first().cloned() else {
        return build_reply(&request, ResponseCode::FormErr, Vec::new()).ok();
    };
    let name = question.name().to_ascii();

    match classify(&name, &state.domains) {
        Route::Passthrough => match state.upstream.resolve(&request).await {
            Ok(Some(response)) => {
                state.metrics.passthrough_responses_total.inc();
                response.to_vec().ok()
            }
            Ok(None) => {
                state.metrics.upstream_failures_total.inc();
                debug!(name = %name, "Every upstream failed or answered empty");
                build_reply(&request, ResponseCode::NoError, Vec::new()).ok()
            }
            Err(err) => {
                state.metrics.upstream_failures_total.inc();
                warn!(name = %name, error = %err, "Upstream forwarding failed");
                build_reply(&request, ResponseCode::NoError, Vec::new()).ok()
            }
        },
        Route::Proxied => {
            if question.query_type() != RecordType::A {
                // The indirection layer only synthesizes IPv4 answers.
                debug!(
                    name = %name,
                    query_type = %question.query_type(),
                    "Non-A query for proxied domain; replying empty"
                );
                return build_reply(&request, ResponseCode::NoError, Vec::new()).ok();
            }

            match state.engine.resolve_proxied(&name).await {
                EngineOutcome::Resolved(answer) => {
                    state.metrics.proxied_responses_total.inc();
                    let record = Record::from_rdata(
                        question.name().clone(),
                        SYNTHESIZED_TTL,
                        RData::A(A(answer.address)),
                    );
                    build_reply(&request, ResponseCode::NoError, vec![record]).ok()
                }
                outcome => {
                    state.metrics.proxy_failures_total.inc();
                    warn!(name = %name, outcome = ?outcome, "Proxied resolution failed; replying empty");
                    // Empty NoError keeps clients from hammering retries
                    // the way ServFail would.
                    build_reply(&request, ResponseCode::NoError, Vec::new()).ok()
                }
            }
        }
    }
}

fn build_reply(request: &Message, code: ResponseCode, answers: Vec<Record>) -> Result<Vec<u8>> {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    response.set_response_code(code);
    response.add_queries(request.queries().to_vec());
    for answer in answers {
        response.add_answer(answer);
    }
    response.to_vec().context("failed to serialise DNS reply")
}

fn deadline_reply(payload: &[u8]) -> Option<Vec<u8>> {
    let request = Message::from_vec(payload).ok()?;
    build_reply(&request, ResponseCode::NoError, Vec::new()).ok()
}

async fn run_metrics_server(addr: &str, metrics: Arc<RouterMetrics>) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listener address: {addr}"))?;

    let listener = TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics listener at {socket_addr}"))?;

    info!(listener = %socket_addr, "Starting PhantomDNS metrics server");

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("PhantomDNS metrics server terminated unexpectedly")
}

async fn metrics_handler(State(metrics): State<Arc<RouterMetrics>>) -> Response {
    match metrics.render() {
        Ok(buffer) => {
            let mut response = Response::new(Body::from(buffer));
            *response.status_mut() = StatusCode::OK;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
            );
            response
        }
        Err(err) => {
            error!(error = %err, "Failed to render metrics");
            let mut response = Response::new(Body::from(err.to_string()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}
