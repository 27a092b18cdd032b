use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Upper bound on an upstream UDP response (EDNS-sized).
const MAX_RESPONSE_SIZE: usize = 4096;

/// Seam over one UDP request/response exchange with a nameserver.
#[async_trait]
pub trait DnsExchange: Send + Sync {
    async fn exchange(&self, payload: &[u8], upstream: &str) -> Result<Vec<u8>>;
}

/// Production exchange: ephemeral socket, one datagram out, one in, with a
/// per-attempt timeout.
pub struct UdpDnsExchange {
    attempt_timeout: Duration,
}

impl UdpDnsExchange {
    pub fn new(attempt_timeout: Duration) -> Self {
        Self { attempt_timeout }
    }
}

#[async_trait]
impl DnsExchange for UdpDnsExchange {
    async fn exchange(&self, payload: &[u8], upstream: &str) -> Result<Vec<u8>> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("Failed to bind upstream query socket")?;
        socket
            .send_to(payload, upstream)
            .await
            .with_context(|| format!("Failed to send query to upstream {upstream}"))?;

        let mut buffer = vec![0u8; MAX_RESPONSE_SIZE];
        let received = tokio::time::timeout(self.attempt_timeout, socket.recv(&mut buffer))
            .await
            .map_err(|_| anyhow!("upstream {upstream} timed out"))?
            .with_context(|| format!("Failed to receive response from upstream {upstream}"))?;
        buffer.truncate(received);
        Ok(buffer)
    }
}

/// Forwards a query to an ordered list of nameservers, returning the first
/// non-empty successful answer. Never merges answers across upstreams and
/// never retries a single upstream twice within one query.
pub struct UpstreamResolver {
    nameservers: Vec<String>,
    exchange: Arc<dyn DnsExchange>,
}

impl UpstreamResolver {
    pub fn new(nameservers: Vec<String>, attempt_timeout: Duration) -> Self {
        Self::with_exchange(nameservers, Arc::new(UdpDnsExchange::new(attempt_timeout)))
    }

    pub fn with_exchange(nameservers: Vec<String>, exchange: Arc<dyn DnsExchange>) -> Self {
        Self {
            nameservers,
            exchange,
        }
    }

    /// Resolve against the upstream list in order. `Ok(None)` means every
    /// upstream failed or answered empty; the caller replies with an
    /// empty-but-valid response rather than a server failure.
    pub async fn resolve(&self, query: &Message) -> Result<Option<Message>> {
        let payload = query
            .to_vec()
            .context("failed to serialise query for upstream forward")?;

        for upstream in &self.nameservers {
            let bytes = match self.exchange.exchange(&payload, upstream).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(upstream = %upstream, error = %err, "Upstream exchange failed; trying next");
                    continue;
                }
            };

            match Message::from_vec(&bytes) {
                Ok(response) => {
                    if response.id() != query.id() {
                        warn!(upstream = %upstream, "Upstream response id mismatch; trying next");
                        continue;
                    }
                    if response.answers().is_empty() {
                        debug!(upstream = %upstream, "Upstream returned no answers; trying next");
                        continue;
                    }
                    return Ok(Some(response));
                }
                Err(err) => {
                    warn!(upstream = %upstream, error = %err, "Failed to parse upstream response; trying next");
                }
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    enum Scripted {
        Fail,
        Empty,
        Answer(Ipv4Addr),
        WrongId,
    }

    struct ScriptedExchange {
        script: HashMap<String, Scripted>,
        contacted: Mutex<Vec<String>>,
    }

    impl ScriptedExchange {
        fn new(entries: Vec<(&str, Scripted)>) -> Self {
            Self {
                script: entries
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
                contacted: Mutex::new(Vec::new()),
            }
        }

        fn contacted(&self) -> Vec<String> {
            self.contacted.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl DnsExchange for ScriptedExchange {
        async fn exchange(&self, payload: &[u8], upstream: &str) -> Result<Vec<u8>> {
            self.contacted
                .lock()
                .expect("lock")
                .push(upstream.to_string());
            let query = Message::from_vec(payload).expect("query parses");
            match self.script.get(upstream) {
                Some(Scripted::Fail) | None => Err(anyhow!("connection refused")),
                Some(Scripted::Empty) => {
                    let response = response_for(&query, None);
                    Ok(response.to_vec().expect("serialise"))
                }
                Some(Scripted::Answer(address)) => {
                    let response = response_for(&query, Some(*address));
                    Ok(response.to_vec().expect("serialise"))
                }
                Some(Scripted::WrongId) => {
                    let mut response = response_for(&query, Some(Ipv4Addr::new(192, 0, 2, 1)));
                    response.set_id(query.id().wrapping_add(1));
                    Ok(response.to_vec().expect("serialise"))
                }
            }
        }
    }

    fn sample_query() -> Message {
        let mut message = Message::new();
        message.set_id(4242);
        let name = Name::from_ascii("example.com.").expect("name parses");
        message.add_query(Query::query(name, RecordType::A));
        message
    }

    fn response_for(query: &Message, address: Option<Ipv4Addr>) -> Message {
        let mut response = Message::new();
        response.set_id(query.id());
        response.set_message_type(MessageType::Response);
        response.add_queries(query.queries().to_vec());
        if let Some(address) = address {
            let name = query.queries()[0].name().clone();
            let record = Record::from_rdata(name, 300, RData::A(A(address)));
            response.add_answer(record);
        }
        response
    }

    #[tokio::test]
    async fn first_answering_upstream_wins_and_later_ones_are_not_contacted() {
        let exchange = Arc::new(ScriptedExchange::new(vec![
            ("10.0.0.1:53", Scripted::Fail),
            ("10.0.0.2:53", Scripted::Fail),
            ("10.0.0.3:53", Scripted::Answer(Ipv4Addr::new(93, 184, 216, 34))),
            ("10.0.0.4:53", Scripted::Answer(Ipv4Addr::new(203, 0, 113, 9))),
        ]));
        let resolver = UpstreamResolver::with_exchange(
            vec![
                "10.0.0.1:53".into(),
                "10.0.0.2:53".into(),
                "10.0.0.3:53".into(),
                "10.0.0.4:53".into(),
            ],
            exchange.clone(),
        );

        let response = resolver
            .resolve(&sample_query())
            .await
            .expect("resolve ok")
            .expect("answer present");

        assert_eq!(response.answers().len(), 1);
        assert_eq!(
            exchange.contacted(),
            vec!["10.0.0.1:53", "10.0.0.2:53", "10.0.0.3:53"]
        );
    }

    #[tokio::test]
    async fn empty_answer_sets_advance_to_the_next_upstream() {
        let exchange = Arc::new(ScriptedExchange::new(vec![
            ("10.0.0.1:53", Scripted::Empty),
            ("10.0.0.2:53", Scripted::Answer(Ipv4Addr::new(198, 51, 100, 7))),
        ]));
        let resolver = UpstreamResolver::with_exchange(
            vec!["10.0.0.1:53".into(), "10.0.0.2:53".into()],
            exchange.clone(),
        );

        let response = resolver.resolve(&sample_query()).await.expect("resolve ok");
        assert!(response.is_some());
        assert_eq!(exchange.contacted(), vec!["10.0.0.1:53", "10.0.0.2:53"]);
    }

    #[tokio::test]
    async fn mismatched_response_id_is_not_trusted() {
        let exchange = Arc::new(ScriptedExchange::new(vec![
            ("10.0.0.1:53", Scripted::WrongId),
            ("10.0.0.2:53", Scripted::Answer(Ipv4Addr::new(198, 51, 100, 7))),
        ]));
        let resolver = UpstreamResolver::with_exchange(
            vec!["10.0.0.1:53".into(), "10.0.0.2:53".into()],
            exchange,
        );

        let response = resolver
            .resolve(&sample_query())
            .await
            .expect("resolve ok")
            .expect("answer present");
        assert_eq!(response.id(), 4242);
    }

    #[tokio::test]
    async fn total_upstream_failure_yields_no_answer() {
        let exchange = Arc::new(ScriptedExchange::new(vec![
            ("10.0.0.1:53", Scripted::Fail),
            ("10.0.0.2:53", Scripted::Empty),
        ]));
        let resolver = UpstreamResolver::with_exchange(
            vec!["10.0.0.1:53".into(), "10.0.0.2:53".into()],
            exchange.clone(),
        );

        let response = resolver.resolve(&sample_query()).await.expect("resolve ok");
        assert!(response.is_none());
        // Each upstream tried exactly once.
        assert_eq!(exchange.contacted(), vec!["10.0.0.1:53", "10.0.0.2:53"]);
    }
}
