//! In-process stand-in for the control protocol's wire transport: peers are
//! reached through per-target `tokio::sync::mpsc` mailboxes rather than a
//! real network socket, but the request/response shape (and the
//! prep/add/wait/destroy request-set lifecycle) matches what a real RPC
//! layer would expose.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use lfsck_proto::{LfsckError, LfsckRequest};
use tokio::sync::{mpsc, oneshot};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

struct Envelope {
    req: LfsckRequest,
    reply: oneshot::Sender<Result<LfsckRequest, LfsckError>>,
}

/// A single request/response call to a named peer target, abstracting over
/// how the bytes actually travel.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn send(&self, index: u16, req: LfsckRequest) -> Result<LfsckRequest, LfsckError>;
}

/// In-process transport: each peer target registers a mailbox and a
/// background task that drains it, replying on the embedded oneshot.
pub struct InProcessTransport {
    mailboxes: DashMap<u16, mpsc::Sender<Envelope>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        InProcessTransport { mailboxes: DashMap::new() }
    }

    /// Registers `index` as a peer and spawns a task draining its mailbox
    /// through `handler`, one request at a time, mirroring the single
    /// supervisor task per Instance that would run a real peer's
    /// `in_notify`.
    pub fn register_peer<F>(&self, index: u16, handler: F)
    where
        F: Fn(LfsckRequest) -> Result<LfsckRequest, LfsckError> + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Envelope>(32);
        self.mailboxes.insert(index, tx);
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let result = handler(envelope.req);
                let _ = envelope.reply.send(result);
            }
        });
    }

    pub fn unregister_peer(&self, index: u16) {
        self.mailboxes.remove(&index);
    }
}

impl Default for InProcessTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RpcTransport for InProcessTransport {
    async fn send(&self, index: u16, req: LfsckRequest) -> Result<LfsckRequest, LfsckError> {
        let sender = self
            .mailboxes
            .get(&index)
            .map(|e| e.value().clone())
            .ok_or_else(|| LfsckError::no_such_target(index))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(Envelope { req, reply: reply_tx })
            .await
            .map_err(|_| LfsckError::PeerTimeout(format!("target {index} mailbox closed")))?;

        match tokio::time::timeout(RPC_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LfsckError::PeerTimeout(format!("target {index} dropped reply"))),
            Err(_) => Err(LfsckError::PeerTimeout(format!("target {index} timed out"))),
        }
    }
}

/// Fan-out helper over a `RpcTransport`: `prep_set`/`set_add_req`/`set_wait`
/// map onto `new`/`add_req`/`wait`; dropping the set is `set_destroy`.
pub struct RequestSet {
    transport: Arc<dyn RpcTransport>,
    pending: Vec<(u16, LfsckRequest)>,
}

impl RequestSet {
    pub fn prep_set(transport: Arc<dyn RpcTransport>) -> Self {
        RequestSet { transport, pending: Vec::new() }
    }

    pub fn set_add_req(&mut self, index: u16, req: LfsckRequest) {
        self.pending.push((index, req));
    }

    /// Sends every queued request concurrently and waits for all replies.
    /// Order of the returned map has no bearing on fan-out semantics;
    /// callers (the control protocol) decide how to fold per-peer results.
    pub async fn set_wait(self) -> HashMap<u16, Result<LfsckRequest, LfsckError>> {
        let transport = self.transport;
        let futures = self.pending.into_iter().map(|(index, req)| {
            let transport = transport.clone();
            async move { (index, transport.send(index, req).await) }
        });
        futures_util::future::join_all(futures).await.into_iter().collect()
    }
}

/// No explicit teardown is needed for the in-process transport; provided so
/// call sites can name the step the external interface calls for.
pub fn set_destroy(_set: RequestSet) {}

#[cfg(test)]
mod tests {
    use super::*;
    use lfsck_proto::request::{LfsckEvent, StartParam};

    fn start_req(index: u16) -> LfsckRequest {
        LfsckRequest::start(index, 1, lfsck_proto::component_mask::ALL, &StartParam::default())
    }

    #[tokio::test]
    async fn fan_out_collects_replies_from_every_peer() {
        let transport = Arc::new(InProcessTransport::new());
        transport.register_peer(1, |req| Ok(req));
        transport.register_peer(2, |req| Ok(req));

        let mut set = RequestSet::prep_set(transport);
        set.set_add_req(1, start_req(1));
        set.set_add_req(2, start_req(2));
        let results = set.set_wait().await;

        assert_eq!(results.len(), 2);
        assert!(results[&1].is_ok());
        assert!(results[&2].is_ok());
    }

    #[tokio::test]
    async fn one_peer_failing_does_not_affect_the_other() {
        let transport = Arc::new(InProcessTransport::new());
        transport.register_peer(1, |_req| Err(LfsckError::NotSupported("layout".into())));
        transport.register_peer(2, |req| Ok(req));

        let mut set = RequestSet::prep_set(transport);
        set.set_add_req(1, start_req(1));
        set.set_add_req(2, start_req(2));
        let results = set.set_wait().await;

        assert!(matches!(results[&1], Err(LfsckError::NotSupported(_))));
        assert!(results[&2].is_ok());
    }

    #[tokio::test]
    async fn send_to_unregistered_target_fails_fast() {
        let transport = InProcessTransport::new();
        let err = transport.send(9, start_req(9)).await.unwrap_err();
        assert!(matches!(err, LfsckError::NotFound(_)));
    }

    #[tokio::test]
    async fn unregister_peer_makes_further_sends_fail() {
        let transport = InProcessTransport::new();
        transport.register_peer(3, |req| Ok(req));
        transport.send(3, start_req(3)).await.unwrap();
        transport.unregister_peer(3);
        assert!(transport.send(3, start_req(3)).await.is_err());
    }

    #[test]
    fn event_kind_survives_fan_out_request() {
        let req = start_req(1);
        assert_eq!(req.event, LfsckEvent::Start);
    }
}
