use serde::{Deserialize, Serialize};

/// Events carried over the control protocol between a coordinator and its
/// peer targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LfsckEvent {
    Start,
    Stop,
    Phase1Done,
    Phase2Done,
    FidAccessed,
    PeerExit,
    ConditionalDestroy,
    PairsVerify,
    Notify,
    Query,
}

/// Wire record exchanged for every control-protocol event, mirroring the
/// scalar/bitmask shape of the original `lfsck_request`: no variable-length
/// payload, just event identity plus the handful of fields each event needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LfsckRequest {
    pub event: LfsckEvent,
    /// Target-descriptor index of the sender within the addressed TDT.
    pub index: u16,
    pub status: u16,
    pub version: u16,
    /// Bitmask of `component_mask` values this request concerns.
    pub active: u32,
    /// Bitmask of `start_flags`/`bookmark_param` values, request-kind dependent.
    pub param: u32,
    pub speed: u32,
    pub async_windows: u16,
    /// Bitmask of `start_valid`, marking which optional fields are populated.
    pub valid: u32,
}

impl LfsckRequest {
    pub fn start(index: u16, version: u16, active: u32, p: &StartParam) -> LfsckRequest {
        let mut valid = 0;
        if p.speed_limit.is_some() {
            valid |= crate::start_valid::SPEED_LIMIT;
        }
        if p.error_handle {
            valid |= crate::start_valid::ERROR_HANDLE;
        }
        if p.dryrun {
            valid |= crate::start_valid::DRYRUN;
        }
        if p.async_windows.is_some() {
            valid |= crate::start_valid::ASYNC_WINDOWS;
        }
        LfsckRequest {
            event: LfsckEvent::Start,
            index,
            status: 0,
            version,
            active,
            param: p.flags,
            speed: p.speed_limit.unwrap_or(0),
            async_windows: p.async_windows.unwrap_or(0),
            valid,
        }
    }

    pub fn stop(index: u16, version: u16, p: &StopParam) -> LfsckRequest {
        LfsckRequest {
            event: LfsckEvent::Stop,
            index,
            status: p.status,
            version,
            active: crate::component_mask::ALL,
            param: p.flags,
            speed: 0,
            async_windows: 0,
            valid: 0,
        }
    }
}

/// Parameters accompanying a `start` control-protocol request or public API
/// call. Optional fields left `None` mean "leave the persisted bookmark
/// value untouched" rather than "reset to zero".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartParam {
    pub speed_limit: Option<u32>,
    pub async_windows: Option<u16>,
    pub error_handle: bool,
    pub dryrun: bool,
    pub flags: u32,
}

/// Parameters accompanying a `stop` control-protocol request or public API
/// call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopParam {
    pub status: u16,
    pub flags: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_request_sets_valid_bits_for_populated_fields() {
        let p = StartParam {
            speed_limit: Some(1000),
            async_windows: None,
            error_handle: true,
            dryrun: false,
            flags: 0,
        };
        let req = LfsckRequest::start(0, 1, crate::component_mask::ALL, &p);
        assert_eq!(req.valid & crate::start_valid::SPEED_LIMIT, crate::start_valid::SPEED_LIMIT);
        assert_eq!(req.valid & crate::start_valid::ASYNC_WINDOWS, 0);
        assert_eq!(req.speed, 1000);
    }

    #[test]
    fn stop_request_targets_all_components() {
        let p = StopParam { status: 2, flags: 0 };
        let req = LfsckRequest::stop(0, 1, &p);
        assert_eq!(req.active, crate::component_mask::ALL);
        assert_eq!(req.status, 2);
    }

    #[test]
    fn request_roundtrips_through_json() {
        let p = StartParam::default();
        let req = LfsckRequest::start(3, 1, crate::component_mask::NAMESPACE, &p);
        let encoded = serde_json::to_string(&req).unwrap();
        let decoded: LfsckRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(req, decoded);
    }
}
