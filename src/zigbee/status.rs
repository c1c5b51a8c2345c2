//! Confirm status codes delivered across the NWK and APS service boundaries.
//!
//! Kept as plain enums rather than `Result::Err` because the spec models
//! them as values carried by a confirm primitive on the originating context,
//! not as exceptions — see `DESIGN.md` for the reasoning.

/// NLDE/NLME confirm statuses (§4.5). A deliberate subset of the full
/// ns-3 `ZigbeeNwkStatus` enum, matching what this crate's state machine
/// can actually produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NwkStatus {
    Success,
    NoRouteAvailable,
    RouteError,
    NotSupported,
    InvalidRequest,
    NotPermitted,
    FrameNotBuffered,
    RouteDiscoveryFailed,
}

/// APSDE/APSME confirm statuses (§4.6).
///
/// `NoBoundDevice` is not in the spec's enumerated subset; it is added here
/// (see `SPEC_FULL.md` §10.6) to surface the original ns-3 behavior of
/// `SendDataWithBindingTable` confirming a distinct status when the binding
/// table has no destinations for the requested source key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApsStatus {
    Success,
    NotSupported,
    InvalidRequest,
    InvalidParameter,
    IllegalRequest,
    InvalidGroup,
    InvalidBinding,
    TableFull,
    NoBoundDevice,
    NoShortAddress,
    SecurityFail,
    DefragUnsupported,
    /// Not part of the spec's enumerated subset: surfaces a failed NWK-level
    /// confirm (`NwkStatus::RouteError`/`NoRouteAvailable`/`RouteDiscoveryFailed`)
    /// back up through APSDE-DATA.confirm, which the spec's subset has no
    /// dedicated status for.
    NoRoute,
}

impl From<NwkStatus> for ApsStatus {
    fn from(status: NwkStatus) -> Self {
        match status {
            NwkStatus::Success => ApsStatus::Success,
            NwkStatus::NoRouteAvailable | NwkStatus::RouteError | NwkStatus::RouteDiscoveryFailed => {
                ApsStatus::NoRoute
            }
            NwkStatus::NotSupported => ApsStatus::NotSupported,
            NwkStatus::InvalidRequest => ApsStatus::InvalidRequest,
            NwkStatus::NotPermitted => ApsStatus::IllegalRequest,
            NwkStatus::FrameNotBuffered => ApsStatus::InvalidRequest,
        }
    }
}
