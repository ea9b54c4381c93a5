//! Boundary traits towards the host GATT stack.
//!
//! The protocol cores never talk to a BLE stack directly. The server side
//! sends through a [`GattLink`]; the client side writes and subscribes
//! through a [`GattPeer`]. Completion signals (notification sent, indication
//! confirmed) flow back in as deferred work items rather than callbacks, so
//! no GATT callback ever re-enters protocol logic inline.

use crate::error::Result;

/// Characteristics of the Ranging Service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    Features,
    RealtimeRangingData,
    OnDemandRangingData,
    ControlPoint,
    RangingDataReady,
    RangingDataOverwritten,
}

impl Characteristic {
    /// 16-bit characteristic UUID.
    pub const fn uuid(self) -> u16 {
        match self {
            Characteristic::Features => crate::RAS_FEATURES_UUID,
            Characteristic::RealtimeRangingData => crate::RAS_REALTIME_RD_UUID,
            Characteristic::OnDemandRangingData => crate::RAS_ONDEMAND_RD_UUID,
            Characteristic::ControlPoint => crate::RAS_CP_UUID,
            Characteristic::RangingDataReady => crate::RAS_RD_READY_UUID,
            Characteristic::RangingDataOverwritten => crate::RAS_RD_OVERWRITTEN_UUID,
        }
    }
}

/// Client Characteristic Configuration subscription kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Notify,
    Indicate,
}

/// Application ATT error codes returned from RAS attribute callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttError {
    /// RAS-CP written without an indicate subscription on it.
    CccConfig,
    /// RAS-CP written while a previous command is still being handled.
    WriteRequestRejected,
}

impl AttError {
    /// On-wire ATT application error code.
    pub const fn code(self) -> u8 {
        match self {
            AttError::CccConfig => 0xfd,
            AttError::WriteRequestRejected => 0xfc,
        }
    }
}

/// Server-side transport towards one connected peer.
///
/// Implementations wrap the host stack's notify/indicate primitives for the
/// attributes of the registered Ranging Service instance. Sends are
/// asynchronous-complete: a returned `Ok` means the PDU was accepted by the
/// stack, and the matching sent/confirmed signal arrives later as a work
/// item.
pub trait GattLink {
    /// Negotiated ATT MTU of the connection.
    fn mtu(&self) -> u16;

    /// Whether the peer subscribed to `chrc` for the given kind.
    fn is_subscribed(&self, chrc: Characteristic, kind: SubscriptionKind) -> bool;

    /// Queue a notification on `chrc`.
    fn notify(&mut self, chrc: Characteristic, data: &[u8]) -> Result<()>;

    /// Queue an indication on `chrc`.
    fn indicate(&mut self, chrc: Characteristic, data: &[u8]) -> Result<()>;
}

/// Client-side transport towards a remote Ranging Service.
pub trait GattPeer {
    /// Write without response to the value handle of `chrc`.
    fn write_without_response(&mut self, chrc: Characteristic, data: &[u8]) -> Result<()>;

    /// Subscribe to `chrc` for the given kind.
    fn subscribe(&mut self, chrc: Characteristic, kind: SubscriptionKind) -> Result<()>;
}
