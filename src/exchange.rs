//! Per-exchange identity and state (spec §3, §4.4).
//!
//! `ExchangeContext` is the data the manager keeps in its index: identity,
//! role, lifecycle state and the two "owed work" flags. It carries no logic
//! of its own — `ExchangeManager` mutates it under the index lock and calls
//! out to delegates/tables outside that lock. `Exchange` is the lightweight
//! handle upper-layer code and delegates actually hold; it borrows back into
//! the manager the way the teacher's `Connection` wraps `ActiveConnection`.

use std::sync::Arc;

use crate::error::{ExchangeError, Result};
use crate::exchange_mgr::ExchangeManager;
use crate::protocol::ProtocolHeader;
use crate::transport::PeerAddress;

/// Our view of which side initiated a given exchange. Orthogonal to whichever
/// side initiated session establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// The role we take on when the peer's initiator flag is `peer_is_initiator`.
    pub fn complementary(peer_is_initiator: bool) -> Self {
        if peer_is_initiator {
            Role::Responder
        } else {
            Role::Initiator
        }
    }

    pub fn is_initiator(self) -> bool {
        matches!(self, Role::Initiator)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Active,
    Closing,
    Closed,
}

/// Identity used for all indexing (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeKey {
    pub local_session_id: u16,
    pub exchange_id: u16,
    pub role: Role,
}

/// Upper-layer callback sink for a specific exchange (spec §6).
pub trait ExchangeDelegate: Send + Sync {
    /// A message arrived on this exchange after MRP processing. May return a
    /// response payload for the manager to send back on the same exchange.
    fn on_message(&self, exchange: &Exchange, header: &ProtocolHeader, payload: &[u8]) -> Option<Vec<u8>>;

    /// The exchange has been torn down.
    fn on_close(&self, _key: ExchangeKey) {}
}

/// Per-exchange state owned exclusively by the manager's index.
pub struct ExchangeContext {
    pub key: ExchangeKey,
    pub protocol_id: u16,
    pub session_ref: u64,
    pub peer_address: PeerAddress,
    pub state: ExchangeState,
    pub delegate: Option<Arc<dyn ExchangeDelegate>>,
    /// Counter of a received reliable message we owe an ack for.
    pub pending_ack: Option<u32>,
    /// Counter of a reliable message we sent that hasn't been acked yet.
    pub pending_retransmit: Option<u32>,
    /// Set under the index lock for the duration of a reliable
    /// `send_message` call, before the counter is known (encrypt hasn't run
    /// yet). Makes the "at most one outstanding reliable send" check atomic
    /// with the check itself, closing the window a second concurrent send
    /// could otherwise slip through between the check and the retransmit
    /// entry actually being installed.
    pub reserving_retransmit: bool,
}

impl ExchangeContext {
    pub fn new(
        key: ExchangeKey,
        protocol_id: u16,
        session_ref: u64,
        peer_address: PeerAddress,
        delegate: Option<Arc<dyn ExchangeDelegate>>,
    ) -> Self {
        Self {
            key,
            protocol_id,
            session_ref,
            peer_address,
            state: ExchangeState::Active,
            delegate,
            pending_ack: None,
            pending_retransmit: None,
            reserving_retransmit: false,
        }
    }

    pub fn can_send(&self) -> bool {
        self.state == ExchangeState::Active && self.pending_retransmit.is_none() && !self.reserving_retransmit
    }

    pub fn can_receive(&self) -> bool {
        matches!(self.state, ExchangeState::Active | ExchangeState::Closing)
    }

    pub fn check_send_allowed(&self) -> Result<()> {
        match self.state {
            ExchangeState::Closed => Err(ExchangeError::ExchangeClosed),
            ExchangeState::Closing => Err(ExchangeError::ExchangeClosing),
            ExchangeState::Active if self.pending_retransmit.is_some() || self.reserving_retransmit => {
                Err(ExchangeError::PendingRetransmit)
            }
            ExchangeState::Active => Ok(()),
        }
    }
}

/// Lightweight handle to a live exchange, held by application code and
/// delegates. Mirrors `ExchangeManager`'s `Arc`-backed sharing: cloning is
/// cheap and every clone refers to the same underlying exchange.
#[derive(Clone)]
pub struct Exchange {
    pub(crate) mgr: ExchangeManager,
    pub(crate) key: ExchangeKey,
}

impl Exchange {
    pub(crate) fn new(mgr: ExchangeManager, key: ExchangeKey) -> Self {
        Self { mgr, key }
    }

    pub fn id(&self) -> u16 {
        self.key.exchange_id
    }

    pub fn role(&self) -> Role {
        self.key.role
    }

    pub fn key(&self) -> ExchangeKey {
        self.key
    }

    /// Send on this exchange. See `ExchangeManager::send_message` for the
    /// full flow control, piggyback and retransmit-tracking semantics.
    pub async fn send_message(&self, opcode: u8, payload: &[u8], reliable: bool) -> Result<()> {
        self.mgr.send_message(self.key, opcode, payload, reliable).await
    }

    /// Idempotent close; see `ExchangeManager::close_exchange`.
    pub async fn close(&self) -> Result<()> {
        self.mgr.close_exchange(self.key).await
    }
}
