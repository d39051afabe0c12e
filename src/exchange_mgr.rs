//! `ExchangeManager`: the coordination surface (spec §4.5).
//!
//! Owns the exchange index, the `AckTable`, the `RetransmitTable`, the
//! protocol handler registry and the session table. Drives the receive path
//! (parse → resolve session → MRP processing → dispatch) and the send path
//! (piggyback → encrypt → track for retransmit → transmit). `ExchangeContext`
//! itself carries no logic; every mutation happens here, under the index
//! lock, with callbacks (delegate, timers) always invoked outside it (spec
//! §5 lock-order and no-suspension-under-lock rules).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::ack_table::AckTable;
use crate::backoff::ProcessRandom;
use crate::config::ExchangeManagerConfig;
use crate::error::{ExchangeError, Result};
use crate::exchange::{Exchange, ExchangeContext, ExchangeDelegate, ExchangeKey, ExchangeState, Role};
use crate::protocol::{ExchangeFlags, ProtocolHeader};
use crate::retransmit_table::{RetransmitOutcome, RetransmitTable};
use crate::session::{NodeSession, Session};
use crate::transport::{PeerAddress, Transport, TransportKind};

/// Per-protocol receiver (spec §4.5 "configuration & handler registry").
pub trait ProtocolHandler: Send + Sync {
    /// A message on an *existing* exchange for this protocol, when no
    /// per-exchange delegate is registered to take it instead.
    fn on_message(&self, exchange: &Exchange, header: &ProtocolHeader, payload: &[u8]) -> Option<Vec<u8>>;

    /// The first message on a new, unsolicited exchange. An error removes
    /// the exchange the manager just created for this message.
    fn on_unsolicited(&self, exchange: &Exchange, header: &ProtocolHeader, payload: &[u8]) -> Result<Option<Vec<u8>>>;
}

struct Inner {
    config: ExchangeManagerConfig,
    transport: Arc<dyn Transport>,
    exchanges: Mutex<HashMap<ExchangeKey, ExchangeContext>>,
    ack_table: AckTable,
    retransmit_table: RetransmitTable,
    handlers: Mutex<HashMap<u16, Arc<dyn ProtocolHandler>>>,
    sessions: Mutex<HashMap<u64, Arc<dyn Session>>>,
    secure_by_local_id: Mutex<HashMap<u16, u64>>,
    unsecured_by_node_id: Mutex<HashMap<[u8; 8], u64>>,
    next_session_ref: AtomicU64,
    next_exchange_id: Mutex<Option<u16>>,
    /// Our own ephemeral node id, advertised as the source node id on
    /// unsecured sessions this node initiates or lazily creates on first
    /// contact (spec §4.5 "unsecured initiator ids").
    local_node_id: [u8; 8],
}

/// Cheap-clone handle to the shared manager state, mirroring the teacher's
/// `Connection`/`ActiveConnection` split.
#[derive(Clone)]
pub struct ExchangeManager(Arc<Inner>);

impl ExchangeManager {
    pub fn new(transport: Arc<dyn Transport>, config: ExchangeManagerConfig) -> Self {
        let standalone_ack_timeout = config.standalone_ack_timeout();
        let max_transmissions = config.max_transmissions;
        Self(Arc::new(Inner {
            config,
            transport,
            exchanges: Mutex::new(HashMap::new()),
            ack_table: AckTable::new(standalone_ack_timeout),
            retransmit_table: RetransmitTable::new(Arc::new(ProcessRandom), max_transmissions),
            handlers: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            secure_by_local_id: Mutex::new(HashMap::new()),
            unsecured_by_node_id: Mutex::new(HashMap::new()),
            next_session_ref: AtomicU64::new(1),
            next_exchange_id: Mutex::new(None),
            local_node_id: rand::random(),
        }))
    }

    pub fn register_handler(&self, protocol_id: u16, handler: Arc<dyn ProtocolHandler>) {
        self.0.handlers.lock().unwrap().insert(protocol_id, handler);
    }

    /// Registers a secure session under `local_session_id`, returning the
    /// opaque reference stored on every exchange created against it.
    pub fn register_secure_session(&self, local_session_id: u16, session: Arc<dyn Session>) -> u64 {
        let session_ref = self.0.next_session_ref.fetch_add(1, Ordering::Relaxed);
        self.0.sessions.lock().unwrap().insert(session_ref, session);
        self.0.secure_by_local_id.lock().unwrap().insert(local_session_id, session_ref);
        session_ref
    }

    /// Registers an unsecured session keyed by the peer's ephemeral source
    /// node id (spec §4.5 "unsecured initiator ids").
    pub fn register_unsecured_session(&self, peer_node_id: [u8; 8], session: Arc<dyn Session>) -> u64 {
        let session_ref = self.0.next_session_ref.fetch_add(1, Ordering::Relaxed);
        self.0.sessions.lock().unwrap().insert(session_ref, session);
        self.0.unsecured_by_node_id.lock().unwrap().insert(peer_node_id, session_ref);
        session_ref
    }

    fn session_by_ref(&self, session_ref: u64) -> Option<Arc<dyn Session>> {
        self.0.sessions.lock().unwrap().get(&session_ref).cloned()
    }

    /// Looks up the unsecured session for `peer_node_id`, creating a fresh
    /// one on first contact (spec §4.5 receive path step 2: "Look up or
    /// create an unsecured session context keyed by source node id"). This
    /// is what lets a responder admit the very first message of the
    /// handshake-bootstrap exchange from a peer it has never seen before,
    /// rather than only ever accepting unsecured traffic from peers a
    /// caller pre-registered via `register_unsecured_session`.
    fn get_or_create_unsecured_session(&self, peer_node_id: [u8; 8]) -> (Arc<dyn Session>, u64) {
        if let Some(&session_ref) = self.0.unsecured_by_node_id.lock().unwrap().get(&peer_node_id) {
            if let Some(session) = self.session_by_ref(session_ref) {
                return (session, session_ref);
            }
        }
        let session: Arc<dyn Session> = Arc::new(NodeSession::unsecured(self.0.local_node_id));
        let session_ref = self.0.next_session_ref.fetch_add(1, Ordering::Relaxed);
        self.0.sessions.lock().unwrap().insert(session_ref, session.clone());
        self.0.unsecured_by_node_id.lock().unwrap().insert(peer_node_id, session_ref);
        log::trace!("created unsecured session for first-contact peer");
        (session, session_ref)
    }

    fn allocate_exchange_id(&self) -> u16 {
        let mut next = self.0.next_exchange_id.lock().unwrap();
        let id = *next.get_or_insert_with(rand::random::<u16>);
        *next = Some(id.wrapping_add(1));
        id
    }

    /// Initiator path (spec §4.5 "Initiator path"). Allocates an exchange id
    /// (random seed, then incrementing), fails with `ExchangeExists` only if
    /// the entire 16-bit space is occupied.
    pub fn new_exchange(
        &self,
        local_session_id: u16,
        session_ref: u64,
        peer_address: PeerAddress,
        protocol_id: u16,
        delegate: Option<Arc<dyn ExchangeDelegate>>,
    ) -> Result<Exchange> {
        let mut exchanges = self.0.exchanges.lock().unwrap();
        for _ in 0..=u16::MAX {
            let exchange_id = self.allocate_exchange_id();
            let key = ExchangeKey {
                local_session_id,
                exchange_id,
                role: Role::Initiator,
            };
            if !exchanges.contains_key(&key) {
                exchanges.insert(
                    key,
                    ExchangeContext::new(key, protocol_id, session_ref, peer_address, delegate),
                );
                return Ok(Exchange::new(self.clone(), key));
            }
        }
        Err(ExchangeError::ExchangeExists)
    }

    /// Send path (spec §4.4 `send_message` + §4.5 "Send path: reliable
    /// case"). Piggybacks any owed ack, encrypts via the session, transmits,
    /// and if reliable, installs a retransmit entry.
    ///
    /// The reliable case reserves the exchange's retransmit slot under the
    /// index lock *before* encrypting or transmitting anything (spec §5:
    /// the call must be atomic with respect to `pending_retransmit`), since
    /// encrypt/transmit are `.await` points a second concurrent reliable
    /// send on the same exchange could otherwise race through. The
    /// reservation is cleared if anything past that point fails, so a
    /// failed send doesn't permanently wedge the exchange.
    pub async fn send_message(&self, key: ExchangeKey, opcode: u8, payload: &[u8], reliable: bool) -> Result<()> {
        let reliable = reliable && self.0.transport.kind() == TransportKind::Datagram;

        let (protocol_id, session_ref, peer_address, is_initiator, piggyback_ack) = {
            let mut exchanges = self.0.exchanges.lock().unwrap();
            let ctx = exchanges.get_mut(&key).ok_or(ExchangeError::ExchangeNotFound)?;
            ctx.check_send_allowed()?;
            if reliable {
                ctx.reserving_retransmit = true;
            }
            let piggyback = ctx.pending_ack.take();
            (ctx.protocol_id, ctx.session_ref, ctx.peer_address.clone(), key.role.is_initiator(), piggyback)
        };

        let result = self
            .send_message_reserved(key, protocol_id, session_ref, peer_address, is_initiator, piggyback_ack, opcode, payload, reliable)
            .await;

        if reliable && result.is_err() {
            if let Some(ctx) = self.0.exchanges.lock().unwrap().get_mut(&key) {
                ctx.reserving_retransmit = false;
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_message_reserved(
        &self,
        key: ExchangeKey,
        protocol_id: u16,
        session_ref: u64,
        peer_address: PeerAddress,
        is_initiator: bool,
        piggyback_ack: Option<u32>,
        opcode: u8,
        payload: &[u8],
        reliable: bool,
    ) -> Result<()> {
        if piggyback_ack.is_some() {
            self.0.ack_table.mark_acked(key);
        }

        let session = self.session_by_ref(session_ref).ok_or(ExchangeError::SessionNotFound)?;

        let header = ProtocolHeader {
            flags: ExchangeFlags::new(is_initiator, piggyback_ack.is_some(), reliable, false),
            opcode,
            exchange_id: key.exchange_id,
            protocol_id,
            vendor_id: None,
            ack_counter: piggyback_ack,
        };

        let encoded = session.encrypt(&header, payload, false)?;
        self.0.transport.send(&encoded, &peer_address).await?;

        if reliable {
            let counter = session.last_assigned_counter();
            let base_interval = session.timing_parameters().base_interval(session.is_peer_active());
            let mgr = self.clone();
            self.0.retransmit_table.add(key, counter, encoded, peer_address, base_interval, move || {
                let mgr = mgr.clone();
                async move { mgr.on_retransmit_timer(key, counter).await }
            })?;
            if let Some(ctx) = self.0.exchanges.lock().unwrap().get_mut(&key) {
                ctx.pending_retransmit = Some(counter);
                ctx.reserving_retransmit = false;
            }
        }

        Ok(())
    }

    async fn on_retransmit_timer(&self, key: ExchangeKey, counter: u32) {
        let session_ref = {
            let exchanges = self.0.exchanges.lock().unwrap();
            match exchanges.get(&key) {
                Some(ctx) => ctx.session_ref,
                None => return,
            }
        };
        let Some(session) = self.session_by_ref(session_ref) else {
            return;
        };
        let base_interval = session.timing_parameters().base_interval(session.is_peer_active());

        match self.0.retransmit_table.schedule_retransmit(counter, base_interval) {
            Some(RetransmitOutcome::Retransmit { encoded, peer_address }) => {
                log::trace!("retransmitting counter {counter} on exchange {key:?}");
                if let Err(e) = self.0.transport.send(&encoded, &peer_address).await {
                    log::warn!("retransmit send failed: {e}");
                }
            }
            Some(RetransmitOutcome::Exhausted) => {
                log::debug!("retransmission exhausted for exchange {key:?}");
                self.on_retransmit_exhausted(key).await;
            }
            None => {}
        }
    }

    async fn on_retransmit_exhausted(&self, key: ExchangeKey) {
        let should_remove = {
            let mut exchanges = self.0.exchanges.lock().unwrap();
            match exchanges.get_mut(&key) {
                Some(ctx) => {
                    ctx.pending_retransmit = None;
                    ctx.state = ExchangeState::Closed;
                    true
                }
                None => false,
            }
        };
        if should_remove {
            self.remove_exchange(key).await;
        }
    }

    async fn on_ack_received(&self, key: ExchangeKey) {
        let should_close = {
            let mut exchanges = self.0.exchanges.lock().unwrap();
            match exchanges.get_mut(&key) {
                Some(ctx) => {
                    ctx.pending_retransmit = None;
                    ctx.state == ExchangeState::Closing
                }
                None => false,
            }
        };
        if should_close {
            self.remove_exchange(key).await;
        }
    }

    /// Idempotent close (spec §4.4 `close()`).
    pub async fn close_exchange(&self, key: ExchangeKey) -> Result<()> {
        let (pending_ack, has_outstanding_send) = {
            let mut exchanges = self.0.exchanges.lock().unwrap();
            let Some(ctx) = exchanges.get_mut(&key) else {
                return Ok(());
            };
            if ctx.state == ExchangeState::Closed {
                return Ok(());
            }
            ctx.state = ExchangeState::Closing;
            (ctx.pending_ack.take(), ctx.pending_retransmit.is_some() || ctx.reserving_retransmit)
        };

        if let Some(counter) = pending_ack {
            self.emit_standalone_ack(key, counter).await;
            self.0.ack_table.mark_standalone_ack_sent(key);
        }

        if !has_outstanding_send {
            if let Some(ctx) = self.0.exchanges.lock().unwrap().get_mut(&key) {
                ctx.state = ExchangeState::Closed;
            }
            self.remove_exchange(key).await;
        }
        Ok(())
    }

    async fn remove_exchange(&self, key: ExchangeKey) {
        self.0.ack_table.remove(key);
        self.0.retransmit_table.remove(key);
        let removed = self.0.exchanges.lock().unwrap().remove(&key);
        if let Some(ctx) = removed {
            if let Some(delegate) = ctx.delegate {
                delegate.on_close(key);
            }
        }
    }

    /// Owed-ack bookkeeping shared by the existing-exchange and unsolicited
    /// receive paths (spec §4.5 "Ack scheduling").
    async fn schedule_ack(&self, key: ExchangeKey, counter: u32) {
        {
            let mut exchanges = self.0.exchanges.lock().unwrap();
            if let Some(ctx) = exchanges.get_mut(&key) {
                ctx.pending_ack = Some(counter);
            }
        }

        let mgr = self.clone();
        let displaced = self.0.ack_table.add(key, counter, move || {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.emit_standalone_ack(key, counter).await;
                mgr.0.ack_table.mark_standalone_ack_sent(key);
            });
        });

        if let Some(displaced) = displaced {
            self.emit_standalone_ack(key, displaced.counter).await;
            self.0.ack_table.mark_standalone_ack_sent(key);
        }
    }

    /// Standalone ack on a registered exchange (spec §4.5 "Standalone ack
    /// emission").
    async fn emit_standalone_ack(&self, key: ExchangeKey, counter: u32) {
        let (session_ref, peer_address) = {
            let exchanges = self.0.exchanges.lock().unwrap();
            match exchanges.get(&key) {
                Some(ctx) => (ctx.session_ref, ctx.peer_address.clone()),
                None => return,
            }
        };
        let Some(session) = self.session_by_ref(session_ref) else {
            return;
        };
        self.encrypt_and_send_standalone_ack(&session, &peer_address, key.exchange_id, key.role.is_initiator(), counter)
            .await;
    }

    /// Standalone ack for a message that doesn't (and won't) have an
    /// exchange of its own (spec §9 "ephemeral exchange for unsolicited
    /// standalone acks"): a stateless send, not a zero-lifetime context.
    async fn emit_ephemeral_standalone_ack(
        &self,
        session: &Arc<dyn Session>,
        peer_address: &PeerAddress,
        exchange_id: u16,
        counter: u32,
    ) {
        self.encrypt_and_send_standalone_ack(session, peer_address, exchange_id, false, counter).await;
    }

    async fn encrypt_and_send_standalone_ack(
        &self,
        session: &Arc<dyn Session>,
        peer_address: &PeerAddress,
        exchange_id: u16,
        is_initiator: bool,
        counter: u32,
    ) {
        let header = ProtocolHeader::standalone_ack(exchange_id, is_initiator, counter);
        match session.encrypt(&header, &[], false) {
            Ok(encoded) => {
                if let Err(e) = self.0.transport.send(&encoded, peer_address).await {
                    log::warn!("standalone ack send failed: {e}");
                }
            }
            Err(e) => log::warn!("standalone ack encrypt failed: {e}"),
        }
    }

    /// Receive path (spec §4.5 "Receive path").
    pub async fn on_message_received(&self, raw: &[u8], peer_address: PeerAddress) -> Result<()> {
        let (msg_header, _) =
            crate::messages::MessageHeader::decode(raw).map_err(|e| ExchangeError::InvalidMessage(e.to_string()))?;

        let (session, session_ref) = if msg_header.session_id == 0 {
            let node_id = msg_header
                .source_node_id
                .as_deref()
                .ok_or_else(|| ExchangeError::InvalidMessage("unsecured message missing source node id".into()))?;
            let mut key = [0u8; 8];
            key.copy_from_slice(node_id);
            self.get_or_create_unsecured_session(key)
        } else {
            let session_ref = *self
                .0
                .secure_by_local_id
                .lock()
                .unwrap()
                .get(&msg_header.session_id)
                .ok_or(ExchangeError::SessionNotFound)?;
            (self.session_by_ref(session_ref).ok_or(ExchangeError::SessionNotFound)?, session_ref)
        };

        if msg_header.session_id == 0 && !session.check_and_accept_counter(msg_header.message_counter) {
            return Err(ExchangeError::DuplicateMessage(msg_header.message_counter));
        }

        let plaintext = session.decrypt(raw).map_err(|e| ExchangeError::Decrypt(e.to_string()))?;
        let (header, payload) =
            ProtocolHeader::decode(&plaintext).map_err(|e| ExchangeError::InvalidMessage(e.to_string()))?;

        let our_role = Role::complementary(header.flags.is_initiator());
        let key = ExchangeKey {
            local_session_id: msg_header.session_id,
            exchange_id: header.exchange_id,
            role: our_role,
        };

        if header.flags.has_ack() {
            if let Some(ack_counter) = header.ack_counter {
                if let Some(entry) = self.0.retransmit_table.ack(ack_counter) {
                    self.on_ack_received(entry.key).await;
                }
            }
        }

        if header.is_standalone_ack() {
            return Ok(());
        }

        let exists = self.0.exchanges.lock().unwrap().contains_key(&key);
        if !exists {
            return self
                .handle_unsolicited(key, header, payload, peer_address, session, session_ref, msg_header.message_counter)
                .await;
        }

        if header.flags.is_reliable() {
            self.schedule_ack(key, msg_header.message_counter).await;
        }

        let delegate = {
            let exchanges = self.0.exchanges.lock().unwrap();
            exchanges.get(&key).and_then(|ctx| ctx.delegate.clone())
        };

        let response = delegate.and_then(|delegate| delegate.on_message(&Exchange::new(self.clone(), key), &header, &payload));

        if let Some(response) = response {
            self.send_message(key, header.opcode, &response, true).await?;
        }

        Ok(())
    }

    /// Unsolicited path (spec §4.5 "Unsolicited handling").
    #[allow(clippy::too_many_arguments)]
    async fn handle_unsolicited(
        &self,
        key: ExchangeKey,
        header: ProtocolHeader,
        payload: Vec<u8>,
        peer_address: PeerAddress,
        session: Arc<dyn Session>,
        session_ref: u64,
        counter: u32,
    ) -> Result<()> {
        if !header.flags.is_initiator() {
            if header.flags.is_reliable() {
                self.emit_ephemeral_standalone_ack(&session, &peer_address, header.exchange_id, counter).await;
            }
            return Err(ExchangeError::UnsolicitedNotInitiator);
        }

        let handler = self.0.handlers.lock().unwrap().get(&header.protocol_id).cloned();
        let Some(handler) = handler else {
            if header.flags.is_reliable() {
                self.emit_ephemeral_standalone_ack(&session, &peer_address, header.exchange_id, counter).await;
            }
            return Err(ExchangeError::NoHandler(header.protocol_id));
        };

        {
            let mut exchanges = self.0.exchanges.lock().unwrap();
            if exchanges.len() >= self.0.config.max_concurrent_exchanges {
                drop(exchanges);
                if header.flags.is_reliable() {
                    self.emit_ephemeral_standalone_ack(&session, &peer_address, header.exchange_id, counter).await;
                }
                return Err(ExchangeError::TooManyExchanges);
            }
            exchanges.insert(
                key,
                ExchangeContext::new(key, header.protocol_id, session_ref, peer_address, None),
            );
        }

        if header.flags.is_reliable() {
            self.schedule_ack(key, counter).await;
        }

        let exchange = Exchange::new(self.clone(), key);
        match handler.on_unsolicited(&exchange, &header, &payload) {
            Ok(Some(response)) => self.send_message(key, header.opcode, &response, true).await,
            Ok(None) => Ok(()),
            Err(e) => {
                self.remove_exchange(key).await;
                Err(e)
            }
        }
    }

    /// Drains all tables and the exchange index. Used for an unsecured or
    /// exhausted session that must force cleanup (spec §5 "Cancellation and
    /// timeouts").
    pub fn shutdown(&self) {
        self.0.ack_table.clear();
        self.0.retransmit_table.clear();
        self.0.exchanges.lock().unwrap().clear();
    }

    pub fn has_exchange(&self, key: ExchangeKey) -> bool {
        self.0.exchanges.lock().unwrap().contains_key(&key)
    }

    pub fn exchange_state(&self, key: ExchangeKey) -> Option<ExchangeState> {
        self.0.exchanges.lock().unwrap().get(&key).map(|ctx| ctx.state)
    }

    pub fn has_pending_retransmit(&self, key: ExchangeKey) -> bool {
        self.0
            .exchanges
            .lock()
            .unwrap()
            .get(&key)
            .is_some_and(|ctx| ctx.pending_retransmit.is_some())
    }
}
