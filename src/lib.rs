//! Exchange multiplexing and Message Reliability Protocol core for a
//! Matter-style fabric node.
//!
//! See `exchange_mgr::ExchangeManager` for the entry point.

pub mod ack_table;
pub mod backoff;
pub mod config;
pub mod error;
pub mod exchange;
pub mod exchange_mgr;
pub mod messages;
pub mod protocol;
pub mod retransmit_table;
pub mod session;
pub mod transport;
pub mod util;

pub use error::{ExchangeError, Result};
pub use exchange::{Exchange, ExchangeDelegate, ExchangeKey, ExchangeState, Role};
pub use exchange_mgr::{ExchangeManager, ProtocolHandler};
