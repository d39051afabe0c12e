//! Error taxonomy for the exchange and reliability core (spec §7).
//!
//! The receive path never surfaces these upward: it drops or emits a
//! standalone ack and logs. Only the send path and initiator-side exchange
//! creation return these to callers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("exchange is closed")]
    ExchangeClosed,

    #[error("exchange is closing, new sends are refused")]
    ExchangeClosing,

    #[error("a reliable message is already outstanding on this exchange")]
    PendingRetransmit,

    #[error("exchange id collision after exhausting the id space")]
    ExchangeExists,

    #[error("no exchange matches this key")]
    ExchangeNotFound,

    #[error("no session matches this session id")]
    SessionNotFound,

    #[error("no handler registered for protocol id {0}")]
    NoHandler(u16),

    #[error("malformed or incomplete message: {0}")]
    InvalidMessage(String),

    #[error("unsolicited message did not set the initiator flag")]
    UnsolicitedNotInitiator,

    #[error("duplicate message counter {0}, dropped")]
    DuplicateMessage(u32),

    #[error("retransmission exhausted after {0} attempts")]
    MaxRetransmits(u8),

    #[error("session decrypt failed: {0}")]
    Decrypt(String),

    #[error("transport send failed: {0}")]
    Transport(#[from] std::io::Error),

    #[error("too many concurrent exchanges on this session")]
    TooManyExchanges,
}

pub type Result<T> = std::result::Result<T, ExchangeError>;
