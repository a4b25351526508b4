//! Broker-wide error taxonomy.

use std::io;

use thiserror::Error;

use crate::storage::StorageError;

/// Errors raised by the broker core.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] mqtrie_core::ProtocolError),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Connection is not connected")]
    NotConnected,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Connection closed")]
    ConnClosed,

    #[error("Heartbeat expired")]
    HeartbeatExpired,

    #[error("Broker is shutting down")]
    Shutdown,

    #[error("SSID not found")]
    SsidNotFound,

    #[error("Subscriber not found")]
    SubscriberNotFound,

    #[error("No message ID available")]
    NoMessageIdAvailable,

    #[error("Publisher username does not match connection")]
    MismatchUsername,

    #[error("Publisher client id does not match connection")]
    MismatchClientId,

    #[error("Payload topic does not match packet topic")]
    MismatchTopic,

    #[error("Payload QoS does not match packet QoS")]
    MismatchQoS,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<mqtrie_core::Error> for BrokerError {
    fn from(e: mqtrie_core::Error) -> Self {
        match e {
            mqtrie_core::Error::Io(e) => BrokerError::Io(e),
            mqtrie_core::Error::Protocol(e) => BrokerError::Protocol(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
