//! Storage provider contracts.
//!
//! The broker core persists messages and subscriptions and draws per-topic
//! sequence numbers through these traits. Each provider is selected by name
//! from the configuration and configured with a string map.

mod fjall;
mod memory;

pub use self::fjall::{FjallMessageStore, FjallSequenceGenerator, FjallSubscriptionStore};
pub use self::memory::{MemoryMessageStore, MemorySequenceGenerator, MemorySubscriptionStore};

use std::collections::HashMap;

use thiserror::Error;

use crate::config::ProviderInfo;
use crate::hash;
use crate::message::Message;
use crate::topic::{Parser, Part, Topic};

/// Errors raised by storage providers.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("missing provider option '{0}'")]
    MissingOption(&'static str),

    #[error("failed to open storage: {0}")]
    Open(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("invalid query topic: {0}")]
    InvalidQueryTopic(String),
}

/// Configuration surface shared by all providers.
pub trait Provider {
    /// Provider name used for selection at start-up.
    fn name(&self) -> &'static str;

    /// Apply the provider's config map. Called once before first use.
    fn configure(&mut self, options: &HashMap<String, String>) -> Result<(), StorageError>;
}

/// Filters for `MessageStore::query_message`.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Topic filter; wildcards permitted. `None` matches every topic.
    pub topic: Option<String>,
    /// Publisher username equality filter.
    pub username: Option<String>,
    /// Sequence window (inclusive from, exclusive until).
    pub from_seq: Option<i64>,
    pub until_seq: Option<i64>,
    /// Creation-time window in nanoseconds (inclusive from, exclusive until).
    pub from_ns: Option<i64>,
    pub until_ns: Option<i64>,
    /// Message type tag equality filter.
    pub message_type: Option<String>,
    /// Result window; a limit of 0 means unlimited.
    pub limit: u64,
    pub offset: u64,
}

/// Durable store for published messages.
pub trait MessageStore: Provider + Send + Sync {
    /// Persist a fully-populated message.
    fn store_message(&self, msg: &Message) -> Result<(), StorageError>;

    /// Range/filter query over stored messages.
    fn query_message(&self, opts: &QueryOptions) -> Result<Vec<Message>, StorageError>;

    fn close(&self) -> Result<(), StorageError>;
}

/// Durable store for subscriptions.
pub trait SubscriptionStore: Provider + Send + Sync {
    fn store_subscription(&self, client_id: &str, topic: &Topic) -> Result<(), StorageError>;

    fn delete_subscription(&self, client_id: &str, topic: &Topic) -> Result<(), StorageError>;

    fn close(&self) -> Result<(), StorageError>;
}

/// Generator of monotonic per-topic message sequence numbers. Gaps are
/// permitted; strict monotonicity across restarts is advised, not required.
pub trait SequenceGenerator: Provider + Send + Sync {
    fn gen_message_seq(&self, topic: &Topic) -> Result<i64, StorageError>;

    fn close(&self) -> Result<(), StorageError>;
}

/// The sequence key for a topic: its SSID words stringified and joined.
pub fn seq_key(topic: &Topic) -> String {
    let ssid = topic.to_ssid();
    let parts: Vec<String> = ssid.iter().map(|w| w.to_string()).collect();
    parts.join("/")
}

/// Select and configure a message store by provider name.
pub fn load_message_store(info: &ProviderInfo) -> Result<Box<dyn MessageStore>, StorageError> {
    let mut store: Box<dyn MessageStore> = match info.provider.as_str() {
        "memory" => Box::new(MemoryMessageStore::new()),
        "fjall" => Box::new(FjallMessageStore::new()),
        other => return Err(StorageError::UnknownProvider(other.to_string())),
    };
    store.configure(&info.config)?;
    Ok(store)
}

/// Select and configure a subscription store by provider name.
pub fn load_subscription_store(
    info: &ProviderInfo,
) -> Result<Box<dyn SubscriptionStore>, StorageError> {
    let mut store: Box<dyn SubscriptionStore> = match info.provider.as_str() {
        "memory" => Box::new(MemorySubscriptionStore::new()),
        "fjall" => Box::new(FjallSubscriptionStore::new()),
        other => return Err(StorageError::UnknownProvider(other.to_string())),
    };
    store.configure(&info.config)?;
    Ok(store)
}

/// Select and configure a sequence generator by provider name.
pub fn load_sequence_generator(
    info: &ProviderInfo,
) -> Result<Box<dyn SequenceGenerator>, StorageError> {
    let mut gen: Box<dyn SequenceGenerator> = match info.provider.as_str() {
        "memory" => Box::new(MemorySequenceGenerator::new()),
        "fjall" => Box::new(FjallSequenceGenerator::new()),
        other => return Err(StorageError::UnknownProvider(other.to_string())),
    };
    gen.configure(&info.config)?;
    Ok(gen)
}

/// SSID predicate compiled from a query topic filter.
///
/// Literal segments constrain the SSID word at their position, `+` skips its
/// position, and a trailing `#` relaxes the length equality to `>`.
#[derive(Debug, Clone)]
pub struct SsidFilter {
    positions: Vec<Option<u64>>,
    open_ended: bool,
}

impl SsidFilter {
    /// Compile a topic filter string. Static and wildcard topics are both
    /// accepted.
    pub fn compile(topic: &str) -> Result<Self, StorageError> {
        let parsed = Parser::new(topic)
            .parse()
            .map_err(|e| StorageError::InvalidQueryTopic(e.to_string()))?;
        Ok(Self::from_topic(&parsed))
    }

    pub fn from_topic(topic: &Topic) -> Self {
        let mut positions = Vec::new();
        let mut open_ended = false;
        for part in topic.parts() {
            match part {
                Part::Name(name) => positions.push(Some(hash::sum64(name.as_bytes()))),
                Part::SingleWildcard => positions.push(None),
                Part::MultiWildcard => {
                    open_ended = true;
                    break;
                }
            }
        }
        Self {
            positions,
            open_ended,
        }
    }

    /// Whether a stored SSID satisfies the filter.
    pub fn matches(&self, ssid: &[u64]) -> bool {
        if self.open_ended {
            if ssid.len() <= self.positions.len() {
                return false;
            }
        } else if ssid.len() != self.positions.len() {
            return false;
        }

        self.positions
            .iter()
            .zip(ssid)
            .all(|(want, got)| match want {
                Some(word) => word == got,
                None => true,
            })
    }
}

/// Apply all non-topic query predicates to a stored message.
pub(crate) fn matches_query(msg: &Message, filter: Option<&SsidFilter>, opts: &QueryOptions) -> bool {
    if let Some(filter) = filter {
        if !filter.matches(&msg.ssid) {
            return false;
        }
    }
    if let Some(ref username) = opts.username {
        if &msg.username != username {
            return false;
        }
    }
    if let Some(from_seq) = opts.from_seq {
        if msg.message_seq < from_seq {
            return false;
        }
    }
    if let Some(until_seq) = opts.until_seq {
        if msg.message_seq >= until_seq {
            return false;
        }
    }
    if let Some(from_ns) = opts.from_ns {
        if msg.created_at < from_ns {
            return false;
        }
    }
    if let Some(until_ns) = opts.until_ns {
        if msg.created_at >= until_ns {
            return false;
        }
    }
    if let Some(ref message_type) = opts.message_type {
        if &msg.message_type != message_type {
            return false;
        }
    }
    true
}

/// Apply limit/offset after sorting by sequence then creation time.
pub(crate) fn window_results(mut found: Vec<Message>, opts: &QueryOptions) -> Vec<Message> {
    found.sort_by(|a, b| {
        (a.message_seq, a.created_at).cmp(&(b.message_seq, b.created_at))
    });
    let offset = opts.offset as usize;
    if offset >= found.len() {
        return Vec::new();
    }
    let mut found = found.split_off(offset);
    if opts.limit > 0 {
        found.truncate(opts.limit as usize);
    }
    found
}
