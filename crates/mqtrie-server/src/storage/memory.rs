//! In-memory storage providers.
//!
//! Default providers for development and tests; they implement the full
//! contracts with no durability.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::message::Message;
use crate::topic::Topic;

use super::{
    matches_query, seq_key, window_results, MessageStore, Provider, QueryOptions,
    SequenceGenerator, SsidFilter, StorageError, SubscriptionStore,
};

/// In-memory message store.
pub struct MemoryMessageStore {
    messages: Mutex<Vec<Message>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
        }
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for MemoryMessageStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn configure(&mut self, _options: &HashMap<String, String>) -> Result<(), StorageError> {
        Ok(())
    }
}

impl MessageStore for MemoryMessageStore {
    fn store_message(&self, msg: &Message) -> Result<(), StorageError> {
        self.messages.lock().push(msg.clone());
        Ok(())
    }

    fn query_message(&self, opts: &QueryOptions) -> Result<Vec<Message>, StorageError> {
        let filter = match opts.topic {
            Some(ref topic) => Some(SsidFilter::compile(topic)?),
            None => None,
        };
        let found: Vec<Message> = self
            .messages
            .lock()
            .iter()
            .filter(|m| matches_query(m, filter.as_ref(), opts))
            .cloned()
            .collect();
        Ok(window_results(found, opts))
    }

    fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// In-memory subscription store, keyed by (client id, topic name).
pub struct MemorySubscriptionStore {
    subscriptions: Mutex<HashMap<(String, String), String>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Number of stored subscriptions (diagnostics and tests).
    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemorySubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for MemorySubscriptionStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn configure(&mut self, _options: &HashMap<String, String>) -> Result<(), StorageError> {
        Ok(())
    }
}

impl SubscriptionStore for MemorySubscriptionStore {
    fn store_subscription(&self, client_id: &str, topic: &Topic) -> Result<(), StorageError> {
        self.subscriptions.lock().insert(
            (client_id.to_string(), topic.topic_name().to_string()),
            seq_key(topic),
        );
        Ok(())
    }

    fn delete_subscription(&self, client_id: &str, topic: &Topic) -> Result<(), StorageError> {
        self.subscriptions
            .lock()
            .remove(&(client_id.to_string(), topic.topic_name().to_string()));
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// In-memory sequence generator: one counter per topic key.
pub struct MemorySequenceGenerator {
    counters: Mutex<HashMap<String, i64>>,
}

impl MemorySequenceGenerator {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemorySequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for MemorySequenceGenerator {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn configure(&mut self, _options: &HashMap<String, String>) -> Result<(), StorageError> {
        Ok(())
    }
}

impl SequenceGenerator for MemorySequenceGenerator {
    fn gen_message_seq(&self, topic: &Topic) -> Result<i64, StorageError> {
        let key = seq_key(topic);
        let mut counters = self.counters.lock();
        let seq = counters.entry(key).or_insert(0);
        *seq += 1;
        Ok(*seq)
    }

    fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
