//! Durable storage providers backed by fjall.
//!
//! fjall is an LSM-tree embedded database; each provider owns its own
//! database directory (the `path` option) with one keyspace. Values are
//! bincode-serialized. Queries scan and filter, which is adequate for the
//! admin/query surface this backs.

use std::collections::HashMap;

use fjall::{Database, Keyspace, KeyspaceCreateOptions, PersistMode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::topic::Topic;

use super::{
    matches_query, seq_key, window_results, MessageStore, Provider, QueryOptions,
    SequenceGenerator, SsidFilter, StorageError, SubscriptionStore,
};

/// Key separator for composite keys. Topic names cannot contain NUL.
const KEY_SEP: u8 = 0;

struct Handle {
    #[allow(dead_code)] // Kept alive to maintain the database handle.
    db: Database,
    keyspace: Keyspace,
}

fn open_handle(
    options: &HashMap<String, String>,
    keyspace_name: &str,
) -> Result<Handle, StorageError> {
    let path = options
        .get("path")
        .ok_or(StorageError::MissingOption("path"))?;

    let db = Database::builder(path)
        .open()
        .map_err(|e| StorageError::Open(e.to_string()))?;

    let keyspace = db
        .keyspace(keyspace_name, KeyspaceCreateOptions::default)
        .map_err(|e| StorageError::Open(e.to_string()))?;

    log::info!("fjall keyspace '{}' opened at {}", keyspace_name, path);
    Ok(Handle { db, keyspace })
}

impl Handle {
    fn sync(&self) -> Result<(), StorageError> {
        self.db
            .persist(PersistMode::SyncAll)
            .map_err(|e| StorageError::Write(e.to_string()))
    }

    /// Collect every value in the keyspace (guards consume themselves on
    /// access, so keys are gathered first).
    fn scan_values(&self) -> Result<Vec<Vec<u8>>, StorageError> {
        let keys: Vec<_> = self
            .keyspace
            .iter()
            .filter_map(|kv| kv.key().ok())
            .collect();

        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            match self.keyspace.get(&key) {
                Ok(Some(value)) => values.push(value.to_vec()),
                Ok(None) => continue, // Deleted between iter and get.
                Err(e) => return Err(StorageError::Read(e.to_string())),
            }
        }
        Ok(values)
    }
}

/// Message store on a fjall keyspace, keyed by message GUID.
pub struct FjallMessageStore {
    handle: Option<Handle>,
}

impl FjallMessageStore {
    pub fn new() -> Self {
        Self { handle: None }
    }

    fn handle(&self) -> Result<&Handle, StorageError> {
        self.handle
            .as_ref()
            .ok_or_else(|| StorageError::Open("provider not configured".into()))
    }
}

impl Default for FjallMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for FjallMessageStore {
    fn name(&self) -> &'static str {
        "fjall"
    }

    fn configure(&mut self, options: &HashMap<String, String>) -> Result<(), StorageError> {
        self.handle = Some(open_handle(options, "message")?);
        Ok(())
    }
}

impl MessageStore for FjallMessageStore {
    fn store_message(&self, msg: &Message) -> Result<(), StorageError> {
        let handle = self.handle()?;
        let value =
            bincode::serialize(msg).map_err(|e| StorageError::Serialize(e.to_string()))?;
        handle
            .keyspace
            .insert(msg.guid.as_bytes(), value)
            .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(())
    }

    fn query_message(&self, opts: &QueryOptions) -> Result<Vec<Message>, StorageError> {
        let handle = self.handle()?;
        let filter = match opts.topic {
            Some(ref topic) => Some(SsidFilter::compile(topic)?),
            None => None,
        };

        let mut found = Vec::new();
        for value in handle.scan_values()? {
            let msg: Message = match bincode::deserialize(&value) {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("skipping undecodable stored message: {}", e);
                    continue;
                }
            };
            if matches_query(&msg, filter.as_ref(), opts) {
                found.push(msg);
            }
        }
        Ok(window_results(found, opts))
    }

    fn close(&self) -> Result<(), StorageError> {
        self.handle()?.sync()
    }
}

/// Persisted subscription row: topic string plus its SSID projection.
#[derive(Debug, Serialize, Deserialize)]
struct SubscriptionData {
    client_id: String,
    topic: String,
    ssid: Vec<u64>,
}

/// Subscription store on a fjall keyspace, keyed by (client id, topic).
pub struct FjallSubscriptionStore {
    handle: Option<Handle>,
}

impl FjallSubscriptionStore {
    pub fn new() -> Self {
        Self { handle: None }
    }

    fn handle(&self) -> Result<&Handle, StorageError> {
        self.handle
            .as_ref()
            .ok_or_else(|| StorageError::Open("provider not configured".into()))
    }

    fn key(client_id: &str, topic: &Topic) -> Vec<u8> {
        let mut key = Vec::with_capacity(client_id.len() + 1 + topic.topic_name().len());
        key.extend_from_slice(client_id.as_bytes());
        key.push(KEY_SEP);
        key.extend_from_slice(topic.topic_name().as_bytes());
        key
    }

    /// All stored subscriptions for a client (diagnostics and tests).
    #[allow(dead_code)]
    pub fn subscriptions_for(&self, client_id: &str) -> Result<Vec<String>, StorageError> {
        let handle = self.handle()?;
        let mut topics = Vec::new();
        for value in handle.scan_values()? {
            let data: SubscriptionData = bincode::deserialize(&value)
                .map_err(|e| StorageError::Deserialize(e.to_string()))?;
            if data.client_id == client_id {
                topics.push(data.topic);
            }
        }
        Ok(topics)
    }
}

impl Default for FjallSubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for FjallSubscriptionStore {
    fn name(&self) -> &'static str {
        "fjall"
    }

    fn configure(&mut self, options: &HashMap<String, String>) -> Result<(), StorageError> {
        self.handle = Some(open_handle(options, "subscription")?);
        Ok(())
    }
}

impl SubscriptionStore for FjallSubscriptionStore {
    fn store_subscription(&self, client_id: &str, topic: &Topic) -> Result<(), StorageError> {
        let handle = self.handle()?;
        let data = SubscriptionData {
            client_id: client_id.to_string(),
            topic: topic.topic_name().to_string(),
            ssid: topic.to_ssid(),
        };
        let value =
            bincode::serialize(&data).map_err(|e| StorageError::Serialize(e.to_string()))?;
        handle
            .keyspace
            .insert(Self::key(client_id, topic), value)
            .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(())
    }

    fn delete_subscription(&self, client_id: &str, topic: &Topic) -> Result<(), StorageError> {
        let handle = self.handle()?;
        handle
            .keyspace
            .remove(Self::key(client_id, topic))
            .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        self.handle()?.sync()
    }
}

/// Sequence generator on a fjall keyspace: one big-endian i64 per topic key.
///
/// The mutex serializes read-modify-write; counters survive restarts.
pub struct FjallSequenceGenerator {
    handle: Option<Handle>,
    lock: Mutex<()>,
}

impl FjallSequenceGenerator {
    pub fn new() -> Self {
        Self {
            handle: None,
            lock: Mutex::new(()),
        }
    }

    fn handle(&self) -> Result<&Handle, StorageError> {
        self.handle
            .as_ref()
            .ok_or_else(|| StorageError::Open("provider not configured".into()))
    }
}

impl Default for FjallSequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for FjallSequenceGenerator {
    fn name(&self) -> &'static str {
        "fjall"
    }

    fn configure(&mut self, options: &HashMap<String, String>) -> Result<(), StorageError> {
        self.handle = Some(open_handle(options, "seq")?);
        Ok(())
    }
}

impl SequenceGenerator for FjallSequenceGenerator {
    fn gen_message_seq(&self, topic: &Topic) -> Result<i64, StorageError> {
        let handle = self.handle()?;
        let key = seq_key(topic);

        let _guard = self.lock.lock();
        let current = match handle
            .keyspace
            .get(key.as_bytes())
            .map_err(|e| StorageError::Read(e.to_string()))?
        {
            Some(value) => {
                let bytes: [u8; 8] = value
                    .as_ref()
                    .try_into()
                    .map_err(|_| StorageError::Deserialize("bad sequence value".into()))?;
                i64::from_be_bytes(bytes)
            }
            None => 0,
        };
        let next = current + 1;
        handle
            .keyspace
            .insert(key.as_bytes(), next.to_be_bytes())
            .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(next)
    }

    fn close(&self) -> Result<(), StorageError> {
        self.handle()?.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::Parser;
    use tempfile::tempdir;

    fn options(dir: &tempfile::TempDir) -> HashMap<String, String> {
        let mut options = HashMap::new();
        options.insert(
            "path".to_string(),
            dir.path().to_string_lossy().into_owned(),
        );
        options
    }

    fn message(topic: &str, seq: i64) -> Message {
        let parsed = Parser::new(topic).parse().unwrap();
        let mut msg = Message::new(
            format!("guid-{}", seq),
            "alice".into(),
            "c1".into(),
            parsed.topic_name().to_string(),
            parsed.to_ssid(),
            0,
            None,
            b"payload".to_vec(),
        );
        msg.set_message_seq(seq);
        msg
    }

    #[test]
    fn test_configure_requires_path() {
        let mut store = FjallMessageStore::new();
        assert!(matches!(
            store.configure(&HashMap::new()),
            Err(StorageError::MissingOption("path"))
        ));
    }

    #[test]
    fn test_message_store_roundtrip() {
        let dir = tempdir().unwrap();
        let mut store = FjallMessageStore::new();
        store.configure(&options(&dir)).unwrap();

        store.store_message(&message("a/b", 1)).unwrap();
        store.store_message(&message("a/c", 2)).unwrap();
        store.store_message(&message("b/c", 3)).unwrap();

        let opts = QueryOptions {
            topic: Some("a/+".into()),
            ..Default::default()
        };
        let found = store.query_message(&opts).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].message_seq, 1);
        assert_eq!(found[1].message_seq, 2);

        store.close().unwrap();
    }

    #[test]
    fn test_subscription_store_roundtrip() {
        let dir = tempdir().unwrap();
        let mut store = FjallSubscriptionStore::new();
        store.configure(&options(&dir)).unwrap();

        let t1 = Parser::new("hello/+").parse().unwrap();
        let t2 = Parser::new("hello/#").parse().unwrap();
        store.store_subscription("c1", &t1).unwrap();
        store.store_subscription("c1", &t2).unwrap();
        store.store_subscription("c2", &t1).unwrap();

        let mut topics = store.subscriptions_for("c1").unwrap();
        topics.sort();
        assert_eq!(topics, vec!["hello/#".to_string(), "hello/+".to_string()]);

        store.delete_subscription("c1", &t1).unwrap();
        assert_eq!(store.subscriptions_for("c1").unwrap(), vec!["hello/#"]);

        store.close().unwrap();
    }

    #[test]
    fn test_sequence_generator_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let topic = Parser::new("a/b").parse().unwrap();

        {
            let mut gen = FjallSequenceGenerator::new();
            gen.configure(&options(&dir)).unwrap();
            assert_eq!(gen.gen_message_seq(&topic).unwrap(), 1);
            assert_eq!(gen.gen_message_seq(&topic).unwrap(), 2);
            gen.close().unwrap();
        }

        let mut gen = FjallSequenceGenerator::new();
        gen.configure(&options(&dir)).unwrap();
        assert_eq!(gen.gen_message_seq(&topic).unwrap(), 3);
    }
}
