//! Concurrent subscription trie with MQTT wildcard matching.
//!
//! The trie indexes subscribers by SSID. Each node carries one lock guarding
//! both its child map and its subscriber set, so unrelated paths never
//! serialize. Readers descend with read locks; writers upgrade per node with
//! a double-check for the benign create race.

use std::sync::{Arc, Weak};

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::error::{BrokerError, Result};
use crate::message::Message;
use crate::topic::{MULTI_WILDCARD_HASH, SINGLE_WILDCARD_HASH};

/// Location of a subscriber node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberKind {
    Local,
    /// A peer-node subscriber; the interface is the same.
    #[allow(dead_code)]
    Remote,
}

/// A subscriber capability: a stable id, a kind tag, and message delivery.
///
/// Connections are the local implementation; a remote peer node would expose
/// the same surface.
pub trait Subscriber: Send + Sync {
    fn id(&self) -> u64;
    fn kind(&self) -> SubscriberKind;
    fn send_message(&self, msg: &Message) -> Result<()>;
}

/// A set of subscribers keyed by subscriber id.
#[derive(Default, Clone)]
pub struct Subscribers(AHashMap<u64, Arc<dyn Subscriber>>);

impl Subscribers {
    fn new() -> Self {
        Self::default()
    }

    /// Merge another set into this one; duplicates across paths collapse.
    fn merge(&mut self, from: &Subscribers) {
        for (id, sub) in &from.0 {
            self.0.entry(*id).or_insert_with(|| Arc::clone(sub));
        }
    }

    /// Insert a subscriber. Returns false if the id was already present.
    fn add(&mut self, subscriber: Arc<dyn Subscriber>) -> bool {
        let id = subscriber.id();
        if self.0.contains_key(&id) {
            return false;
        }
        self.0.insert(id, subscriber);
        true
    }

    /// Remove a subscriber by id. Returns false if it was absent.
    fn remove(&mut self, id: u64) -> bool {
        self.0.remove(&id).is_some()
    }

    #[allow(dead_code)] // Used in tests
    pub fn contains(&self, id: u64) -> bool {
        self.0.contains_key(&id)
    }

    #[allow(dead_code)] // Used in tests
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Subscriber>> {
        self.0.values()
    }
}

struct NodeInner {
    children: AHashMap<u64, Arc<Node>>,
    subs: Subscribers,
}

impl NodeInner {
    fn is_orphanable(&self) -> bool {
        self.subs.is_empty() && self.children.is_empty()
    }
}

/// One trie node; word is 0 at the root.
struct Node {
    word: u64,
    parent: Weak<Node>,
    inner: RwLock<NodeInner>,
}

impl Node {
    fn new(word: u64, parent: Weak<Node>) -> Arc<Node> {
        Arc::new(Node {
            word,
            parent,
            inner: RwLock::new(NodeInner {
                children: AHashMap::new(),
                subs: Subscribers::new(),
            }),
        })
    }
}

/// The subscription trie.
pub struct SubTrie {
    root: Arc<Node>,
}

impl SubTrie {
    pub fn new() -> Self {
        Self {
            root: Node::new(0, Weak::new()),
        }
    }

    /// Subscribe on an SSID path, creating nodes as needed. Idempotent for
    /// the same `(ssid, subscriber.id())` pair.
    pub fn subscribe(&self, ssid: &[u64], subscriber: Arc<dyn Subscriber>) -> Result<()> {
        let mut curr = Arc::clone(&self.root);
        for &word in ssid {
            let existing = curr.inner.read().children.get(&word).cloned();
            let child = match existing {
                Some(child) => child,
                None => {
                    let mut inner = curr.inner.write();
                    // Double check: another writer may have created the
                    // child between dropping the read lock and taking this
                    // write lock.
                    match inner.children.get(&word) {
                        Some(child) => Arc::clone(child),
                        None => {
                            let child = Node::new(word, Arc::downgrade(&curr));
                            inner.children.insert(word, Arc::clone(&child));
                            child
                        }
                    }
                }
            };
            curr = child;
        }

        curr.inner.write().subs.add(subscriber);
        Ok(())
    }

    /// Remove a subscriber from an SSID path. Fails fast with `SsidNotFound`
    /// if any segment is missing, `SubscriberNotFound` if the terminal node
    /// does not hold the subscriber. Empty nodes are detached afterwards.
    pub fn unsubscribe(&self, ssid: &[u64], subscriber_id: u64) -> Result<()> {
        let mut curr = Arc::clone(&self.root);
        for &word in ssid {
            let child = curr
                .inner
                .read()
                .children
                .get(&word)
                .cloned()
                .ok_or(BrokerError::SsidNotFound)?;
            curr = child;
        }

        let orphanable = {
            let mut inner = curr.inner.write();
            if !inner.subs.remove(subscriber_id) {
                return Err(BrokerError::SubscriberNotFound);
            }
            inner.is_orphanable()
        };

        if orphanable {
            Self::orphan(curr);
        }
        Ok(())
    }

    /// Detach `node` from its parent, then walk up detaching ancestors that
    /// became empty. Locks are taken parent-first and each level is released
    /// before moving up, so the walk never inverts against descending
    /// lookups. A concurrent subscribe that re-populated the node aborts the
    /// unlink; an insert landing after the unlink loses only a subscription
    /// that was racing a full teardown of its path.
    fn orphan(mut node: Arc<Node>) {
        loop {
            let Some(parent) = node.parent.upgrade() else {
                // The root is never orphaned.
                return;
            };

            let parent_orphanable = {
                let mut parent_inner = parent.inner.write();
                if !node.inner.read().is_orphanable() {
                    return;
                }
                parent_inner.children.remove(&node.word);
                parent_inner.is_orphanable()
            };

            if !parent_orphanable {
                return;
            }
            node = parent;
        }
    }

    /// Collect the union of subscribers on every path matching the queried
    /// SSID under MQTT wildcard semantics.
    pub fn lookup(&self, ssid: &[u64]) -> Subscribers {
        let mut subs = Subscribers::new();
        Self::do_lookup(&self.root, ssid, &mut subs);
        subs
    }

    fn do_lookup(node: &Arc<Node>, query: &[u64], subs: &mut Subscribers) {
        let inner = node.inner.read();
        if query.is_empty() {
            subs.merge(&inner.subs);
            return;
        }

        // A multi-wildcard child swallows the rest of the query.
        if let Some(mw_node) = inner.children.get(&*MULTI_WILDCARD_HASH) {
            subs.merge(&mw_node.inner.read().subs);
        }

        if let Some(sw_node) = inner.children.get(&*SINGLE_WILDCARD_HASH) {
            Self::do_lookup(sw_node, &query[1..], subs);
        }

        if let Some(match_node) = inner.children.get(&query[0]) {
            Self::do_lookup(match_node, &query[1..], subs);
        }
    }

    /// Whether a node exists at the given SSID path (diagnostics and tests).
    #[allow(dead_code)]
    pub fn node_exists(&self, ssid: &[u64]) -> bool {
        let mut curr = Arc::clone(&self.root);
        for word in ssid {
            let child = curr.inner.read().children.get(word).cloned();
            match child {
                Some(child) => curr = child,
                None => return false,
            }
        }
        true
    }
}

impl Default for SubTrie {
    fn default() -> Self {
        Self::new()
    }
}
