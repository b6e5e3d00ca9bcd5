//! Kademlia routing table.
//!
//! Contacts are organized into 160 buckets indexed by the length of the
//! shared id prefix with the local node; this is the fully split form of
//! the classic tree, so only the own-id region of the space ever gains
//! depth. Each bucket holds up to K contacts behind its own lock, with a
//! replacement cache of fallback contacts.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use parking_lot::RwLock;
use rats_core::NodeId;

use crate::{K, MAX_CONTACT_FAILURES, QUESTIONABLE_AFTER_SECS};

const NUM_BUCKETS: usize = 160;

/// Quality of a routing table contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactStatus {
    /// Responded recently
    Good,
    /// Silent for 15 minutes
    Questionable,
    /// Failed two consecutive pings; replaceable
    Bad,
}

/// A node known to the routing table.
#[derive(Debug, Clone)]
pub struct Contact {
    /// The contact's DHT identity
    pub id: NodeId,
    /// The contact's UDP endpoint
    pub addr: SocketAddr,
    /// When the contact last responded
    pub last_seen: Instant,
    /// Consecutive failed requests
    pub failures: u8,
}

impl Contact {
    /// Creates a fresh contact, considered good.
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            failures: 0,
        }
    }

    /// Marks a successful response.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.failures = 0;
    }

    /// Marks a failed request.
    pub fn fail(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    /// Returns the contact's current status.
    pub fn status(&self) -> ContactStatus {
        if self.failures >= MAX_CONTACT_FAILURES {
            ContactStatus::Bad
        } else if self.failures > 0
            || self.last_seen.elapsed().as_secs() >= QUESTIONABLE_AFTER_SECS
        {
            ContactStatus::Questionable
        } else {
            ContactStatus::Good
        }
    }
}

/// A single k-bucket.
#[derive(Debug)]
struct Bucket {
    contacts: VecDeque<Contact>,
    replacement_cache: VecDeque<Contact>,
    last_touched: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self {
            contacts: VecDeque::with_capacity(K),
            replacement_cache: VecDeque::with_capacity(K),
            last_touched: Instant::now(),
        }
    }

    /// Inserts or refreshes a contact. Returns true if it is now in the
    /// bucket proper (as opposed to the replacement cache).
    fn insert(&mut self, contact: Contact) -> bool {
        self.last_touched = Instant::now();

        if let Some(pos) = self.contacts.iter().position(|c| c.id == contact.id) {
            let mut existing = self
                .contacts
                .remove(pos)
                .expect("position comes from the same deque");
            existing.touch();
            existing.addr = contact.addr;
            self.contacts.push_back(existing);
            return true;
        }

        if self.contacts.len() < K {
            self.contacts.push_back(contact);
            return true;
        }

        // Full bucket: a bad contact is replaceable, otherwise the new
        // contact waits in the replacement cache.
        if let Some(pos) = self
            .contacts
            .iter()
            .position(|c| c.status() == ContactStatus::Bad)
        {
            self.contacts.remove(pos);
            self.contacts.push_back(contact);
            return true;
        }

        if let Some(pos) = self
            .replacement_cache
            .iter()
            .position(|c| c.id == contact.id)
        {
            self.replacement_cache.remove(pos);
        }
        if self.replacement_cache.len() >= K {
            self.replacement_cache.pop_front();
        }
        self.replacement_cache.push_back(contact);
        false
    }

    fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        let pos = self.contacts.iter().position(|c| &c.id == id)?;
        let removed = self.contacts.remove(pos);
        if let Some(replacement) = self.replacement_cache.pop_front() {
            self.contacts.push_back(replacement);
        }
        removed
    }
}

/// The routing table.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<RwLock<Bucket>>,
}

impl RoutingTable {
    /// Creates an empty table for `local_id`.
    pub fn new(local_id: NodeId) -> Self {
        let buckets = (0..NUM_BUCKETS).map(|_| RwLock::new(Bucket::new())).collect();
        Self { local_id, buckets }
    }

    /// Returns the local node id.
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        if *id == self.local_id {
            return None;
        }
        Some((self.local_id.common_prefix_len(id) as usize).min(NUM_BUCKETS - 1))
    }

    /// Inserts or refreshes a contact. Self-insertion is a no-op.
    pub fn insert(&self, contact: Contact) -> bool {
        match self.bucket_index(&contact.id) {
            Some(index) => self.buckets[index].write().insert(contact),
            None => false,
        }
    }

    /// Removes a contact.
    pub fn remove(&self, id: &NodeId) -> Option<Contact> {
        let index = self.bucket_index(id)?;
        self.buckets[index].write().remove(id)
    }

    /// Looks up a contact by id.
    pub fn get(&self, id: &NodeId) -> Option<Contact> {
        let index = self.bucket_index(id)?;
        self.buckets[index].read().contacts.iter().find(|c| &c.id == id).cloned()
    }

    /// Records a successful response from `id`.
    pub fn touch(&self, id: &NodeId) {
        if let Some(index) = self.bucket_index(id) {
            if let Some(contact) = self.buckets[index]
                .write()
                .contacts
                .iter_mut()
                .find(|c| &c.id == id)
            {
                contact.touch();
            }
        }
    }

    /// Records a failed request to `id`.
    pub fn record_failure(&self, id: &NodeId) {
        if let Some(index) = self.bucket_index(id) {
            if let Some(contact) = self.buckets[index]
                .write()
                .contacts
                .iter_mut()
                .find(|c| &c.id == id)
            {
                contact.fail();
            }
        }
    }

    /// Returns up to `k` contacts closest to `target` by XOR distance.
    pub fn closest(&self, target: &NodeId, k: usize) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = Vec::new();
        for bucket in &self.buckets {
            contacts.extend(bucket.read().contacts.iter().cloned());
        }
        contacts.sort_by(|a, b| {
            target
                .xor_distance(&a.id)
                .cmp(&target.xor_distance(&b.id))
        });
        contacts.truncate(k);
        contacts
    }

    /// Total number of contacts.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.read().contacts.len()).sum()
    }

    /// Returns true when the table holds no contacts.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indexes of buckets untouched for `idle_secs`, with a random id
    /// inside each bucket's range, for refresh lookups.
    pub fn stale_buckets(&self, idle_secs: u64) -> Vec<NodeId> {
        let mut targets = Vec::new();
        for (index, bucket) in self.buckets.iter().enumerate() {
            let guard = bucket.read();
            if guard.contacts.is_empty() {
                continue;
            }
            if guard.last_touched.elapsed().as_secs() >= idle_secs {
                targets.push(self.random_id_in_bucket(index));
            }
        }
        targets
    }

    /// Generates a random id sharing exactly `prefix_len` leading bits
    /// with the local id, i.e. one that falls in that bucket's range.
    fn random_id_in_bucket(&self, prefix_len: usize) -> NodeId {
        let mut bytes = *NodeId::random().as_bytes();
        let local = self.local_id.as_bytes();

        // Copy the shared prefix, then flip the first divergent bit.
        for bit in 0..prefix_len {
            let byte = bit / 8;
            let mask = 0x80u8 >> (bit % 8);
            bytes[byte] = (bytes[byte] & !mask) | (local[byte] & mask);
        }
        if prefix_len < NUM_BUCKETS {
            let byte = prefix_len / 8;
            let mask = 0x80u8 >> (prefix_len % 8);
            bytes[byte] = (bytes[byte] & !mask) | (!local[byte] & mask);
        }
        NodeId::new(bytes)
    }
}
