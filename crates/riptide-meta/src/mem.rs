//! Deterministic in-memory metadata store.
//!
//! Backs tests and standalone single-process deployments. Lease expiry is
//! driven by [`MemMetaStore::expire_dead_leases`], called from a periodic
//! task in servers and directly in tests, so time-dependent behavior stays
//! deterministic.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::store::{
    KeyValue, LeaseId, MetaError, MetaStore, Result, Revision, WatchEvent, WatchEventKind,
};

#[derive(Debug, Clone)]
struct Stored {
    value: Vec<u8>,
    mod_revision: Revision,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Lease {
    deadline: Instant,
    ttl: Duration,
    keys: HashSet<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::Sender<WatchEvent>,
}

#[derive(Default)]
struct Inner {
    revision: Revision,
    data: BTreeMap<String, Stored>,
    leases: HashMap<u64, Lease>,
    next_lease_id: u64,
    watchers: Vec<Watcher>,
}

impl Inner {
    fn notify(&mut self, kind: WatchEventKind, kv: KeyValue) {
        self.watchers.retain(|w| {
            if !kv.key.starts_with(&w.prefix) {
                return true;
            }
            // A full or closed watcher is dropped rather than blocking the
            // store's write path.
            w.tx.try_send(WatchEvent {
                kind,
                kv: kv.clone(),
            })
            .is_ok()
        });
    }

    fn put_at(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Revision {
        self.revision += 1;
        let rev = self.revision;
        if let Some(old) = self.data.get(key) {
            if let Some(old_lease) = old.lease {
                if let Some(l) = self.leases.get_mut(&old_lease.0) {
                    l.keys.remove(key);
                }
            }
        }
        if let Some(lease) = lease {
            if let Some(l) = self.leases.get_mut(&lease.0) {
                l.keys.insert(key.to_string());
            }
        }
        self.data.insert(
            key.to_string(),
            Stored {
                value: value.clone(),
                mod_revision: rev,
                lease,
            },
        );
        self.notify(
            WatchEventKind::Put,
            KeyValue {
                key: key.to_string(),
                value,
                mod_revision: rev,
            },
        );
        rev
    }

    fn delete_key(&mut self, key: &str) -> bool {
        match self.data.remove(key) {
            Some(stored) => {
                if let Some(lease) = stored.lease {
                    if let Some(l) = self.leases.get_mut(&lease.0) {
                        l.keys.remove(key);
                    }
                }
                self.revision += 1;
                let rev = self.revision;
                self.notify(
                    WatchEventKind::Delete,
                    KeyValue {
                        key: key.to_string(),
                        value: stored.value,
                        mod_revision: rev,
                    },
                );
                true
            }
            None => false,
        }
    }
}

/// In-memory [`MetaStore`] with revisions, CAS, leases and prefix watches.
#[derive(Default)]
pub struct MemMetaStore {
    inner: Mutex<Inner>,
}

impl MemMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete every key bound to a lease whose deadline has passed.
    /// Returns the ids of expired leases.
    pub fn expire_dead_leases(&self) -> Vec<LeaseId> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let expired: Vec<u64> = inner
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(lease) = inner.leases.remove(id) {
                for key in lease.keys {
                    inner.delete_key(&key);
                }
            }
        }
        expired.into_iter().map(LeaseId).collect()
    }

    /// Current store revision, for assertions in tests.
    pub fn revision(&self) -> Revision {
        self.inner.lock().revision
    }
}

#[async_trait]
impl MetaStore for MemMetaStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let inner = self.inner.lock();
        Ok(inner.data.get(key).map(|s| KeyValue {
            key: key.to_string(),
            value: s.value.clone(),
            mod_revision: s.mod_revision,
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<Revision> {
        Ok(self.inner.lock().put_at(key, value, None))
    }

    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<Revision> {
        let mut inner = self.inner.lock();
        if !inner.leases.contains_key(&lease.0) {
            return Err(MetaError::LeaseNotFound(lease));
        }
        Ok(inner.put_at(key, value, Some(lease)))
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected: Revision,
        value: Vec<u8>,
    ) -> Result<Revision> {
        let mut inner = self.inner.lock();
        let current = inner.data.get(key).map(|s| s.mod_revision).unwrap_or(0);
        if current != expected {
            return Err(MetaError::CasConflict {
                key: key.to_string(),
            });
        }
        Ok(inner.put_at(key, value, None))
    }

    async fn compare_and_put_with_lease(
        &self,
        key: &str,
        expected: Revision,
        value: Vec<u8>,
        lease: LeaseId,
    ) -> Result<Revision> {
        let mut inner = self.inner.lock();
        if !inner.leases.contains_key(&lease.0) {
            return Err(MetaError::LeaseNotFound(lease));
        }
        let current = inner.data.get(key).map(|s| s.mod_revision).unwrap_or(0);
        if current != expected {
            return Err(MetaError::CasConflict {
                key: key.to_string(),
            });
        }
        Ok(inner.put_at(key, value, Some(lease)))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.inner.lock().delete_key(key))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let inner = self.inner.lock();
        Ok(inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, s)| KeyValue {
                key: k.clone(),
                value: s.value.clone(),
                mod_revision: s.mod_revision,
            })
            .collect())
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut inner = self.inner.lock();
        inner.next_lease_id += 1;
        let id = inner.next_lease_id;
        inner.leases.insert(
            id,
            Lease {
                deadline: Instant::now() + ttl,
                ttl,
                keys: HashSet::new(),
            },
        );
        Ok(LeaseId(id))
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.leases.get_mut(&lease.0) {
            Some(l) => {
                l.deadline = Instant::now() + l.ttl;
                Ok(())
            }
            None => Err(MetaError::LeaseNotFound(lease)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.leases.remove(&lease.0) {
            Some(l) => {
                for key in l.keys {
                    inner.delete_key(&key);
                }
                Ok(())
            }
            None => Err(MetaError::LeaseNotFound(lease)),
        }
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>> {
        let (tx, rx) = mpsc::channel(256);
        self.inner.lock().watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }
}
