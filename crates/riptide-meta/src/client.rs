//! Typed metadata-store client.
//!
//! Wraps a [`MetaStore`] with JSON accessors for every persisted shape and
//! implements capture registration and the owner election lock.

use std::sync::Arc;
use std::time::Duration;

use riptide_core::model::{
    AdminJobType, CaptureId, CaptureInfo, ChangeFeedId, ChangeFeedInfo, ChangeFeedStatus,
    TaskPosition, TaskStatus, TaskWorkload,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::keys::KeySpace;
use crate::store::{LeaseId, MetaError, MetaStore, Result, Revision, WatchEvent};

/// Proof of holding the owner election lock.
///
/// The lock key is bound to the holder's lease; losing the lease releases
/// the lock. Controllers must revalidate with
/// [`MetaClient::is_owner`] before every persisted write.
#[derive(Debug, Clone)]
pub struct OwnerLock {
    pub capture_id: CaptureId,
    pub lease: LeaseId,
    pub revision: Revision,
}

/// Typed coordination client shared by captures, processors and the owner.
#[derive(Clone)]
pub struct MetaClient {
    store: Arc<dyn MetaStore>,
    keys: KeySpace,
}

impl MetaClient {
    pub fn new(store: Arc<dyn MetaStore>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    pub fn store(&self) -> &Arc<dyn MetaStore> {
        &self.store
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<(T, Revision)>> {
        match self.store.get(key).await? {
            Some(kv) => {
                let value = serde_json::from_slice(&kv.value)?;
                Ok(Some((value, kv.mod_revision)))
            }
            None => Ok(None),
        }
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    // ---- changefeeds ----

    /// Create a changefeed definition; fails if the id is taken.
    pub async fn create_changefeed(&self, id: &ChangeFeedId, info: &ChangeFeedInfo) -> Result<()> {
        let key = self.keys.changefeed_info(id);
        self.store
            .compare_and_put(&key, 0, Self::encode(info)?)
            .await?;
        debug!(changefeed = %id, "created changefeed");
        Ok(())
    }

    pub async fn get_changefeed_info(&self, id: &ChangeFeedId) -> Result<Option<ChangeFeedInfo>> {
        Ok(self
            .get_json(&self.keys.changefeed_info(id))
            .await?
            .map(|(info, _)| info))
    }

    pub async fn get_all_changefeeds(&self) -> Result<Vec<(ChangeFeedId, ChangeFeedInfo)>> {
        let kvs = self
            .store
            .list_prefix(&self.keys.changefeed_info_prefix())
            .await?;
        let mut out = Vec::with_capacity(kvs.len());
        for kv in kvs {
            let id = ChangeFeedId::new(KeySpace::last_segment(&kv.key));
            let info: ChangeFeedInfo = serde_json::from_slice(&kv.value)?;
            out.push((id, info));
        }
        Ok(out)
    }

    /// Attach an admin command to a changefeed definition.
    pub async fn set_admin_job(&self, id: &ChangeFeedId, job: AdminJobType) -> Result<()> {
        let key = self.keys.changefeed_info(id);
        loop {
            let (mut info, rev) = self
                .get_json::<ChangeFeedInfo>(&key)
                .await?
                .ok_or_else(|| MetaError::KeyNotFound(key.clone()))?;
            info.admin_job_type = job;
            match self
                .store
                .compare_and_put(&key, rev, Self::encode(&info)?)
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if e.is_cas_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn get_changefeed_status(
        &self,
        id: &ChangeFeedId,
    ) -> Result<Option<(ChangeFeedStatus, Revision)>> {
        self.get_json(&self.keys.changefeed_status(id)).await
    }

    /// Owner-only write of a changefeed status, guarded by the previous
    /// revision so a deposed owner cannot clobber its successor.
    pub async fn put_changefeed_status(
        &self,
        id: &ChangeFeedId,
        status: &ChangeFeedStatus,
        expected: Revision,
    ) -> Result<Revision> {
        let key = self.keys.changefeed_status(id);
        self.store
            .compare_and_put(&key, expected, Self::encode(status)?)
            .await
    }

    pub async fn delete_changefeed(&self, id: &ChangeFeedId) -> Result<()> {
        self.store.delete(&self.keys.changefeed_info(id)).await?;
        self.store.delete(&self.keys.changefeed_status(id)).await?;
        Ok(())
    }

    // ---- captures ----

    /// Register a capture under a fresh lease and return the lease for
    /// keep-alive.
    pub async fn register_capture(&self, info: &CaptureInfo, ttl: Duration) -> Result<LeaseId> {
        let lease = self.store.grant_lease(ttl).await?;
        self.store
            .put_with_lease(&self.keys.capture(&info.id), Self::encode(info)?, lease)
            .await?;
        Ok(lease)
    }

    pub async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        self.store.keep_alive(lease).await
    }

    pub async fn list_captures(&self) -> Result<Vec<CaptureInfo>> {
        let kvs = self.store.list_prefix(&self.keys.capture_prefix()).await?;
        kvs.iter()
            .map(|kv| serde_json::from_slice(&kv.value).map_err(MetaError::from))
            .collect()
    }

    // ---- task status / position / workload ----

    pub async fn get_task_status(
        &self,
        cf: &ChangeFeedId,
        capture: &CaptureId,
    ) -> Result<Option<(TaskStatus, Revision)>> {
        self.get_json(&self.keys.task_status(cf, capture)).await
    }

    pub async fn get_all_task_statuses(
        &self,
        cf: &ChangeFeedId,
    ) -> Result<Vec<(CaptureId, TaskStatus, Revision)>> {
        let kvs = self
            .store
            .list_prefix(&self.keys.task_status_prefix(cf))
            .await?;
        let mut out = Vec::with_capacity(kvs.len());
        for kv in kvs {
            let capture = CaptureId::new(KeySpace::last_segment(&kv.key));
            let status: TaskStatus = serde_json::from_slice(&kv.value)?;
            out.push((capture, status, kv.mod_revision));
        }
        Ok(out)
    }

    /// CAS write of a task status. Both the owner (queueing operations) and
    /// the processor (marking them processed/finished) write here; a
    /// conflict means reload-and-reapply.
    pub async fn put_task_status(
        &self,
        cf: &ChangeFeedId,
        capture: &CaptureId,
        status: &TaskStatus,
        expected: Revision,
    ) -> Result<Revision> {
        let key = self.keys.task_status(cf, capture);
        self.store
            .compare_and_put(&key, expected, Self::encode(status)?)
            .await
    }

    pub async fn delete_task_state(&self, cf: &ChangeFeedId, capture: &CaptureId) -> Result<()> {
        self.store.delete(&self.keys.task_status(cf, capture)).await?;
        self.store
            .delete(&self.keys.task_position(cf, capture))
            .await?;
        self.store
            .delete(&self.keys.task_workload(cf, capture))
            .await?;
        Ok(())
    }

    pub async fn get_task_position(
        &self,
        cf: &ChangeFeedId,
        capture: &CaptureId,
    ) -> Result<Option<(TaskPosition, Revision)>> {
        self.get_json(&self.keys.task_position(cf, capture)).await
    }

    pub async fn get_all_task_positions(
        &self,
        cf: &ChangeFeedId,
    ) -> Result<Vec<(CaptureId, TaskPosition)>> {
        let kvs = self
            .store
            .list_prefix(&self.keys.task_position_prefix(cf))
            .await?;
        let mut out = Vec::with_capacity(kvs.len());
        for kv in kvs {
            let capture = CaptureId::new(KeySpace::last_segment(&kv.key));
            let position: TaskPosition = serde_json::from_slice(&kv.value)?;
            out.push((capture, position));
        }
        Ok(out)
    }

    pub async fn put_task_position(
        &self,
        cf: &ChangeFeedId,
        capture: &CaptureId,
        position: &TaskPosition,
        expected: Revision,
    ) -> Result<Revision> {
        let key = self.keys.task_position(cf, capture);
        self.store
            .compare_and_put(&key, expected, Self::encode(position)?)
            .await
    }

    pub async fn put_task_workload(
        &self,
        cf: &ChangeFeedId,
        capture: &CaptureId,
        workload: &TaskWorkload,
    ) -> Result<()> {
        let key = self.keys.task_workload(cf, capture);
        self.store.put(&key, Self::encode(workload)?).await?;
        Ok(())
    }

    pub async fn get_all_task_workloads(
        &self,
        cf: &ChangeFeedId,
    ) -> Result<Vec<(CaptureId, TaskWorkload)>> {
        let kvs = self
            .store
            .list_prefix(&self.keys.task_workload_prefix(cf))
            .await?;
        let mut out = Vec::with_capacity(kvs.len());
        for kv in kvs {
            let capture = CaptureId::new(KeySpace::last_segment(&kv.key));
            let workload: TaskWorkload = serde_json::from_slice(&kv.value)?;
            out.push((capture, workload));
        }
        Ok(out)
    }

    // ---- owner election ----

    /// Try to take the owner lock under the given lease. Returns `None`
    /// when another capture holds it.
    pub async fn campaign_owner(
        &self,
        capture_id: &CaptureId,
        lease: LeaseId,
    ) -> Result<Option<OwnerLock>> {
        let key = self.keys.owner();
        match self
            .store
            .compare_and_put_with_lease(&key, 0, capture_id.0.clone().into_bytes(), lease)
            .await
        {
            Ok(revision) => Ok(Some(OwnerLock {
                capture_id: capture_id.clone(),
                lease,
                revision,
            })),
            Err(e) if e.is_cas_conflict() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Whether the lock is still held at the same revision. A controller
    /// that observes `false` must demote itself before its next write.
    pub async fn is_owner(&self, lock: &OwnerLock) -> Result<bool> {
        match self.store.get(&self.keys.owner()).await? {
            Some(kv) => Ok(kv.mod_revision == lock.revision
                && kv.value == lock.capture_id.0.as_bytes()),
            None => Ok(false),
        }
    }

    pub async fn resign_owner(&self, lock: &OwnerLock) -> Result<()> {
        if self.is_owner(lock).await? {
            self.store.delete(&self.keys.owner()).await?;
        }
        Ok(())
    }

    // ---- watches ----

    pub async fn watch_changefeeds(&self) -> Result<mpsc::Receiver<WatchEvent>> {
        self.store
            .watch_prefix(&self.keys.changefeed_info_prefix())
            .await
    }

    pub async fn watch_task_status(
        &self,
        cf: &ChangeFeedId,
        capture: &CaptureId,
    ) -> Result<mpsc::Receiver<WatchEvent>> {
        self.store
            .watch_prefix(&self.keys.task_status(cf, capture))
            .await
    }

    pub async fn watch_captures(&self) -> Result<mpsc::Receiver<WatchEvent>> {
        self.store.watch_prefix(&self.keys.capture_prefix()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemMetaStore;
    use riptide_core::model::Ts;

    fn client() -> MetaClient {
        MetaClient::new(Arc::new(MemMetaStore::new()), KeySpace::default())
    }

    #[tokio::test]
    async fn test_changefeed_info_roundtrip() {
        let client = client();
        let id = ChangeFeedId::new("feed-1");
        let info = ChangeFeedInfo::new("blackhole://");
        client.create_changefeed(&id, &info).await.unwrap();
        // Duplicate creation is rejected.
        assert!(client.create_changefeed(&id, &info).await.is_err());

        let got = client.get_changefeed_info(&id).await.unwrap().unwrap();
        assert_eq!(got.sink_uri, "blackhole://");
        let all = client.get_all_changefeeds().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, id);
    }

    #[tokio::test]
    async fn test_status_cas_guards_deposed_owner() {
        let client = client();
        let id = ChangeFeedId::new("feed-1");
        let status = ChangeFeedStatus {
            resolved_ts: Ts::new(100),
            checkpoint_ts: Ts::new(90),
            ..Default::default()
        };
        let rev = client.put_changefeed_status(&id, &status, 0).await.unwrap();

        // A write with a stale revision (a deposed owner) is rejected.
        let err = client
            .put_changefeed_status(&id, &status, rev - 1)
            .await
            .unwrap_err();
        assert!(err.is_cas_conflict());

        let (got, got_rev) = client.get_changefeed_status(&id).await.unwrap().unwrap();
        assert_eq!(got.resolved_ts, Ts::new(100));
        assert_eq!(got_rev, rev);
    }

    #[tokio::test]
    async fn test_capture_registration_and_listing() {
        let client = client();
        let info = CaptureInfo {
            id: CaptureId::new("cap-a"),
            advertise_addr: "10.0.0.1:8300".into(),
        };
        client
            .register_capture(&info, Duration::from_secs(5))
            .await
            .unwrap();
        let captures = client.list_captures().await.unwrap();
        assert_eq!(captures, vec![info]);
    }

    #[tokio::test]
    async fn test_owner_campaign_single_winner() {
        let store = Arc::new(MemMetaStore::new());
        let client = MetaClient::new(store.clone(), KeySpace::default());

        let lease_a = store.grant_lease(Duration::from_secs(5)).await.unwrap();
        let lease_b = store.grant_lease(Duration::from_secs(5)).await.unwrap();

        let a = CaptureId::new("cap-a");
        let b = CaptureId::new("cap-b");
        let lock = client.campaign_owner(&a, lease_a).await.unwrap().unwrap();
        assert!(client.campaign_owner(&b, lease_b).await.unwrap().is_none());
        assert!(client.is_owner(&lock).await.unwrap());

        client.resign_owner(&lock).await.unwrap();
        assert!(!client.is_owner(&lock).await.unwrap());
        assert!(client.campaign_owner(&b, lease_b).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_lock_released_on_lease_expiry() {
        let store = Arc::new(MemMetaStore::new());
        let client = MetaClient::new(store.clone(), KeySpace::default());

        let lease = store.grant_lease(Duration::from_secs(5)).await.unwrap();
        let a = CaptureId::new("cap-a");
        let lock = client.campaign_owner(&a, lease).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        store.expire_dead_leases();
        assert!(!client.is_owner(&lock).await.unwrap());

        let lease_b = store.grant_lease(Duration::from_secs(5)).await.unwrap();
        let b = CaptureId::new("cap-b");
        assert!(client.campaign_owner(&b, lease_b).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_task_status_roundtrip() {
        let client = client();
        let cf = ChangeFeedId::new("feed-1");
        let capture = CaptureId::new("cap-a");

        let mut status = TaskStatus::default();
        status.queue_add(riptide_core::model::TableId(1), Ts::new(50));
        let rev = client
            .put_task_status(&cf, &capture, &status, 0)
            .await
            .unwrap();

        let all = client.get_all_task_statuses(&cf).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, capture);
        assert_eq!(all[0].1, status);
        assert_eq!(all[0].2, rev);
    }
}
