//! Controller Registry
//!
//! Owns the replication controllers of a process, keyed by global volume id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use super::controller::ReplicationController;
use super::Peer;
use crate::config::ReplayerSettings;
use crate::error::{Error, Result};
use crate::volume::LocalPool;

/// Explicitly constructed set of per-volume controllers
pub struct MirrorRegistry {
    /// Pool replicas are created in
    pool: Arc<dyn LocalPool>,
    /// Settings handed to new controllers
    settings: RwLock<ReplayerSettings>,
    /// Controllers by global volume id
    controllers: RwLock<HashMap<String, Arc<ReplicationController>>>,
    /// Set once `shutdown_all` has begun
    shutting_down: AtomicBool,
}

impl MirrorRegistry {
    pub fn new(pool: Arc<dyn LocalPool>, settings: ReplayerSettings) -> Self {
        Self {
            pool,
            settings: RwLock::new(settings),
            controllers: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Controller for `global_id`, created on first use
    pub async fn get_or_create(
        &self,
        global_id: &str,
        peer: Peer,
    ) -> Result<Arc<ReplicationController>> {
        if let Some(existing) = self.get(global_id).await {
            return Ok(existing);
        }

        let mut controllers = self.controllers.write().await;
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        // raced with another creator
        if let Some(existing) = controllers.get(global_id) {
            return Ok(Arc::clone(existing));
        }

        let settings = self.settings.read().await.clone();
        let controller = ReplicationController::new(peer, Arc::clone(&self.pool), settings);
        controllers.insert(global_id.to_string(), Arc::clone(&controller));
        tracing::info!(
            "Registered controller for {} ({})",
            global_id,
            controller.volume_name()
        );
        Ok(controller)
    }

    pub async fn get(&self, global_id: &str) -> Option<Arc<ReplicationController>> {
        self.controllers.read().await.get(global_id).cloned()
    }

    /// Global ids with a controller
    pub async fn global_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.controllers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Settings for controllers created from now on
    pub async fn set_settings(&self, settings: ReplayerSettings) {
        *self.settings.write().await = settings;
    }

    /// Stop and destroy a controller
    pub async fn remove(&self, global_id: &str) -> Result<bool> {
        let controller = self.controllers.write().await.remove(global_id);
        match controller {
            Some(controller) => {
                controller.stop().await?;
                tracing::info!("Removed controller for {}", global_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop and destroy every controller
    pub async fn shutdown_all(&self) -> Result<()> {
        let controllers: Vec<_> = {
            let mut controllers = self.controllers.write().await;
            self.shutting_down.store(true, Ordering::SeqCst);
            controllers.drain().collect()
        };
        tracing::info!("Shutting down {} controllers", controllers.len());

        let stops = controllers
            .iter()
            .map(|(_, controller)| controller.stop());
        for result in futures::future::join_all(stops).await {
            result?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JournalConfig;
    use crate::volume::{MemoryPool, MemoryRemote};

    fn peer(remote: &Arc<MemoryRemote>) -> Peer {
        Peer {
            cluster_name: "site-b".into(),
            remote: remote.clone(),
            local_mirror_uuid: "local-uuid".into(),
            remote_mirror_uuid: "remote-uuid".into(),
        }
    }

    #[tokio::test]
    async fn test_one_controller_per_volume() {
        let registry = MirrorRegistry::new(Arc::new(MemoryPool::new()), ReplayerSettings::default());
        let remote = MemoryRemote::new("image", 4096, JournalConfig::default());

        let first = registry.get_or_create("global-1", peer(&remote)).await.unwrap();
        let second = registry.get_or_create("global-1", peer(&remote)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.global_ids().await, vec!["global-1".to_string()]);

        assert!(registry.remove("global-1").await.unwrap());
        assert!(!registry.remove("global-1").await.unwrap());
        assert!(registry.get("global-1").await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_controllers() {
        let pool = Arc::new(MemoryPool::new());
        let registry = MirrorRegistry::new(pool.clone(), ReplayerSettings::default());
        let remote = MemoryRemote::new("image", 4096, JournalConfig::default());
        let global_id = remote.global_id().await.unwrap();

        let controller = registry
            .get_or_create(&global_id, peer(&remote))
            .await
            .unwrap();
        controller.start().await.unwrap();
        assert!(controller.is_replaying());

        registry.shutdown_all().await.unwrap();
        assert!(controller.is_stopped());
        assert!(registry.global_ids().await.is_empty());

        let replica = pool.get("image").await.unwrap();
        assert!(replica.exclusive_owner().await.is_none());

        assert!(matches!(
            registry.get_or_create(&global_id, peer(&remote)).await,
            Err(Error::ShuttingDown)
        ));
    }
}
