use crate::error::FeatureStoreError;
use crate::online_store::OnlineStore;
use crate::persistence::{PersistenceWorker, WorkerStats};
use crate::registry::Registry;
use crate::retrieval::FeatureStore;
use crate::server::{serve, ServerError, ServerState};
use crate::settings::{ServerSettings, Settings};
use crate::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// A feature store wired from [`Settings`], with its persistence worker when one is enabled.
pub struct Launched {
    pub store: Arc<FeatureStore>,
    pub worker: Option<PersistenceWorker>,
}

impl Launched {
    /// Stops the worker after the jobs queued so far.
    pub async fn shutdown(self) -> Result<Option<WorkerStats>, FeatureStoreError> {
        match self.worker {
            Some(worker) => Ok(Some(worker.stop().await?)),
            None => Ok(None),
        }
    }
}

/// Builds the configured online store and, when `persistence.enabled`, spawns the worker on the
/// current tokio runtime and attaches its handle to the store.
pub fn build(settings: &Settings, registry: Arc<dyn Registry>) -> Result<Launched, FeatureStoreError> {
    let online_store = settings.build_online_store()?;
    Ok(assemble(settings, registry, online_store))
}

pub fn assemble(settings: &Settings, registry: Arc<dyn Registry>, online_store: Arc<dyn OnlineStore>) -> Launched {
    let store = FeatureStore::new(Arc::clone(&registry), Arc::clone(&online_store));
    if settings.persistence.enabled {
        let worker = PersistenceWorker::spawn(registry, online_store, &settings.persistence);
        let store = store.with_persistence(worker.handle());
        Launched { store: Arc::new(store), worker: Some(worker) }
    } else {
        info!("Persistence worker is disabled, skipping");
        Launched { store: Arc::new(store), worker: None }
    }
}

pub async fn maybe_run_server(server: &ServerSettings, store: Arc<FeatureStore>, mut shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
    if server.enable {
        let addr: SocketAddr = server.bind_address.parse()?;
        info!("Starting http server at {}", addr);
        serve(ServerState { store }, addr, shutdown).await
    } else {
        info!("HTTP server is disabled, skipping");
        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Runs the configured store until `shutdown` flips, then stops the persistence worker.
pub async fn run(settings: Settings, registry: Arc<dyn Registry>, shutdown: watch::Receiver<bool>) -> Result<Option<WorkerStats>, ServerError> {
    let launched = build(&settings, registry)?;
    let served = maybe_run_server(&settings.server, Arc::clone(&launched.store), shutdown).await;
    let stats = launched.shutdown().await?;
    if let Err(e) = &served {
        error!("Feature server failed: {}", e);
    }
    served.map(|_| stats)
}

#[cfg(test)]
mod launcher_tests {
    use super::*;
    use crate::online_store::InMemoryOnlineStore;
    use crate::registry::RegistrySnapshot;
    use std::time::Duration;

    fn registry() -> Arc<dyn Registry> {
        Arc::new(RegistrySnapshot::new())
    }

    #[tokio::test]
    async fn worker_follows_persistence_flag() {
        let mut settings = Settings::default();
        let enabled = assemble(&settings, registry(), Arc::new(InMemoryOnlineStore::new()));
        assert!(enabled.store.persistence().is_some());
        assert_eq!(enabled.shutdown().await.expect("stop"), Some(WorkerStats::default()));

        settings.persistence.enabled = false;
        let disabled = build(&settings, registry()).expect("build");
        assert!(disabled.store.persistence().is_none());
        assert_eq!(disabled.shutdown().await.expect("stop"), None);
    }

    #[tokio::test]
    async fn disabled_server_waits_for_shutdown() {
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run(Settings::default(), registry(), rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        tx.send(true).expect("signal");
        let stats = task.await.expect("join").expect("run");
        assert_eq!(stats, Some(WorkerStats::default()));
    }

    #[tokio::test]
    async fn enabled_server_binds_and_shuts_down() {
        let mut settings = Settings::default();
        settings.server.enable = true;
        settings.server.bind_address = "127.0.0.1:0".to_string();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run(settings, registry(), rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).expect("signal");
        assert!(task.await.expect("join").is_ok());
    }

    #[tokio::test]
    async fn bad_bind_address_is_rejected() {
        let mut settings = Settings::default();
        settings.server.enable = true;
        settings.server.bind_address = "not an address".to_string();
        let (_tx, rx) = watch::channel(false);
        assert!(matches!(run(settings, registry(), rx).await, Err(ServerError::Address(_))));
    }
}
