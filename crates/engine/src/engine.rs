//! Engine facade wiring both pipelines to one connectivity suspender.

use std::sync::Arc;

use nimbus_transfer::{Connectivity, NetworkAwareSuspender, Suspendable};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::{CloudApi, ContentCipher};
use crate::config::EngineConfig;
use crate::download::{Downloader, TreeScanner};
use crate::error::SyncError;
use crate::store::MetadataStore;
use crate::upload::Uploader;

/// Owns the uploader, downloader and tree scanner of one account.
pub struct SyncEngine {
    config: EngineConfig,
    uploader: Uploader,
    downloader: Downloader,
    scanner: TreeScanner,
    suspender: Arc<NetworkAwareSuspender>,
    cancel: CancellationToken,
}

impl SyncEngine {
    /// Builds the engine from a validated configuration.
    pub fn new(
        config: EngineConfig,
        api: Arc<dyn CloudApi>,
        store: Arc<dyn MetadataStore>,
        cipher: Arc<dyn ContentCipher>,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let uploader = Uploader::new(&config, Arc::clone(&api), Arc::clone(&store), cipher);
        let downloader = Downloader::new(&config, Arc::clone(&api), Arc::clone(&store));
        let scanner = TreeScanner::new(&config, api, store).with_downloader(downloader.clone());

        let mut targets: Vec<Arc<dyn Suspendable>> = vec![
            Arc::new(uploader.scheduler().clone()),
            Arc::new(downloader.scheduler().clone()),
        ];
        for scheduler in scanner.schedulers() {
            targets.push(Arc::new(scheduler));
        }

        Ok(Self {
            config,
            uploader,
            downloader,
            scanner,
            suspender: Arc::new(NetworkAwareSuspender::new(targets)),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn uploader(&self) -> &Uploader {
        &self.uploader
    }

    /// Mutable access, for taking the upload event receiver.
    pub fn uploader_mut(&mut self) -> &mut Uploader {
        &mut self.uploader
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    pub fn scanner(&self) -> &TreeScanner {
        &self.scanner
    }

    pub fn suspender(&self) -> &NetworkAwareSuspender {
        &self.suspender
    }

    /// Sender for connectivity changes reported by the platform.
    pub fn connectivity(&self) -> mpsc::Sender<Connectivity> {
        self.suspender.signal()
    }

    /// Starts the connectivity loop. It runs until [`shutdown`](Self::shutdown).
    pub fn start(&self) -> JoinHandle<()> {
        let suspender = Arc::clone(&self.suspender);
        let cancel = self.cancel.clone();
        tokio::spawn(async move { suspender.run(cancel).await })
    }

    /// Stops the connectivity loop and cancels every queued or running
    /// transfer. Progress persisted so far is kept for resumption.
    pub fn shutdown(&self) {
        info!("shutting down sync engine");
        self.cancel.cancel();
        self.uploader.scheduler().cancel_all();
        self.downloader.scheduler().cancel_all();
        for scheduler in self.scanner.schedulers() {
            scheduler.cancel_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{MockCloud, XorCipher, test_config};
    use nimbus_protocol::{Node, NodeId};
    use tempfile::TempDir;

    fn engine(config: EngineConfig) -> Result<SyncEngine, SyncError> {
        let store = Arc::new(MemoryStore::new());
        store.insert(Node::folder("root", None, "root"));
        SyncEngine::new(config, MockCloud::new(), store, Arc::new(XorCipher))
    }

    #[test]
    fn rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            download_concurrency: 0,
            ..test_config(dir.path())
        };
        assert!(matches!(engine(config), Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn connectivity_suspends_and_resumes_every_scheduler() {
        let dir = TempDir::new().unwrap();
        let engine = engine(test_config(dir.path())).unwrap();
        let mut transitions = engine.suspender().subscribe();
        let loop_handle = engine.start();
        let signal = engine.connectivity();

        signal.send(Connectivity::Unreachable).await.unwrap();
        transitions.changed().await.unwrap();
        assert!(engine.uploader().scheduler().is_suspended());
        assert!(engine.downloader().scheduler().is_suspended());
        assert!(engine.scanner().schedulers().iter().all(|s| s.is_suspended()));

        signal.send(Connectivity::Reachable).await.unwrap();
        transitions.changed().await.unwrap();
        assert!(!engine.uploader().scheduler().is_suspended());
        assert!(engine.scanner().schedulers().iter().all(|s| !s.is_suspended()));

        engine.shutdown();
        loop_handle.await.unwrap();
    }

    #[tokio::test]
    async fn upload_events_are_taken_once() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine(test_config(dir.path())).unwrap();
        assert!(engine.uploader_mut().take_events().is_some());
        assert!(engine.uploader_mut().take_events().is_none());
    }

    #[tokio::test]
    async fn shutdown_cancels_queued_downloads() {
        let dir = TempDir::new().unwrap();
        let engine = engine(test_config(dir.path())).unwrap();
        engine.suspender().apply(Connectivity::Unreachable);

        let handle = engine.downloader().download(&NodeId::from("missing"));
        engine.shutdown();

        assert!(matches!(handle.wait().await, Err(SyncError::Cancelled)));
    }
}
