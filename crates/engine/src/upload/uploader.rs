//! Upload front end.
//!
//! Classifies the persisted state of a file, builds the graph of remaining
//! stages and tracks in-flight attempts so each file has at most one.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nimbus_protocol::{Node, NodeId};
use nimbus_transfer::{BlockCache, Progress, Task, TaskHandle, TaskId, TaskOutcome, TaskScheduler};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::{CloudApi, ContentCipher};
use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::events::{Direction, EventSink, TransferEvent};
use crate::store::{self, MetadataStore};
use crate::upload::draft::UploadDraft;
use crate::upload::graph::{GraphPolicy, UploadGraphBuilder};
use crate::upload::stages::StageContext;
use crate::upload::state::{ResumeState, classify};

/// Awaitable view of one upload attempt.
#[derive(Clone)]
pub struct UploadHandle {
    node: NodeId,
    first: TaskId,
    root: TaskHandle<SyncError>,
    progress: Progress,
    store: Arc<dyn MetadataStore>,
}

impl UploadHandle {
    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// Task whose outcome is the outcome of the transfer.
    pub fn root_task(&self) -> TaskId {
        self.root.id()
    }

    pub fn is_terminal(&self) -> bool {
        self.root.is_terminal()
    }

    /// Waits for the attempt and returns the committed node.
    pub async fn wait(&self) -> Result<Node, SyncError> {
        match self.root.wait().await {
            TaskOutcome::Finished => store::load_node(&*self.store, &self.node),
            TaskOutcome::Failed(e) => Err(e),
            TaskOutcome::Cancelled => Err(SyncError::Cancelled),
        }
    }
}

/// Runs uploads on a dedicated scheduler.
///
/// Must be used from within a Tokio runtime.
pub struct Uploader {
    scheduler: TaskScheduler<SyncError>,
    ctx: StageContext,
    policy: GraphPolicy,
    in_flight: Arc<Mutex<HashMap<NodeId, UploadHandle>>>,
    events: EventSink,
    events_rx: Option<mpsc::Receiver<TransferEvent>>,
}

impl Uploader {
    pub fn new(
        config: &EngineConfig,
        api: Arc<dyn CloudApi>,
        store: Arc<dyn MetadataStore>,
        cipher: Arc<dyn ContentCipher>,
    ) -> Self {
        let (events, events_rx) = EventSink::channel();
        Self {
            scheduler: TaskScheduler::new(config.upload_concurrency),
            ctx: StageContext {
                api,
                store,
                cipher,
                cache: BlockCache::new(config.cache_dir.join("upload")),
                max_block_size: config.max_block_size,
            },
            policy: config.graph_policy,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            events,
            events_rx: Some(events_rx),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.events_rx.take()
    }

    pub fn scheduler(&self) -> &TaskScheduler<SyncError> {
        &self.scheduler
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<NodeId, UploadHandle>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `content` as the new content of `node` and starts uploading.
    ///
    /// An existing row for the node is kept and only its upload fields are
    /// replaced. Fails if an earlier upload of the node is still in flight
    /// or pending resumption.
    pub fn request_upload(&self, node: Node, content: &Path) -> Result<UploadHandle, SyncError> {
        let size = std::fs::metadata(content)?.len();
        let id = node.id.clone();
        // Held until the attempt is registered so concurrent requests for
        // the same node see each other.
        let in_flight = self.in_flight();
        if in_flight.get(&id).is_some_and(|h| !h.is_terminal()) {
            return Err(SyncError::InvalidState(format!(
                "{id} is already uploading"
            )));
        }
        store::write(&*self.ctx.store, |tx| {
            let mut row = tx.fetch_one(&id).unwrap_or(node);
            if row.draft_revision.is_some() {
                return Err(SyncError::InvalidState(format!(
                    "{id} already has a pending upload"
                )));
            }
            row.upload_id = Some(uuid::Uuid::new_v4().to_string());
            row.clear_content_path = Some(content.to_path_buf());
            row.size = size;
            tx.upsert(row);
            Ok(())
        })?;
        debug!(node = %id, size, "upload requested");
        self.start(in_flight, &id)
    }

    /// Starts or resumes the upload of `id` from its persisted state.
    ///
    /// Returns the in-flight attempt if one is already running.
    pub fn upload(&self, id: &NodeId) -> Result<UploadHandle, SyncError> {
        self.start(self.in_flight(), id)
    }

    fn start(
        &self,
        mut in_flight: MutexGuard<'_, HashMap<NodeId, UploadHandle>>,
        id: &NodeId,
    ) -> Result<UploadHandle, SyncError> {
        if let Some(existing) = in_flight.get(id)
            && !existing.is_terminal()
        {
            debug!(node = %id, "upload already in flight");
            return Ok(existing.clone());
        }

        let node = store::load_node(&*self.ctx.store, id)?;
        let state = classify(&node)?;
        if state == ResumeState::Finished {
            debug!(node = %id, "nothing left to upload");
            let root = self.scheduler.submit(Task::noop(format!("finished {id}")), &[]);
            let progress = Progress::new(0);
            progress.finish();
            return Ok(UploadHandle {
                node: id.clone(),
                first: root.id(),
                root,
                progress,
                store: Arc::clone(&self.ctx.store),
            });
        }

        let parent_hash_key = node.parent_id.as_ref().and_then(|parent| {
            store::read(&*self.ctx.store, |tx| tx.fetch_one(parent))
                .map(|p| p.crypto.node_hash_key)
        });
        let draft = Arc::new(UploadDraft::new(
            &node,
            state,
            parent_hash_key,
            self.ctx.max_block_size,
        )?);
        info!(
            node = %id,
            state = ?state,
            blocks = draft.number_of_blocks,
            pending = draft.pending_blocks.len(),
            "starting upload"
        );

        let graph = UploadGraphBuilder::new(&self.scheduler, &self.ctx, self.policy).build(draft);
        let handle = UploadHandle {
            node: id.clone(),
            first: graph.first,
            root: graph.root,
            progress: graph.progress,
            store: Arc::clone(&self.ctx.store),
        };
        in_flight.insert(id.clone(), handle.clone());
        drop(in_flight);

        self.events.emit(TransferEvent::Started {
            node: id.clone(),
            direction: Direction::Upload,
        });
        let sink = self.events.clone();
        let node_id = id.clone();
        handle.progress.observe(Box::new(move |snap| {
            sink.emit(TransferEvent::Progress {
                node: node_id.clone(),
                direction: Direction::Upload,
                completed: snap.completed,
                total: snap.total,
            });
        }));
        self.watch(handle.clone());
        Ok(handle)
    }

    /// Starts an upload for every node the store reports as pending.
    pub fn resume_pending(&self) -> Vec<(NodeId, Result<UploadHandle, SyncError>)> {
        let pending = store::read(&*self.ctx.store, |tx| tx.nodes_with_pending_upload());
        info!(count = pending.len(), "resuming pending uploads");
        pending
            .into_iter()
            .map(|node| {
                let result = self.upload(&node.id);
                if let Err(e) = &result {
                    warn!(node = %node.id, error = %e, "cannot resume upload");
                }
                (node.id, result)
            })
            .collect()
    }

    /// Cancels the in-flight uploads of `ids`. Returns how many were found.
    pub fn cancel(&self, ids: &[NodeId]) -> usize {
        let in_flight = self.in_flight();
        let mut cancelled = 0;
        for id in ids {
            if let Some(handle) = in_flight.get(id)
                && !handle.is_terminal()
            {
                self.scheduler.cancel(handle.first);
                cancelled += 1;
            }
        }
        debug!(requested = ids.len(), cancelled, "upload cancel");
        cancelled
    }

    /// Cancels what is left of a failed graph, reports the outcome and
    /// forgets the attempt.
    fn watch(&self, handle: UploadHandle) {
        let scheduler = self.scheduler.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let events = self.events.clone();
        tokio::spawn(async move {
            let outcome = handle.root.wait().await;
            if !outcome.is_finished() {
                scheduler.cancel(handle.first);
            }

            let node = handle.node.clone();
            let direction = Direction::Upload;
            let event = match outcome {
                TaskOutcome::Finished => {
                    info!(node = %node, "upload completed");
                    TransferEvent::Completed { node, direction }
                }
                TaskOutcome::Failed(e) => {
                    warn!(node = %node, error = %e, "upload failed");
                    TransferEvent::Failed {
                        node,
                        direction,
                        error: e.to_string(),
                    }
                }
                TaskOutcome::Cancelled => {
                    info!(node = %node, "upload cancelled");
                    TransferEvent::Cancelled { node, direction }
                }
            };

            {
                let mut map = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
                if map
                    .get(&handle.node)
                    .is_some_and(|h| h.root.id() == handle.root.id())
                {
                    map.remove(&handle.node);
                }
            }
            events.emit(event);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{Call, MockCloud, XorCipher, block_url, test_config, wait_until, write_content};
    use nimbus_protocol::{Revision, RevisionId};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        config: EngineConfig,
        cloud: Arc<MockCloud>,
        store: Arc<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let store = Arc::new(MemoryStore::new());
        let mut root = Node::folder("root", None, "root");
        root.crypto.node_hash_key = b"root-key".to_vec();
        store.insert(root);
        Fixture {
            dir,
            config,
            cloud: MockCloud::new(),
            store,
        }
    }

    fn uploader(fx: &Fixture, cloud: &Arc<MockCloud>) -> Uploader {
        Uploader::new(
            &fx.config,
            Arc::clone(cloud) as Arc<dyn CloudApi>,
            Arc::clone(&fx.store) as Arc<dyn MetadataStore>,
            Arc::new(XorCipher),
        )
    }

    fn new_file(id: &str) -> Node {
        Node::file(id, Some(NodeId::from("root")), format!("{id}.bin"), 0)
    }

    fn committed_file(id: &str) -> Node {
        let mut node = new_file(id);
        node.active_revision = Some(Revision::committed(RevisionId::from("rev-old")));
        node
    }

    #[tokio::test]
    async fn uploads_new_file_end_to_end() {
        let fx = fixture();
        let content = write_content(fx.dir.path(), "a.bin", b"0123456789");
        let uploader = uploader(&fx, &fx.cloud);

        let handle = uploader.request_upload(new_file("f1"), &content).unwrap();
        let node = handle.wait().await.unwrap();

        let active = node.active_revision.expect("committed revision");
        assert_eq!(active.id, Some(RevisionId::from("rev-1")));
        assert_eq!(active.blocks.len(), 3);
        assert!(active.blocks.iter().all(|b| b.is_uploaded));
        assert!(!active.manifest_signature.is_empty());
        assert!(node.draft_revision.is_none());
        assert!(node.upload_id.is_none());
        assert!(node.clear_content_path.is_none());

        let calls = fx.cloud.calls();
        assert_eq!(calls[0], Call::CreateFileDraft(NodeId::from("f1")));
        assert!(matches!(&calls[1], Call::RequestLinks(_, blocks) if blocks == &vec![0, 1, 2]));
        assert_eq!(fx.cloud.upload_calls(), 3);
        assert_eq!(fx.cloud.commit_calls(), 1);

        let expected: Vec<u8> = b"0123".iter().map(|b| b ^ 0x5a).collect();
        assert_eq!(fx.cloud.uploaded(&block_url("rev-1", 0)).unwrap(), expected);
        assert_eq!(handle.progress().snapshot().completed, handle.progress().total());
    }

    #[tokio::test]
    async fn restart_uploads_only_the_remaining_block() {
        let fx = fixture();
        let content = write_content(fx.dir.path(), "a.bin", b"0123456789");
        fx.cloud.fail_url(block_url("rev-1", 2));

        let first = uploader(&fx, &fx.cloud);
        let handle = first.request_upload(new_file("f1"), &content).unwrap();
        assert!(matches!(handle.wait().await, Err(SyncError::Api(_))));
        // Encrypt 5 of 5 units, upload 2 of 3 blocks of 10 units, seal 0 of 5.
        let interrupted = handle.progress().snapshot();
        assert_eq!((interrupted.completed, interrupted.total), (11, 20));
        drop(first);

        let id = NodeId::from("f1");
        let stored = fx.store.get(&id).unwrap();
        assert_eq!(classify(&stored).unwrap(), ResumeState::UploadingRevision);

        let cloud = MockCloud::new();
        let second = uploader(&fx, &cloud);
        let handle = second.upload(&id).unwrap();
        assert!(handle.progress().completed() >= interrupted.completed);

        let node = handle.wait().await.unwrap();
        assert!(node.active_revision.is_some());
        assert_eq!(cloud.upload_calls(), 1);
        assert_eq!(
            cloud.count(|c| *c == Call::UploadBlock(block_url("rev-1", 2))),
            1
        );
        assert_eq!(cloud.count(|c| matches!(c, Call::CreateFileDraft(_))), 0);
        assert_eq!(cloud.commit_calls(), 1);
    }

    #[tokio::test]
    async fn rejected_commit_resumes_at_sealing() {
        let fx = fixture();
        let content = write_content(fx.dir.path(), "a.bin", b"01234567");
        fx.cloud.fail_commits(true);

        let first = uploader(&fx, &fx.cloud);
        let handle = first.request_upload(new_file("f1"), &content).unwrap();
        assert!(matches!(handle.wait().await, Err(SyncError::Api(_))));
        drop(first);

        let id = NodeId::from("f1");
        let stored = fx.store.get(&id).unwrap();
        assert_eq!(classify(&stored).unwrap(), ResumeState::SealingRevision);

        let cloud = MockCloud::new();
        let node = uploader(&fx, &cloud).upload(&id).unwrap().wait().await.unwrap();

        assert!(node.draft_revision.is_none());
        assert_eq!(cloud.upload_calls(), 0);
        assert_eq!(cloud.calls(), vec![Call::Commit(RevisionId::from("rev-1"))]);
    }

    #[tokio::test]
    async fn empty_file_commits_without_block_transfers() {
        let fx = fixture();
        let content = write_content(fx.dir.path(), "empty.bin", b"");
        let uploader = uploader(&fx, &fx.cloud);

        let node = uploader
            .request_upload(new_file("e"), &content)
            .unwrap()
            .wait()
            .await
            .unwrap();

        let active = node.active_revision.unwrap();
        assert!(active.blocks.is_empty());
        let local = active.local_path.unwrap();
        assert_eq!(std::fs::metadata(local).unwrap().len(), 0);
        assert_eq!(fx.cloud.upload_calls(), 0);
        assert_eq!(fx.cloud.count(|c| matches!(c, Call::RequestLinks(..))), 0);
        assert_eq!(fx.cloud.commit_calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failed_block_stops_remaining_uploads() {
        for _ in 0..20 {
            let fx = fixture();
            let content = write_content(fx.dir.path(), "a.bin", b"0123456789abcdefghij");
            fx.cloud.fail_url(block_url("rev-1", 0));
            let uploader = uploader(&fx, &fx.cloud);

            let handle = uploader.request_upload(new_file("f1"), &content).unwrap();
            assert!(matches!(handle.wait().await, Err(SyncError::Api(_))));
            assert_eq!(fx.cloud.upload_calls(), 1);
            assert_eq!(fx.cloud.commit_calls(), 0);
            let stored = fx.store.get(&NodeId::from("f1")).unwrap();
            assert!(stored.active_revision.is_none());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_stops_pending_blocks_and_keeps_uploaded_ones() {
        let fx = fixture();
        let content = write_content(fx.dir.path(), "a.bin", b"0123456789");
        let gate = fx.cloud.gate_uploads();
        let mut uploader = uploader(&fx, &fx.cloud);
        let mut events = uploader.take_events().unwrap();
        assert!(uploader.take_events().is_none());

        let id = NodeId::from("f1");
        let handle = uploader.request_upload(new_file("f1"), &content).unwrap();
        wait_until(|| fx.cloud.upload_calls() == 1).await;

        assert_eq!(uploader.cancel(&[id.clone(), NodeId::from("other")]), 1);
        gate.add_permits(10);
        assert!(matches!(handle.wait().await, Err(SyncError::Cancelled)));

        // The block in flight is recorded for the next attempt.
        wait_until(|| {
            fx.store
                .get(&id)
                .and_then(|n| n.draft_revision)
                .and_then(|d| d.block(0).map(|b| b.is_uploaded))
                .unwrap_or(false)
        })
        .await;
        assert_eq!(fx.cloud.upload_calls(), 1);
        assert_eq!(fx.cloud.commit_calls(), 0);
        let stored = fx.store.get(&id).unwrap();
        assert!(stored.active_revision.is_none());
        assert!(stored.draft_revision.is_some());
        let progress = handle.progress().snapshot();
        assert!(progress.completed < progress.total);

        let mut seen_cancelled = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_secs(1), events.recv()).await
        {
            assert!(!matches!(event, TransferEvent::Completed { .. }));
            if matches!(event, TransferEvent::Cancelled { .. }) {
                seen_cancelled = true;
                break;
            }
        }
        assert!(seen_cancelled);
    }

    #[tokio::test]
    async fn duplicate_requests_share_the_in_flight_upload() {
        let fx = fixture();
        let content = write_content(fx.dir.path(), "a.bin", b"0123456789");
        let gate = fx.cloud.gate_uploads();
        let uploader = uploader(&fx, &fx.cloud);

        let id = NodeId::from("f1");
        let first = uploader.request_upload(new_file("f1"), &content).unwrap();
        let second = uploader.upload(&id).unwrap();
        assert_eq!(first.root_task(), second.root_task());

        // New content cannot replace an upload in flight.
        assert!(matches!(
            uploader.request_upload(new_file("f1"), &content),
            Err(SyncError::InvalidState(_))
        ));

        gate.add_permits(10);
        first.wait().await.unwrap();
        second.wait().await.unwrap();
        assert_eq!(fx.cloud.upload_calls(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_requests_start_one_upload() {
        let fx = fixture();
        let content = write_content(fx.dir.path(), "a.bin", b"0123456789");
        let gate = fx.cloud.gate_uploads();
        let uploader = uploader(&fx, &fx.cloud);
        let runtime = tokio::runtime::Handle::current();
        let barrier = std::sync::Barrier::new(2);

        let results: Vec<_> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(|| {
                        let _rt = runtime.enter();
                        barrier.wait();
                        uploader.request_upload(new_file("f1"), &content)
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let (started, rejected): (Vec<_>, Vec<_>) = results.into_iter().partition(Result::is_ok);
        assert_eq!(started.len(), 1);
        assert!(matches!(rejected.as_slice(), [Err(SyncError::InvalidState(_))]));

        gate.add_permits(10);
        let handle = started.into_iter().next().unwrap().unwrap();
        handle.wait().await.unwrap();
        assert_eq!(fx.cloud.count(|c| matches!(c, Call::CreateFileDraft(_))), 1);
        assert_eq!(fx.cloud.upload_calls(), 3);
    }

    #[tokio::test]
    async fn restricted_class_rejects_new_revisions() {
        let mut fx = fixture();
        fx.config.graph_policy = GraphPolicy::Restricted;
        fx.store.insert(committed_file("f1"));
        let content = write_content(fx.dir.path(), "a.bin", b"new content");
        let uploader = uploader(&fx, &fx.cloud);

        let result = uploader
            .request_upload(committed_file("f1"), &content)
            .unwrap()
            .wait()
            .await;
        assert!(matches!(result, Err(SyncError::InvalidStateForClass(_))));
        assert!(fx.cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn new_content_for_committed_file_creates_revision_draft() {
        let fx = fixture();
        fx.store.insert(committed_file("f1"));
        let content = write_content(fx.dir.path(), "a.bin", b"abc");
        let uploader = uploader(&fx, &fx.cloud);

        let node = uploader
            .request_upload(committed_file("f1"), &content)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(
            node.active_revision.and_then(|r| r.id),
            Some(RevisionId::from("rev-1"))
        );
        assert_eq!(
            fx.cloud.calls()[0],
            Call::CreateRevisionDraft(NodeId::from("f1"))
        );
    }

    #[tokio::test]
    async fn split_policy_creates_draft_before_upload_stage() {
        let mut fx = fixture();
        fx.config.graph_policy = GraphPolicy::SplitDraftCommit;
        let content = write_content(fx.dir.path(), "a.bin", b"01234567");
        let uploader = uploader(&fx, &fx.cloud);

        uploader
            .request_upload(new_file("f1"), &content)
            .unwrap()
            .wait()
            .await
            .unwrap();
        let calls = fx.cloud.calls();
        assert_eq!(calls.first(), Some(&Call::CreateFileDraft(NodeId::from("f1"))));
        assert_eq!(calls.last(), Some(&Call::Commit(RevisionId::from("rev-1"))));
        assert_eq!(fx.cloud.upload_calls(), 2);
    }

    #[tokio::test]
    async fn resume_pending_restarts_requested_uploads() {
        let fx = fixture();
        let content = write_content(fx.dir.path(), "a.bin", b"0123");
        let mut node = new_file("f1");
        node.upload_id = Some("up-f1".into());
        node.clear_content_path = Some(content);
        fx.store.insert(node);
        fx.store.insert(committed_file("done"));
        let uploader = uploader(&fx, &fx.cloud);

        let resumed = uploader.resume_pending();
        assert_eq!(resumed.len(), 1);
        let (id, handle) = resumed.into_iter().next().unwrap();
        assert_eq!(id, NodeId::from("f1"));
        handle.unwrap().wait().await.unwrap();
        assert_eq!(fx.cloud.upload_calls(), 1);
    }

    #[tokio::test]
    async fn finished_node_needs_no_remote_calls() {
        let fx = fixture();
        fx.store.insert(committed_file("f1"));
        let uploader = uploader(&fx, &fx.cloud);

        let node = uploader.upload(&NodeId::from("f1")).unwrap().wait().await.unwrap();
        assert!(node.active_revision.is_some());
        assert!(fx.cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn lost_content_is_reported_before_scheduling() {
        let fx = fixture();
        let mut node = new_file("f1");
        node.upload_id = Some("up-f1".into());
        node.clear_content_path = Some(fx.dir.path().join("gone.bin"));
        fx.store.insert(node);
        let uploader = uploader(&fx, &fx.cloud);

        assert!(matches!(
            uploader.upload(&NodeId::from("f1")),
            Err(SyncError::ContentLost { .. })
        ));
        assert_eq!(uploader.scheduler().running(), 0);
    }
}
