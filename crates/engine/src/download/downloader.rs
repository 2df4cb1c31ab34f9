//! Download pipeline.
//!
//! Each download is a small graph: a metadata task, one task per block
//! submitted once the block list is known, and an attach task that
//! records the fetched blocks on the revision after all of them landed in
//! the block cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nimbus_protocol::{Block, BlockDescriptor, Node, NodeId, Revision, RevisionMetadata};
use nimbus_transfer::{BlockCache, Progress, Task, TaskContext, TaskHandle, TaskId, TaskOutcome, TaskScheduler};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::api::CloudApi;
use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::events::{Direction, EventSink, TransferEvent};
use crate::store::{self, MetadataStore};

/// Awaitable view of one download.
#[derive(Clone)]
pub struct DownloadHandle {
    node: NodeId,
    root: TaskHandle<SyncError>,
    progress: Progress,
    store: Arc<dyn MetadataStore>,
}

impl DownloadHandle {
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

    /// Waits for the download and returns the node with its revision
    /// content attached.
    pub async fn wait(&self) -> Result<Node, SyncError> {
        match self.root.wait().await {
            TaskOutcome::Finished => store::load_node(&*self.store, &self.node),
            TaskOutcome::Failed(e) => Err(e),
            TaskOutcome::Cancelled => Err(SyncError::Cancelled),
        }
    }
}

#[derive(Clone)]
struct InFlight {
    /// Every other task of the download depends on it.
    first: TaskId,
    handle: DownloadHandle,
}

/// State shared by the tasks of one download.
struct Job {
    node: NodeId,
    progress: Progress,
    /// Set by [`Downloader::download`] before the metadata task reads it.
    attach: Mutex<Option<TaskId>>,
    revision: Mutex<Option<RevisionMetadata>>,
    blocks: Mutex<Vec<Block>>,
}

impl Job {
    fn attach(&self) -> MutexGuard<'_, Option<TaskId>> {
        self.attach.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn revision(&self) -> MutexGuard<'_, Option<RevisionMetadata>> {
        self.revision.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn blocks(&self) -> MutexGuard<'_, Vec<Block>> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Shared {
    scheduler: TaskScheduler<SyncError>,
    api: Arc<dyn CloudApi>,
    store: Arc<dyn MetadataStore>,
    cache: BlockCache,
    in_flight: Mutex<HashMap<NodeId, InFlight>>,
    events: EventSink,
    events_rx: Mutex<Option<mpsc::Receiver<TransferEvent>>>,
}

impl Shared {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<NodeId, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Downloads committed revisions into the local block cache.
///
/// Cloning yields another handle to the same downloader. Must be used from
/// within a Tokio runtime.
#[derive(Clone)]
pub struct Downloader {
    shared: Arc<Shared>,
}

impl Downloader {
    pub fn new(
        config: &EngineConfig,
        api: Arc<dyn CloudApi>,
        store: Arc<dyn MetadataStore>,
    ) -> Self {
        let (events, events_rx) = EventSink::channel();
        Self {
            shared: Arc::new(Shared {
                scheduler: TaskScheduler::new(config.download_concurrency),
                api,
                store,
                cache: BlockCache::new(config.cache_dir.join("download")),
                in_flight: Mutex::new(HashMap::new()),
                events,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.shared
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn scheduler(&self) -> &TaskScheduler<SyncError> {
        &self.shared.scheduler
    }

    /// Starts downloading the active revision of `id`.
    ///
    /// Returns the running download if the node is already queued or
    /// running.
    pub fn download(&self, id: &NodeId) -> DownloadHandle {
        let shared = &self.shared;
        let mut in_flight = shared.in_flight();
        if let Some(existing) = in_flight.get(id)
            && !existing.handle.is_terminal()
        {
            debug!(node = %id, "download already in flight");
            return existing.handle.clone();
        }

        // One unit for metadata, one for content.
        let progress = Progress::new(2);
        let job = Arc::new(Job {
            node: id.clone(),
            progress: progress.clone(),
            attach: Mutex::new(None),
            revision: Mutex::new(None),
            blocks: Mutex::new(Vec::new()),
        });

        // Held until the attach task exists so the metadata task sees its id.
        let mut attach_slot = job.attach();
        let meta = {
            let (owner, job) = (Arc::clone(shared), Arc::clone(&job));
            let task: Task<SyncError> = Task::new(format!("metadata {id}"), move |ctx| {
                fetch_metadata(owner, job, ctx)
            });
            shared.scheduler.submit(task, &[])
        };
        let attach = {
            let (owner, job) = (Arc::clone(shared), Arc::clone(&job));
            let task: Task<SyncError> =
                Task::new(format!("attach {id}"), move |ctx| attach_blocks(owner, job, ctx));
            shared.scheduler.submit(task, &[meta.id()])
        };
        *attach_slot = Some(attach.id());
        drop(attach_slot);

        let handle = DownloadHandle {
            node: id.clone(),
            root: attach,
            progress,
            store: Arc::clone(&shared.store),
        };
        in_flight.insert(
            id.clone(),
            InFlight {
                first: meta.id(),
                handle: handle.clone(),
            },
        );
        drop(in_flight);

        shared.events.emit(TransferEvent::Started {
            node: id.clone(),
            direction: Direction::Download,
        });
        let sink = shared.events.clone();
        let node_id = id.clone();
        handle.progress.observe(Box::new(move |snap| {
            sink.emit(TransferEvent::Progress {
                node: node_id.clone(),
                direction: Direction::Download,
                completed: snap.completed,
                total: snap.total,
            });
        }));
        self.watch(meta.id(), handle.clone());
        handle
    }

    /// Cancels the in-flight downloads of `ids`. Returns how many were found.
    pub fn cancel(&self, ids: &[NodeId]) -> usize {
        let in_flight = self.shared.in_flight();
        let mut cancelled = 0;
        for id in ids {
            if let Some(entry) = in_flight.get(id)
                && !entry.handle.is_terminal()
            {
                self.shared.scheduler.cancel(entry.first);
                cancelled += 1;
            }
        }
        debug!(requested = ids.len(), cancelled, "download cancel");
        cancelled
    }

    fn watch(&self, first: TaskId, handle: DownloadHandle) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let outcome = handle.root.wait().await;
            if !outcome.is_finished() {
                // Stops whatever a failed metadata or attach task left.
                shared.scheduler.cancel(first);
            }

            let node = handle.node.clone();
            let direction = Direction::Download;
            let event = match outcome {
                TaskOutcome::Finished => {
                    info!(node = %node, "download completed");
                    TransferEvent::Completed { node, direction }
                }
                TaskOutcome::Failed(e) => {
                    warn!(node = %node, error = %e, "download failed");
                    TransferEvent::Failed {
                        node,
                        direction,
                        error: e.to_string(),
                    }
                }
                TaskOutcome::Cancelled => {
                    info!(node = %node, "download cancelled");
                    TransferEvent::Cancelled { node, direction }
                }
            };

            {
                let mut map = shared.in_flight();
                if map
                    .get(&handle.node)
                    .is_some_and(|entry| entry.first == first)
                {
                    map.remove(&handle.node);
                }
            }
            shared.events.emit(event);
        });
    }
}

// ---------------------------------------------------------------------------
// Task bodies
// ---------------------------------------------------------------------------

/// Fetches node and revision metadata, then fans out one task per block
/// and makes the attach task wait for all of them.
async fn fetch_metadata(shared: Arc<Shared>, job: Arc<Job>, ctx: TaskContext) -> Result<(), SyncError> {
    let remote = shared.api.fetch_node_metadata(&job.node).await?;
    let revision_id = remote
        .active_revision
        .as_ref()
        .and_then(|r| r.id.clone())
        .ok_or_else(|| {
            SyncError::InvalidState(format!("{} has no committed revision", job.node))
        })?;

    store::write(&*shared.store, |tx| {
        let row = match tx.fetch_one(&remote.id) {
            Some(mut local) => {
                local.merge_remote(remote);
                local
            }
            None => remote,
        };
        tx.upsert(row);
        Ok(())
    })?;

    let revision = shared
        .api
        .fetch_revision_metadata(&job.node, &revision_id)
        .await?;
    if ctx.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    let descriptors = revision.ordered_blocks();
    if let Some((position, block)) = descriptors
        .iter()
        .enumerate()
        .find(|(position, b)| b.index as usize != *position)
    {
        return Err(SyncError::BlockMetadataMissing {
            node: job.node.clone(),
            reason: format!("expected block {position}, got {}", block.index),
        });
    }
    debug!(node = %job.node, revision = %revision.id, blocks = descriptors.len(), "revision metadata fetched");
    *job.revision() = Some(revision.clone());
    job.progress.child(1, 1).finish();

    let blocks_progress = job.progress.child(descriptors.len() as u64, 1);
    let mut block_tasks = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        let owner = Arc::clone(&shared);
        let job = Arc::clone(&job);
        let key = revision.id.0.clone();
        let stage = blocks_progress.clone();
        let task: Task<SyncError> = Task::new(
            format!("block {} of {}", descriptor.index, job.node),
            move |ctx| fetch_block(owner, job, key, descriptor, stage, ctx),
        )
        .fail_fast();
        block_tasks.push(shared.scheduler.submit(task, &[ctx.id()]));
    }

    let attach = *job.attach();
    if let Some(attach) = attach
        && !block_tasks.is_empty()
    {
        let ids: Vec<TaskId> = block_tasks.iter().map(TaskHandle::id).collect();
        shared.scheduler.add_dependencies(attach, &ids);
    }
    Ok(())
}

async fn fetch_block(
    shared: Arc<Shared>,
    job: Arc<Job>,
    key: String,
    descriptor: BlockDescriptor,
    progress: Progress,
    ctx: TaskContext,
) -> Result<(), SyncError> {
    if ctx.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    let data = shared
        .api
        .download_block(&descriptor.url, &descriptor.token)
        .await?;

    let cache = shared.cache.clone();
    let index = descriptor.index;
    let hash = descriptor.hash.clone();
    let size = data.len() as u64;
    let path =
        tokio::task::spawn_blocking(move || cache.write_block(&key, index, &data, &hash)).await??;

    let mut block = Block::new(index, size, descriptor.hash, path);
    block.remote_url = Some(descriptor.url);
    block.is_uploaded = true;
    job.blocks().push(block);
    progress.advance(1);
    trace!(node = %job.node, index, "block downloaded");
    Ok(())
}

/// Records the downloaded blocks on the active revision in one
/// transaction. An empty revision gets a zero-length file instead.
async fn attach_blocks(shared: Arc<Shared>, job: Arc<Job>, ctx: TaskContext) -> Result<(), SyncError> {
    let revision = job.revision().clone().ok_or_else(|| {
        SyncError::InvalidState(format!("{} has no revision metadata", job.node))
    })?;
    if ctx.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    let mut blocks = std::mem::take(&mut *job.blocks());
    blocks.sort_by_key(|b| b.index);
    if blocks.len() != revision.blocks.len() {
        return Err(SyncError::BlockMetadataMissing {
            node: job.node.clone(),
            reason: format!(
                "downloaded {} of {} blocks",
                blocks.len(),
                revision.blocks.len()
            ),
        });
    }

    let local_path = if blocks.is_empty() {
        let cache = shared.cache.clone();
        let key = revision.id.0.clone();
        tokio::task::spawn_blocking(move || cache.write_empty(&key)).await??
    } else {
        shared.cache.entry_path(revision.id.as_str())?
    };

    let count = blocks.len();
    store::update_node(&*shared.store, &job.node, |node| {
        let mut active = match node.active_revision.take() {
            Some(r) if r.id.as_ref() == Some(&revision.id) => r,
            _ => Revision::committed(revision.id.clone()),
        };
        active.blocks = blocks;
        active.manifest_signature = revision.manifest_signature.clone();
        active.signature_address = revision.signature_address.clone();
        active.local_path = Some(local_path);
        node.active_revision = Some(active);
        Ok(())
    })?;
    job.progress.finish();
    debug!(node = %job.node, revision = %revision.id, blocks = count, "revision content attached");
    Ok(())
}
