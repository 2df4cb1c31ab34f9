//! Folder enumeration and recursive tree scans.
//!
//! A folder is listed page by page; a page shorter than the page size is
//! the last one. Tree scans run one task per folder, each child folder
//! depending on its parent's listing, and hand files whose content is not
//! cached to the [`Downloader`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nimbus_protocol::{Node, NodeId, NodeState};
use nimbus_transfer::{Task, TaskContext, TaskHandle, TaskId, TaskOutcome, TaskScheduler};
use tracing::{debug, info, warn};

use crate::api::CloudApi;
use crate::config::EngineConfig;
use crate::download::downloader::{DownloadHandle, Downloader};
use crate::error::SyncError;
use crate::store::{self, MetadataStore};

/// Position of a paged folder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor {
    pub page_size: u32,
    pub include_deleted: bool,
    last_fetched_page: Option<u32>,
    finished: bool,
}

impl ScanCursor {
    pub fn new(page_size: u32, include_deleted: bool) -> Self {
        Self {
            page_size: page_size.max(1),
            include_deleted,
            last_fetched_page: None,
            finished: false,
        }
    }

    pub fn last_fetched_page(&self) -> Option<u32> {
        self.last_fetched_page
    }

    /// Next page to request, or `None` once the last page has been seen.
    pub fn next_page(&self) -> Option<u32> {
        if self.finished {
            return None;
        }
        Some(self.last_fetched_page.map_or(0, |p| p + 1))
    }

    /// Records a fetched page holding `count` children. Returns `true` if
    /// it was the last page.
    pub fn record(&mut self, page: u32, count: usize) -> bool {
        self.last_fetched_page = Some(page);
        self.finished = count < self.page_size as usize;
        self.finished
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Returns `true` if `node` is a live file whose active revision has no
/// cached content on disk.
pub fn needs_download(node: &Node) -> bool {
    if node.is_folder() || node.state != NodeState::Active {
        return false;
    }
    match &node.active_revision {
        Some(revision) if revision.id.is_some() => !revision
            .local_path
            .as_deref()
            .is_some_and(|path| path.exists()),
        _ => false,
    }
}

/// Lists folders and walks trees, persisting every child it sees.
///
/// Cloning yields another handle to the same schedulers.
#[derive(Clone)]
pub struct TreeScanner {
    api: Arc<dyn CloudApi>,
    store: Arc<dyn MetadataStore>,
    downloader: Option<Downloader>,
    page_size: u32,
    include_deleted: bool,
    tree: TaskScheduler<SyncError>,
    roots: TaskScheduler<SyncError>,
}

impl TreeScanner {
    pub fn new(
        config: &EngineConfig,
        api: Arc<dyn CloudApi>,
        store: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            api,
            store,
            downloader: None,
            page_size: config.page_size,
            include_deleted: config.include_deleted,
            tree: TaskScheduler::new(config.tree_scan_concurrency),
            roots: TaskScheduler::new(config.multi_root_scan_concurrency),
        }
    }

    /// Downloads files found without cached content during tree scans.
    pub fn with_downloader(mut self, downloader: Downloader) -> Self {
        self.downloader = Some(downloader);
        self
    }

    /// Schedulers running folder listings, for suspension.
    pub fn schedulers(&self) -> Vec<TaskScheduler<SyncError>> {
        vec![self.tree.clone(), self.roots.clone()]
    }

    /// Lists every child of `folder`, persisting each page as it arrives.
    ///
    /// The folder is marked fully fetched after the last page. A failing
    /// page stops the listing; earlier pages stay persisted.
    pub async fn scan_folder(&self, folder: &NodeId) -> Result<Vec<Node>, SyncError> {
        let mut cursor = ScanCursor::new(self.page_size, self.include_deleted);
        let mut children = Vec::new();

        while let Some(page) = cursor.next_page() {
            let batch = self
                .api
                .list_folder_children(folder, page, cursor.page_size, cursor.include_deleted)
                .await
                .inspect_err(|e| warn!(folder = %folder, page, error = %e, "listing failed"))?;
            let last = cursor.record(page, batch.len());
            debug!(folder = %folder, page, count = batch.len(), last, "listed page");

            let merged = store::write(&*self.store, |tx| {
                let mut merged = Vec::with_capacity(batch.len());
                for child in batch {
                    let row = match tx.fetch_one(&child.id) {
                        Some(mut local) => {
                            local.merge_remote(child);
                            local
                        }
                        None => child,
                    };
                    tx.upsert(row.clone());
                    merged.push(row);
                }
                if last {
                    match tx.fetch_one(folder) {
                        Some(mut parent) => {
                            parent.children_fully_fetched = true;
                            tx.upsert(parent);
                        }
                        None => warn!(folder = %folder, "listed folder is not stored"),
                    }
                }
                Ok(merged)
            })?;
            children.extend(merged);
        }

        info!(folder = %folder, children = children.len(), "folder fully fetched");
        Ok(children)
    }

    /// Recursively scans the tree under `root`, one level at a time.
    ///
    /// Returns every node found, or a compound error listing each folder
    /// listing or download that failed.
    pub async fn scan_tree(&self, root: &NodeId) -> Result<Vec<Node>, SyncError> {
        self.scan(&self.tree, std::slice::from_ref(root)).await
    }

    /// Scans several independent trees with the multi-root concurrency.
    pub async fn scan_roots(&self, roots: &[NodeId]) -> Result<Vec<Node>, SyncError> {
        self.scan(&self.roots, roots).await
    }

    async fn scan(
        &self,
        scheduler: &TaskScheduler<SyncError>,
        roots: &[NodeId],
    ) -> Result<Vec<Node>, SyncError> {
        let run = Arc::new(ScanRun {
            scanner: self.clone(),
            scheduler: scheduler.clone(),
            pending: Mutex::new(Vec::new()),
            found: Mutex::new(Vec::new()),
        });
        for root in roots {
            run.submit_folder(root.clone(), &[]);
        }

        let mut errors = Vec::new();
        loop {
            let batch = std::mem::take(&mut *run.pending());
            if batch.is_empty() {
                break;
            }
            for item in batch {
                let result = match item {
                    Pending::Folder(handle) => match handle.wait().await {
                        TaskOutcome::Finished => Ok(()),
                        TaskOutcome::Failed(e) => Err(e),
                        TaskOutcome::Cancelled => Err(SyncError::Cancelled),
                    },
                    Pending::Download(handle) => handle.wait().await.map(|_| ()),
                };
                if let Err(e) = result {
                    errors.push(e);
                }
            }
        }

        let found = std::mem::take(&mut *run.found());
        if errors.is_empty() {
            info!(roots = roots.len(), nodes = found.len(), "tree scan finished");
            Ok(found)
        } else {
            warn!(roots = roots.len(), failures = errors.len(), "tree scan had failures");
            Err(SyncError::CompoundScanFailure(errors))
        }
    }
}

enum Pending {
    Folder(TaskHandle<SyncError>),
    Download(DownloadHandle),
}

/// State of one tree scan shared by its folder tasks.
struct ScanRun {
    scanner: TreeScanner,
    scheduler: TaskScheduler<SyncError>,
    pending: Mutex<Vec<Pending>>,
    found: Mutex<Vec<Node>>,
}

impl ScanRun {
    fn pending(&self) -> MutexGuard<'_, Vec<Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn found(&self) -> MutexGuard<'_, Vec<Node>> {
        self.found.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit_folder(self: &Arc<Self>, folder: NodeId, deps: &[TaskId]) {
        let run = Arc::clone(self);
        let task: Task<SyncError> =
            Task::new(format!("scan {folder}"), move |ctx| run.scan_one(folder, ctx));
        let handle = self.scheduler.submit(task, deps);
        self.pending().push(Pending::Folder(handle));
    }

    async fn scan_one(self: Arc<Self>, folder: NodeId, ctx: TaskContext) -> Result<(), SyncError> {
        let children = self.scanner.scan_folder(&folder).await?;
        if ctx.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        for child in &children {
            if child.is_folder() {
                if child.state == NodeState::Active {
                    self.submit_folder(child.id.clone(), &[ctx.id()]);
                }
            } else if let Some(downloader) = &self.scanner.downloader
                && needs_download(child)
            {
                let handle = downloader.download(&child.id);
                self.pending().push(Pending::Download(handle));
            }
        }
        self.found().extend(children);
        Ok(())
    }
}
