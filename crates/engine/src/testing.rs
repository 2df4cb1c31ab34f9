//! Test doubles shared by the engine's unit tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nimbus_protocol::{
    BlockDescriptor, BlockUploadLink, BlockUploadRequest, DraftCreated, FileDraftParams, Node,
    NodeCrypto, NodeId, Revision, RevisionId, RevisionMetadata,
};
use nimbus_transfer::checksum_bytes;
use tokio::sync::Semaphore;

use crate::api::{ApiFuture, CloudApi, ContentCipher};
use crate::config::EngineConfig;
use crate::error::SyncError;

pub(crate) const BLOCK_HOST: &str = "https://blocks.test";

pub(crate) fn block_url(revision: &str, index: u32) -> String {
    format!("{BLOCK_HOST}/{revision}/{index}")
}

/// One recorded [`CloudApi`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    FetchNode(NodeId),
    FetchRevision(RevisionId),
    RequestLinks(RevisionId, Vec<u32>),
    UploadBlock(String),
    DownloadBlock(String),
    CreateFileDraft(NodeId),
    CreateRevisionDraft(NodeId),
    Commit(RevisionId),
    ListChildren(NodeId, u32),
}

type ListHook = Box<dyn Fn(&NodeId, u32) + Send + Sync>;

/// Scripted remote that records every call.
#[derive(Default)]
pub(crate) struct MockCloud {
    calls: Mutex<Vec<Call>>,
    nodes: Mutex<HashMap<NodeId, Node>>,
    revisions: Mutex<HashMap<RevisionId, RevisionMetadata>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    children: Mutex<HashMap<NodeId, Vec<Node>>>,
    failing_urls: Mutex<HashSet<String>>,
    failing_pages: Mutex<HashSet<(NodeId, u32)>>,
    upload_gate: Mutex<Option<Arc<Semaphore>>>,
    list_hook: Mutex<Option<ListHook>>,
    fail_commits: AtomicBool,
    next_revision: AtomicUsize,
}

impl MockCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn upload_calls(&self) -> usize {
        self.count(|c| matches!(c, Call::UploadBlock(_)))
    }

    pub fn download_calls(&self) -> usize {
        self.count(|c| matches!(c, Call::DownloadBlock(_)))
    }

    pub fn list_calls(&self) -> usize {
        self.count(|c| matches!(c, Call::ListChildren(..)))
    }

    pub fn commit_calls(&self) -> usize {
        self.count(|c| matches!(c, Call::Commit(_)))
    }

    pub fn uploaded(&self, url: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(url).cloned()
    }

    /// Serves `data` at `url` without touching the published hash.
    pub fn replace_blob(&self, url: &str, data: &[u8]) {
        self.blobs.lock().unwrap().insert(url.to_string(), data.to_vec());
    }

    pub fn set_children(&self, folder: &NodeId, children: Vec<Node>) {
        self.children.lock().unwrap().insert(folder.clone(), children);
    }

    pub fn fail_url(&self, url: impl Into<String>) {
        self.failing_urls.lock().unwrap().insert(url.into());
    }

    pub fn fail_page(&self, folder: &NodeId, page: u32) {
        self.failing_pages.lock().unwrap().insert((folder.clone(), page));
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Makes every block upload wait for a permit of the returned gate.
    pub fn gate_uploads(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.upload_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Runs `hook` with the folder and page of every listing request,
    /// before the page is served.
    pub fn on_list(&self, hook: impl Fn(&NodeId, u32) + Send + Sync + 'static) {
        *self.list_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Publishes `node` with a committed revision made of `blocks`
    /// ciphertext blocks. Returns the node as the remote reports it.
    pub fn publish_file(&self, mut node: Node, blocks: &[&[u8]]) -> Node {
        let revision_id = RevisionId::new(format!("rev-{}", node.id));
        let mut descriptors = Vec::new();
        for (index, data) in blocks.iter().enumerate() {
            let url = block_url(revision_id.as_str(), index as u32);
            self.blobs.lock().unwrap().insert(url.clone(), data.to_vec());
            descriptors.push(BlockDescriptor {
                index: index as u32,
                url,
                token: format!("dl-{index}"),
                hash: checksum_bytes(data),
                size: data.len() as u64,
            });
        }
        self.revisions.lock().unwrap().insert(
            revision_id.clone(),
            RevisionMetadata {
                id: revision_id.clone(),
                node_id: node.id.clone(),
                blocks: descriptors,
                manifest_signature: b"signed".to_vec(),
                signature_address: "owner@test".into(),
            },
        );
        node.active_revision = Some(Revision::committed(revision_id));
        self.nodes.lock().unwrap().insert(node.id.clone(), node.clone());
        node
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_revision(&self) -> RevisionId {
        let n = self.next_revision.fetch_add(1, Ordering::SeqCst) + 1;
        RevisionId::new(format!("rev-{n}"))
    }

    fn is_failing(&self, url: &str) -> bool {
        self.failing_urls.lock().unwrap().contains(url)
    }
}

impl CloudApi for MockCloud {
    fn fetch_node_metadata(&self, id: &NodeId) -> ApiFuture<'_, Node> {
        self.record(Call::FetchNode(id.clone()));
        let result = self
            .nodes
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::Api(format!("unknown node {id}")));
        Box::pin(async move { result })
    }

    fn fetch_revision_metadata(
        &self,
        _node: &NodeId,
        revision: &RevisionId,
    ) -> ApiFuture<'_, RevisionMetadata> {
        self.record(Call::FetchRevision(revision.clone()));
        let result = self
            .revisions
            .lock()
            .unwrap()
            .get(revision)
            .cloned()
            .ok_or_else(|| SyncError::Api(format!("unknown revision {revision}")));
        Box::pin(async move { result })
    }

    fn request_block_upload_links(
        &self,
        revision: &RevisionId,
        blocks: &[BlockUploadRequest],
    ) -> ApiFuture<'_, Vec<BlockUploadLink>> {
        self.record(Call::RequestLinks(
            revision.clone(),
            blocks.iter().map(|b| b.index).collect(),
        ));
        let links = blocks
            .iter()
            .map(|b| BlockUploadLink {
                index: b.index,
                url: block_url(revision.as_str(), b.index),
                token: format!("up-{}", b.index),
            })
            .collect();
        Box::pin(async move { Ok(links) })
    }

    fn upload_block_bytes(&self, url: &str, _token: &str, bytes: Vec<u8>) -> ApiFuture<'_, ()> {
        self.record(Call::UploadBlock(url.to_string()));
        let gate = self.upload_gate.lock().unwrap().clone();
        let url = url.to_string();
        Box::pin(async move {
            if let Some(gate) = gate {
                let _permit = gate
                    .acquire()
                    .await
                    .map_err(|_| SyncError::Api("gate closed".into()))?;
            }
            if self.is_failing(&url) {
                return Err(SyncError::Api(format!("upload to {url} rejected")));
            }
            self.blobs.lock().unwrap().insert(url, bytes);
            Ok(())
        })
    }

    fn download_block(&self, url: &str, _token: &str) -> ApiFuture<'_, Vec<u8>> {
        self.record(Call::DownloadBlock(url.to_string()));
        let result = if self.is_failing(url) {
            Err(SyncError::Api(format!("download of {url} failed")))
        } else {
            self.blobs
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| SyncError::Api(format!("no blob at {url}")))
        };
        Box::pin(async move { result })
    }

    fn create_file_draft(&self, params: &FileDraftParams) -> ApiFuture<'_, DraftCreated> {
        self.record(Call::CreateFileDraft(params.node_id.clone()));
        let created = DraftCreated {
            node_id: params.node_id.clone(),
            revision_id: self.next_revision(),
        };
        Box::pin(async move { Ok(created) })
    }

    fn create_revision_draft(&self, node: &NodeId) -> ApiFuture<'_, RevisionId> {
        self.record(Call::CreateRevisionDraft(node.clone()));
        let revision = self.next_revision();
        Box::pin(async move { Ok(revision) })
    }

    fn commit_revision(&self, revision: &RevisionId, _signature: &[u8]) -> ApiFuture<'_, ()> {
        self.record(Call::Commit(revision.clone()));
        let result = if self.fail_commits.load(Ordering::SeqCst) {
            Err(SyncError::Api("commit rejected".into()))
        } else {
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn list_folder_children(
        &self,
        folder: &NodeId,
        page: u32,
        page_size: u32,
        _include_deleted: bool,
    ) -> ApiFuture<'_, Vec<Node>> {
        self.record(Call::ListChildren(folder.clone(), page));
        if let Some(hook) = self.list_hook.lock().unwrap().as_ref() {
            hook(folder, page);
        }
        let result = if self
            .failing_pages
            .lock()
            .unwrap()
            .contains(&(folder.clone(), page))
        {
            Err(SyncError::Api(format!("listing {folder} page {page} failed")))
        } else {
            let children = self.children.lock().unwrap();
            let all = children.get(folder).map(Vec::as_slice).unwrap_or_default();
            let start = (page as usize * page_size as usize).min(all.len());
            let end = (start + page_size as usize).min(all.len());
            Ok(all[start..end].to_vec())
        };
        Box::pin(async move { result })
    }
}

/// Reversible stand-in for the real cipher.
pub(crate) struct XorCipher;

impl ContentCipher for XorCipher {
    fn encrypt_block(
        &self,
        _crypto: &NodeCrypto,
        index: u32,
        clear: &[u8],
    ) -> Result<Vec<u8>, SyncError> {
        Ok(clear.iter().map(|b| b ^ 0x5a ^ index as u8).collect())
    }

    fn sign_manifest(
        &self,
        _crypto: &NodeCrypto,
        block_hashes: &[String],
    ) -> Result<Vec<u8>, SyncError> {
        Ok(block_hashes.join(":").into_bytes())
    }

    fn hash_name(&self, parent_hash_key: &[u8], name: &str) -> Result<String, SyncError> {
        Ok(checksum_bytes(&[parent_hash_key, name.as_bytes()].concat()))
    }
}

/// Small blocks and serialized uploads so tests are deterministic.
pub(crate) fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        max_block_size: 4,
        upload_concurrency: 1,
        download_concurrency: 2,
        cache_dir: dir.join("cache"),
        ..EngineConfig::default()
    }
}

pub(crate) fn write_content(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

/// Polls `condition` until it holds, failing the test after a few seconds.
pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
