//! Stage task bodies of the upload graph.
//!
//! Each stage receives the [`StageContext`] explicitly and touches the
//! store only through short transactions between network calls.

use std::path::PathBuf;
use std::sync::Arc;

use nimbus_protocol::{
    Block, BlockUploadRequest, FileDraftParams, Revision, RevisionId, UploadState,
};
use nimbus_transfer::{BlockCache, ChunkReader, Progress, TaskContext};
use tracing::{debug, info, trace, warn};

use crate::api::{CloudApi, ContentCipher};
use crate::error::SyncError;
use crate::store::{self, MetadataStore};
use crate::upload::draft::UploadDraft;

/// Collaborators shared by every stage task.
#[derive(Clone)]
pub struct StageContext {
    pub api: Arc<dyn CloudApi>,
    pub store: Arc<dyn MetadataStore>,
    pub cipher: Arc<dyn ContentCipher>,
    pub cache: BlockCache,
    pub max_block_size: usize,
}

fn missing_draft(draft: &UploadDraft) -> SyncError {
    SyncError::InvalidState(format!("{} has no draft revision", draft.node_id))
}

/// Splits the cleartext into blocks, encrypts them into the block cache
/// and records the block rows.
pub async fn encrypt(
    ctx: StageContext,
    draft: Arc<UploadDraft>,
    progress: Progress,
    task: TaskContext,
) -> Result<(), SyncError> {
    // From here on a crash resumes at encryption.
    store::update_node(&*ctx.store, &draft.node_id, |node| {
        node.upload_id.get_or_insert_with(|| draft.upload_id.clone());
        if node.draft_revision.is_none() {
            node.draft_revision = Some(Revision::draft());
        }
        Ok(())
    })?;

    let path = match draft.local_content.clone() {
        Some(path) if path.exists() => path,
        other => {
            return Err(SyncError::ContentLost {
                node: draft.node_id.clone(),
                path: other.unwrap_or_default(),
            });
        }
    };

    let cipher = Arc::clone(&ctx.cipher);
    let cache = ctx.cache.clone();
    let upload_id = draft.upload_id.clone();
    let crypto = draft.crypto.clone();
    let block_size = ctx.max_block_size;
    let cancel = task.cancellation_token().clone();
    let stage = progress.clone();

    let blocks = tokio::task::spawn_blocking(move || -> Result<Vec<Block>, SyncError> {
        let mut reader = ChunkReader::new(&path, block_size)?;
        let mut blocks = Vec::with_capacity(reader.block_count() as usize);
        while let Some(chunk) = reader.next_chunk()? {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let encrypted = cipher.encrypt_block(&crypto, chunk.index, &chunk.data)?;
            let hash = cipher.content_hash(&encrypted);
            let local = cache.write_block(&upload_id, chunk.index, &encrypted, &hash)?;
            blocks.push(Block::new(chunk.index, encrypted.len() as u64, hash, local));
            stage.advance(1);
        }
        Ok(blocks)
    })
    .await??;

    if blocks.len() as u32 != draft.number_of_blocks {
        return Err(SyncError::InvalidState(format!(
            "content of {} changed during upload: expected {} blocks, read {}",
            draft.node_id,
            draft.number_of_blocks,
            blocks.len()
        )));
    }

    let count = blocks.len();
    store::update_node(&*ctx.store, &draft.node_id, |node| {
        let revision = node
            .draft_revision
            .as_mut()
            .ok_or_else(|| missing_draft(&draft))?;
        revision.blocks = blocks;
        revision.upload_state = Some(UploadState::Encrypted);
        Ok(())
    })?;
    progress.finish();
    debug!(node = %draft.node_id, blocks = count, "content encrypted");
    Ok(())
}

/// Creates the remote draft unless one already exists, returning its id.
pub async fn create_draft(
    ctx: &StageContext,
    draft: &UploadDraft,
    task: &TaskContext,
) -> Result<RevisionId, SyncError> {
    let node = store::load_node(&*ctx.store, &draft.node_id)?;
    let revision = node
        .draft_revision
        .as_ref()
        .ok_or_else(|| missing_draft(draft))?;
    if let Some(id) = &revision.id {
        trace!(node = %node.id, revision = %id, "remote draft already exists");
        return Ok(id.clone());
    }
    if task.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    let revision_id = if node.active_revision.is_some() {
        ctx.api.create_revision_draft(&node.id).await?
    } else {
        let parent_id = draft.parent_id.clone().ok_or_else(|| {
            SyncError::InvalidState(format!("{} has no parent folder", draft.node_id))
        })?;
        let name_hash = ctx
            .cipher
            .hash_name(draft.parent_hash_key.as_deref().unwrap_or_default(), &draft.name)?;
        let params = FileDraftParams {
            node_id: node.id.clone(),
            parent_id,
            name: draft.name.clone(),
            name_hash,
            content_key_packet: draft.crypto.content_key_packet.clone(),
            node_key: draft.crypto.node_key.clone(),
            node_passphrase: draft.crypto.node_passphrase.clone(),
            signature_address: draft.crypto.signature_address.clone(),
        };
        let created = ctx.api.create_file_draft(&params).await?;
        if created.node_id != node.id {
            warn!(node = %node.id, remote = %created.node_id, "remote reported a different node id");
        }
        created.revision_id
    };

    store::update_node(&*ctx.store, &draft.node_id, |node| {
        let revision = node
            .draft_revision
            .as_mut()
            .ok_or_else(|| missing_draft(draft))?;
        revision.id = Some(revision_id.clone());
        Ok(())
    })?;
    info!(node = %draft.node_id, revision = %revision_id, "remote draft created");
    Ok(revision_id)
}

/// Requests upload links for every block not yet uploaded. With
/// `create_draft_first` the remote draft is created beforehand if needed.
pub async fn request_links(
    ctx: StageContext,
    draft: Arc<UploadDraft>,
    create_draft_first: bool,
    task: TaskContext,
) -> Result<(), SyncError> {
    if create_draft_first {
        create_draft(&ctx, &draft, &task).await?;
    }

    let node = store::load_node(&*ctx.store, &draft.node_id)?;
    let revision = node
        .draft_revision
        .as_ref()
        .ok_or_else(|| missing_draft(&draft))?;
    let revision_id = revision.id.clone().ok_or_else(|| {
        SyncError::InvalidState(format!("{} has no remote draft", draft.node_id))
    })?;
    let requests: Vec<BlockUploadRequest> = revision
        .blocks
        .iter()
        .filter(|b| !b.is_uploaded)
        .map(|b| BlockUploadRequest {
            index: b.index,
            size: b.size,
            hash: b.hash.clone(),
        })
        .collect();
    if requests.is_empty() {
        return Ok(());
    }
    if task.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    let links = ctx
        .api
        .request_block_upload_links(&revision_id, &requests)
        .await?;

    store::update_node(&*ctx.store, &draft.node_id, |node| {
        let revision = node
            .draft_revision
            .as_mut()
            .ok_or_else(|| missing_draft(&draft))?;
        for link in &links {
            let Some(block) = revision.block_mut(link.index) else {
                return Err(SyncError::BlockMetadataMissing {
                    node: draft.node_id.clone(),
                    reason: format!("link for unknown block {}", link.index),
                });
            };
            block.remote_url = Some(link.url.clone());
            block.upload_token = Some(link.token.clone());
        }
        if let Some(block) = revision
            .blocks
            .iter()
            .find(|b| !b.is_uploaded && !b.has_upload_link())
        {
            return Err(SyncError::BlockMetadataMissing {
                node: draft.node_id.clone(),
                reason: format!("no upload link for block {}", block.index),
            });
        }
        Ok(())
    })?;
    debug!(node = %draft.node_id, links = links.len(), "upload links assigned");
    Ok(())
}

/// Uploads one encrypted block and marks it uploaded.
///
/// The block is recorded even if the task was cancelled meanwhile, so the
/// next attempt does not upload it again.
pub async fn upload_block(
    ctx: StageContext,
    draft: Arc<UploadDraft>,
    index: u32,
    progress: Progress,
    task: TaskContext,
) -> Result<(), SyncError> {
    let node = store::load_node(&*ctx.store, &draft.node_id)?;
    let block = node
        .draft_revision
        .as_ref()
        .and_then(|d| d.block(index).cloned())
        .ok_or_else(|| SyncError::BlockMetadataMissing {
            node: draft.node_id.clone(),
            reason: format!("block {index} not recorded"),
        })?;
    if block.is_uploaded {
        progress.advance(1);
        return Ok(());
    }

    let (Some(url), Some(token), Some(path)) =
        (block.remote_url, block.upload_token, block.local_path)
    else {
        return Err(SyncError::BlockMetadataMissing {
            node: draft.node_id.clone(),
            reason: format!("block {index} lacks link or ciphertext"),
        });
    };

    let hash = block.hash;
    let bytes = tokio::task::spawn_blocking(move || BlockCache::read_block(&path, index, &hash))
        .await??;
    if task.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    ctx.api.upload_block_bytes(&url, &token, bytes).await?;

    store::update_node(&*ctx.store, &draft.node_id, |node| {
        let revision = node
            .draft_revision
            .as_mut()
            .ok_or_else(|| missing_draft(&draft))?;
        if let Some(block) = revision.block_mut(index) {
            block.is_uploaded = true;
        }
        if revision.all_blocks_uploaded() {
            revision.upload_state = Some(UploadState::Uploaded);
        }
        Ok(())
    })?;
    progress.advance(1);
    trace!(node = %draft.node_id, index, "block uploaded");
    Ok(())
}

/// Verifies every block is uploaded, commits the revision with a signed
/// manifest and promotes the draft to the active revision.
pub async fn seal(
    ctx: StageContext,
    draft: Arc<UploadDraft>,
    progress: Progress,
    task: TaskContext,
) -> Result<(), SyncError> {
    let node = store::load_node(&*ctx.store, &draft.node_id)?;
    let revision = node
        .draft_revision
        .clone()
        .ok_or_else(|| missing_draft(&draft))?;
    if !revision.all_blocks_uploaded() {
        return Err(SyncError::RevisionSealFailedInvalidState {
            node: draft.node_id.clone(),
            uploaded: revision.uploaded_block_count(),
            total: revision.blocks.len(),
        });
    }
    let revision_id = revision.id.clone().ok_or_else(|| {
        SyncError::InvalidState(format!("{} has no remote draft", draft.node_id))
    })?;

    if revision.upload_state != Some(UploadState::Uploaded) {
        store::update_node(&*ctx.store, &draft.node_id, |node| {
            if let Some(d) = node.draft_revision.as_mut() {
                d.upload_state = Some(UploadState::Uploaded);
            }
            Ok(())
        })?;
    }

    let mut blocks = revision.blocks.clone();
    blocks.sort_by_key(|b| b.index);
    let hashes: Vec<String> = blocks.into_iter().map(|b| b.hash).collect();
    let signature = ctx.cipher.sign_manifest(&node.crypto, &hashes)?;
    if task.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    ctx.api.commit_revision(&revision_id, &signature).await?;

    let local_path: PathBuf = if revision.blocks.is_empty() {
        let cache = ctx.cache.clone();
        let key = draft.upload_id.clone();
        tokio::task::spawn_blocking(move || cache.write_empty(&key)).await??
    } else {
        ctx.cache.entry_path(&draft.upload_id)?
    };

    store::update_node(&*ctx.store, &draft.node_id, |node| {
        let mut committed = node
            .draft_revision
            .take()
            .ok_or_else(|| missing_draft(&draft))?;
        committed.upload_state = None;
        committed.manifest_signature = signature;
        committed.signature_address = node.crypto.signature_address.clone();
        committed.local_path = Some(local_path);
        node.active_revision = Some(committed);
        node.upload_id = None;
        node.clear_content_path = None;
        Ok(())
    })?;
    progress.finish();
    info!(node = %draft.node_id, revision = %revision_id, blocks = hashes.len(), "revision committed");
    Ok(())
}
