//! Resumption-state classification.
//!
//! Derives how far an upload has progressed purely from a node's persisted
//! attributes. Classification reads the row and checks whether local
//! content still exists; it never writes anything, so repeated calls on
//! unchanged state agree.

use std::path::Path;

use nimbus_protocol::{Node, UploadState};

use crate::error::SyncError;

/// How far an upload got, as recorded in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResumeState {
    /// Upload requested, nothing done yet.
    UploadingDraft,
    /// Draft row exists, content not encrypted yet.
    EncryptingRevision,
    /// Blocks encrypted, upload pending or partial.
    UploadingRevision,
    /// New content requested for a file that already has a revision.
    UpdateRevision,
    /// Every block uploaded, commit pending.
    SealingRevision,
    Finished,
}

/// First remaining stage of the graph, distinguishing a file's first
/// revision from a new revision of an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphState {
    EncryptingRevision,
    CreatingFileDraft,
    UploadingRevision,
    CommitingRevision,
    EncryptingNewRevision,
    CreatingNewRevision,
    None,
}

impl GraphState {
    /// Whether this state adds a revision to an already committed file.
    pub fn is_new_revision(self) -> bool {
        matches!(self, Self::EncryptingNewRevision | Self::CreatingNewRevision)
    }
}

fn content_present(node: &Node) -> bool {
    node.clear_content_path.as_deref().is_some_and(Path::exists)
}

fn require_content(node: &Node) -> Result<(), SyncError> {
    if content_present(node) {
        return Ok(());
    }
    Err(SyncError::ContentLost {
        node: node.id.clone(),
        path: node.clear_content_path.clone().unwrap_or_default(),
    })
}

/// Classifies the persisted upload state of `node`.
///
/// Checks run in a fixed order and the first match wins.
pub fn classify(node: &Node) -> Result<ResumeState, SyncError> {
    if node.is_folder() {
        return Err(SyncError::ClassificationFailed {
            node: node.id.clone(),
            reason: "folders carry no content".into(),
        });
    }

    // New content for a file that is already committed.
    if node.active_revision.is_some() && node.draft_revision.is_none() && node.upload_id.is_some()
    {
        require_content(node)?;
        return Ok(ResumeState::UpdateRevision);
    }

    let Some(draft) = &node.draft_revision else {
        return match (&node.active_revision, &node.upload_id) {
            (Some(_), _) => Ok(ResumeState::Finished),
            (None, Some(_)) => {
                require_content(node)?;
                Ok(ResumeState::UploadingDraft)
            }
            (None, None) => Err(SyncError::ClassificationFailed {
                node: node.id.clone(),
                reason: "no revision, draft or pending upload".into(),
            }),
        };
    };

    match draft.upload_state {
        Some(UploadState::Created) => {
            require_content(node)?;
            Ok(ResumeState::EncryptingRevision)
        }
        Some(UploadState::Encrypted) => {
            check_blocks(node)?;
            Ok(ResumeState::UploadingRevision)
        }
        Some(UploadState::Uploaded) => {
            check_blocks(node)?;
            Ok(ResumeState::SealingRevision)
        }
        None => Err(SyncError::ClassificationFailed {
            node: node.id.clone(),
            reason: "draft revision without upload state".into(),
        }),
    }
}

/// Block rows of an encrypted draft must be contiguous from 0 and point at
/// local ciphertext.
fn check_blocks(node: &Node) -> Result<(), SyncError> {
    let Some(draft) = &node.draft_revision else {
        return Ok(());
    };
    let mut indices: Vec<u32> = draft.blocks.iter().map(|b| b.index).collect();
    indices.sort_unstable();
    let contiguous = indices.iter().enumerate().all(|(i, index)| i as u32 == *index);
    if !contiguous {
        return Err(SyncError::BlockMetadataMissing {
            node: node.id.clone(),
            reason: format!("block indices not contiguous: {indices:?}"),
        });
    }
    if let Some(block) = draft
        .blocks
        .iter()
        .find(|b| !b.is_uploaded && b.local_path.is_none())
    {
        return Err(SyncError::BlockMetadataMissing {
            node: node.id.clone(),
            reason: format!("block {} has no local ciphertext", block.index),
        });
    }
    Ok(())
}

/// Maps a resume state to the first graph stage still to run.
pub fn graph_state(state: ResumeState, node: &Node) -> GraphState {
    let has_active = node.active_revision.is_some();
    let has_remote_draft = node
        .draft_revision
        .as_ref()
        .is_some_and(|d| d.id.is_some());

    match state {
        ResumeState::UploadingDraft => GraphState::EncryptingRevision,
        ResumeState::EncryptingRevision if has_active => GraphState::EncryptingNewRevision,
        ResumeState::EncryptingRevision => GraphState::EncryptingRevision,
        ResumeState::UpdateRevision => GraphState::EncryptingNewRevision,
        ResumeState::UploadingRevision if has_remote_draft => GraphState::UploadingRevision,
        ResumeState::UploadingRevision if has_active => GraphState::CreatingNewRevision,
        ResumeState::UploadingRevision => GraphState::CreatingFileDraft,
        ResumeState::SealingRevision => GraphState::CommitingRevision,
        ResumeState::Finished => GraphState::None,
    }
}
