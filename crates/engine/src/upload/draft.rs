use std::path::PathBuf;

use nimbus_protocol::{Node, NodeCrypto, NodeId};

use crate::error::SyncError;
use crate::upload::state::{GraphState, ResumeState, graph_state};

/// Everything one upload attempt needs, captured once from the persisted
/// row.
///
/// Owned by a single attempt and never mutated after construction. Two
/// drafts are equal only if they are the same instance.
#[derive(Debug)]
pub struct UploadDraft {
    pub node_id: NodeId,
    pub upload_id: String,
    pub state: ResumeState,
    pub graph_state: GraphState,
    pub number_of_blocks: u32,
    /// Blocks already uploaded by an earlier attempt.
    pub uploaded_blocks: Vec<u32>,
    /// Blocks this attempt still has to upload.
    pub pending_blocks: Vec<u32>,
    pub parent_id: Option<NodeId>,
    pub parent_hash_key: Option<Vec<u8>>,
    pub name: String,
    pub crypto: NodeCrypto,
    pub has_active_revision: bool,
    pub local_content: Option<PathBuf>,
}

impl PartialEq for UploadDraft {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for UploadDraft {}

impl UploadDraft {
    /// Builds the draft for `node` in resume state `state`.
    ///
    /// New content is split into `ceil(size / max_block_size)` blocks; once
    /// encrypted, the persisted block rows are authoritative.
    pub fn new(
        node: &Node,
        state: ResumeState,
        parent_hash_key: Option<Vec<u8>>,
        max_block_size: usize,
    ) -> Result<Self, SyncError> {
        let persisted = node.draft_revision.as_ref().filter(|d| {
            matches!(
                state,
                ResumeState::UploadingRevision | ResumeState::SealingRevision
            ) && d.is_draft()
        });

        let (number_of_blocks, uploaded_blocks, pending_blocks) = match persisted {
            Some(draft) => {
                let mut uploaded: Vec<u32> = draft
                    .blocks
                    .iter()
                    .filter(|b| b.is_uploaded)
                    .map(|b| b.index)
                    .collect();
                uploaded.sort_unstable();
                (
                    draft.blocks.len() as u32,
                    uploaded,
                    draft.pending_block_indices(),
                )
            }
            None => {
                let size = match node.clear_content_path.as_deref() {
                    Some(path) => std::fs::metadata(path)?.len(),
                    None => node.size,
                };
                let blocks = size.div_ceil(max_block_size.max(1) as u64) as u32;
                (blocks, Vec::new(), (0..blocks).collect())
            }
        };

        let upload_id = node
            .upload_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Self {
            node_id: node.id.clone(),
            upload_id,
            state,
            graph_state: graph_state(state, node),
            number_of_blocks,
            uploaded_blocks,
            pending_blocks,
            parent_id: node.parent_id.clone(),
            parent_hash_key,
            name: node.name.clone(),
            crypto: node.crypto.clone(),
            has_active_revision: node.active_revision.is_some(),
            local_content: node.clear_content_path.clone(),
        })
    }

    /// Progress units of a stage that scales with content.
    pub fn content_units(&self) -> u64 {
        u64::from(self.number_of_blocks) + 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_protocol::{Block, Revision, UploadState};
    use tempfile::TempDir;

    #[test]
    fn new_content_is_split_by_block_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clear.bin");
        std::fs::write(&path, vec![7u8; 10]).unwrap();

        let mut node = Node::file("n1", Some(NodeId::from("p")), "a", 10);
        node.upload_id = Some("up-1".into());
        node.clear_content_path = Some(path);

        let draft = UploadDraft::new(&node, ResumeState::UploadingDraft, None, 4).unwrap();
        assert_eq!(draft.number_of_blocks, 3);
        assert_eq!(draft.pending_blocks, vec![0, 1, 2]);
        assert_eq!(draft.upload_id, "up-1");
        assert_eq!(draft.content_units(), 5);
        assert_eq!(draft.graph_state, GraphState::EncryptingRevision);
    }

    #[test]
    fn resumed_draft_uses_persisted_blocks() {
        let mut node = Node::file("n1", None, "a", 10);
        node.draft_revision = Some(Revision {
            upload_state: Some(UploadState::Encrypted),
            blocks: (0..3)
                .map(|i| Block {
                    is_uploaded: i < 2,
                    ..Block::new(i, 4, "h", PathBuf::from(format!("/c/{i}")))
                })
                .collect(),
            ..Revision::draft()
        });

        let draft = UploadDraft::new(&node, ResumeState::UploadingRevision, None, 4).unwrap();
        assert_eq!(draft.number_of_blocks, 3);
        assert_eq!(draft.uploaded_blocks, vec![0, 1]);
        assert_eq!(draft.pending_blocks, vec![2]);
    }

    #[test]
    fn equality_is_identity() {
        let node = Node::file("n1", None, "a", 0);
        let a = UploadDraft::new(&node, ResumeState::UploadingDraft, None, 4).unwrap();
        let b = UploadDraft::new(&node, ResumeState::UploadingDraft, None, 4).unwrap();
        assert_eq!(a, a);
        assert_ne!(a, b);
    }
}
