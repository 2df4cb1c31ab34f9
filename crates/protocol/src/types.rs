use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::base64_bytes;

/// Identifier of a file or folder node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Remote identifier of a revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(pub String);

impl RevisionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RevisionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

/// Remote lifecycle of a node. Listing may include trashed/deleted items on request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    #[default]
    Active,
    Trashed,
    Deleted,
}

/// Progress of a draft revision: `created -> encrypted -> uploaded`, then committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Created,
    Encrypted,
    Uploaded,
}

/// Opaque key material carried by a node. Never interpreted by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCrypto {
    #[serde(default, with = "base64_bytes")]
    pub content_key_packet: Vec<u8>,
    #[serde(default, with = "base64_bytes")]
    pub node_key: Vec<u8>,
    #[serde(default, with = "base64_bytes")]
    pub node_passphrase: Vec<u8>,
    /// Key used to hash the names of this folder's children.
    #[serde(default, with = "base64_bytes")]
    pub node_hash_key: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name_hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature_address: String,
}

/// One content block of a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// 0-based, contiguous within a revision.
    pub index: u32,
    pub size: u64,
    /// Hex SHA-256 of the ciphertext.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    /// Location of the ciphertext on local disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_token: Option<String>,
    #[serde(default)]
    pub is_uploaded: bool,
}

impl Block {
    pub fn new(index: u32, size: u64, hash: impl Into<String>, local_path: PathBuf) -> Self {
        Self {
            index,
            size,
            hash: hash.into(),
            local_path: Some(local_path),
            remote_url: None,
            upload_token: None,
            is_uploaded: false,
        }
    }

    /// Returns `true` once an upload URL and token have been assigned.
    pub fn has_upload_link(&self) -> bool {
        self.remote_url.is_some() && self.upload_token.is_some()
    }
}

/// A version of a file's content.
///
/// A committed revision has `upload_state == None`; a draft carries its
/// progress. The remote `id` is absent until the draft has been created
/// on the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RevisionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_state: Option<UploadState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<Block>,
    #[serde(default, with = "base64_bytes")]
    pub manifest_signature: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature_address: String,
    /// Local ciphertext location: the block directory, or a zero-length
    /// file for an empty revision. Set once content is fully downloaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl Revision {
    /// Creates a local draft revision in the `created` state.
    pub fn draft() -> Self {
        Self {
            id: None,
            upload_state: Some(UploadState::Created),
            blocks: Vec::new(),
            manifest_signature: Vec::new(),
            signature_address: String::new(),
            local_path: None,
            created_at: Utc::now(),
        }
    }

    /// Creates a committed revision known by its remote id.
    pub fn committed(id: RevisionId) -> Self {
        Self {
            id: Some(id),
            upload_state: None,
            ..Self::draft()
        }
    }

    pub fn is_draft(&self) -> bool {
        self.upload_state.is_some()
    }

    pub fn block(&self, index: u32) -> Option<&Block> {
        self.blocks.iter().find(|b| b.index == index)
    }

    pub fn block_mut(&mut self, index: u32) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.index == index)
    }

    /// A revision is sealable only when every block reports uploaded.
    pub fn all_blocks_uploaded(&self) -> bool {
        self.blocks.iter().all(|b| b.is_uploaded)
    }

    pub fn uploaded_block_count(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_uploaded).count()
    }

    /// Indices of blocks still waiting for upload, in ascending order.
    pub fn pending_block_indices(&self) -> Vec<u32> {
        let mut pending: Vec<u32> = self
            .blocks
            .iter()
            .filter(|b| !b.is_uploaded)
            .map(|b| b.index)
            .collect();
        pending.sort_unstable();
        pending
    }
}

/// A file or folder: the transfer target of both pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
    pub kind: NodeKind,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub state: NodeState,
    #[serde(default)]
    pub crypto: NodeCrypto,
    /// Set while an upload of local content is requested and not yet committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    /// Cleartext source of a pending upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clear_content_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_revision: Option<Revision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_revision: Option<Revision>,
    /// Folders only: every child page has been listed.
    #[serde(default)]
    pub children_fully_fetched: bool,
}

impl Node {
    pub fn file(id: impl Into<String>, parent_id: Option<NodeId>, name: impl Into<String>, size: u64) -> Self {
        Self {
            id: NodeId::new(id),
            parent_id,
            kind: NodeKind::File,
            name: name.into(),
            size,
            state: NodeState::Active,
            crypto: NodeCrypto::default(),
            upload_id: None,
            clear_content_path: None,
            active_revision: None,
            draft_revision: None,
            children_fully_fetched: false,
        }
    }

    pub fn folder(id: impl Into<String>, parent_id: Option<NodeId>, name: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Folder,
            ..Self::file(id, parent_id, name, 0)
        }
    }

    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }

    /// Returns `true` if persisted state shows upload work left to do.
    pub fn has_pending_upload(&self) -> bool {
        self.kind == NodeKind::File && (self.draft_revision.is_some() || self.upload_id.is_some())
    }

    /// Merges metadata fetched from the remote into this local row,
    /// keeping local-only transfer state intact.
    pub fn merge_remote(&mut self, remote: Node) {
        let local_active = self.active_revision.take();
        self.parent_id = remote.parent_id;
        self.name = remote.name;
        self.size = remote.size;
        self.state = remote.state;
        self.crypto = remote.crypto;
        self.active_revision = match (local_active, remote.active_revision) {
            // Same revision: keep the locally downloaded blocks.
            (Some(local), Some(remote)) if local.id == remote.id => Some(local),
            (_, remote) => remote,
        };
    }
}
