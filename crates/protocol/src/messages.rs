//! Request and response payloads exchanged with the remote API.

use serde::{Deserialize, Serialize};

use crate::base64_bytes;
use crate::types::{NodeId, RevisionId};

// ---------------------------------------------------------------------------
// Upload direction
// ---------------------------------------------------------------------------

/// Parameters for creating a file draft (node + first draft revision).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDraftParams {
    /// Client-generated id the remote adopts for the new node.
    pub node_id: NodeId,
    pub parent_id: NodeId,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name_hash: String,
    #[serde(with = "base64_bytes")]
    pub content_key_packet: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub node_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub node_passphrase: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature_address: String,
}

/// Result of creating a file draft or a revision draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftCreated {
    pub node_id: NodeId,
    pub revision_id: RevisionId,
}

/// Describes one encrypted block for which an upload link is requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockUploadRequest {
    pub index: u32,
    pub size: u64,
    pub hash: String,
}

/// Upload target assigned to a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockUploadLink {
    pub index: u32,
    pub url: String,
    pub token: String,
}

// ---------------------------------------------------------------------------
// Download direction
// ---------------------------------------------------------------------------

/// Remote location of one block of a committed revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDescriptor {
    pub index: u32,
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    #[serde(default)]
    pub size: u64,
}

/// Full metadata of a revision, including its ordered block descriptors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionMetadata {
    pub id: RevisionId,
    pub node_id: NodeId,
    #[serde(default)]
    pub blocks: Vec<BlockDescriptor>,
    #[serde(default, with = "base64_bytes")]
    pub manifest_signature: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature_address: String,
}

impl RevisionMetadata {
    /// Returns the block descriptors sorted by index.
    pub fn ordered_blocks(&self) -> Vec<BlockDescriptor> {
        let mut blocks = self.blocks.clone();
        blocks.sort_by_key(|b| b.index);
        blocks
    }
}
