//! Collaborator seams: the remote API and the content cipher.
//!
//! The embedding application implements these on top of its HTTP client
//! and crypto stack. Keeping them as traits leaves the pipelines
//! transport-agnostic and testable with mocks.

use std::future::Future;
use std::pin::Pin;

use nimbus_protocol::{
    BlockUploadLink, BlockUploadRequest, DraftCreated, FileDraftParams, Node, NodeCrypto, NodeId,
    RevisionId, RevisionMetadata,
};
use nimbus_transfer::checksum_bytes;

use crate::error::SyncError;

/// Boxed future returned by [`CloudApi`] calls.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SyncError>> + Send + 'a>>;

/// Request/response access to the remote drive.
///
/// No call retries on its own; timeouts and backoff belong to the
/// implementation.
pub trait CloudApi: Send + Sync {
    fn fetch_node_metadata(&self, id: &NodeId) -> ApiFuture<'_, Node>;

    /// Fetches a committed revision including its block descriptors.
    fn fetch_revision_metadata(
        &self,
        node: &NodeId,
        revision: &RevisionId,
    ) -> ApiFuture<'_, RevisionMetadata>;

    fn request_block_upload_links(
        &self,
        revision: &RevisionId,
        blocks: &[BlockUploadRequest],
    ) -> ApiFuture<'_, Vec<BlockUploadLink>>;

    fn upload_block_bytes(&self, url: &str, token: &str, bytes: Vec<u8>) -> ApiFuture<'_, ()>;

    fn download_block(&self, url: &str, token: &str) -> ApiFuture<'_, Vec<u8>>;

    /// Creates a new file node together with its first draft revision.
    fn create_file_draft(&self, params: &FileDraftParams) -> ApiFuture<'_, DraftCreated>;

    /// Creates a draft revision on an existing file.
    fn create_revision_draft(&self, node: &NodeId) -> ApiFuture<'_, RevisionId>;

    fn commit_revision(&self, revision: &RevisionId, manifest_signature: &[u8])
    -> ApiFuture<'_, ()>;

    /// Lists one page of a folder's children. Pages are 0-based.
    fn list_folder_children(
        &self,
        folder: &NodeId,
        page: u32,
        page_size: u32,
        include_deleted: bool,
    ) -> ApiFuture<'_, Vec<Node>>;
}

/// Content and name encryption. Keys stay opaque to the engine.
pub trait ContentCipher: Send + Sync {
    /// Encrypts one cleartext block with the node's content key.
    fn encrypt_block(&self, crypto: &NodeCrypto, index: u32, clear: &[u8])
    -> Result<Vec<u8>, SyncError>;

    /// Signs the ordered list of block hashes of a revision.
    fn sign_manifest(&self, crypto: &NodeCrypto, block_hashes: &[String])
    -> Result<Vec<u8>, SyncError>;

    /// Hash of a name under the parent folder's hash key, used by the
    /// remote for collision checks.
    fn hash_name(&self, parent_hash_key: &[u8], name: &str) -> Result<String, SyncError>;

    /// Hash recorded for a ciphertext block.
    fn content_hash(&self, data: &[u8]) -> String {
        checksum_bytes(data)
    }
}
