//! Persisted and remote data model shared by the Nimbus transfer crates.
//!
//! Key material and signatures are opaque blobs: they are carried between
//! the metadata store and the remote API, never interpreted here.

pub mod messages;
pub mod types;

pub use messages::{
    BlockDescriptor, BlockUploadLink, BlockUploadRequest, DraftCreated, FileDraftParams,
    RevisionMetadata,
};
pub use types::{
    Block, Node, NodeCrypto, NodeId, NodeKind, NodeState, Revision, RevisionId, UploadState,
};

/// base64 serde for opaque byte blobs.
pub(crate) mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
