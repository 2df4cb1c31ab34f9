//! Resumable upload and download pipelines for an encrypted cloud drive.
//!
//! The engine is a library with no transport of its own. The embedding
//! application provides a [`CloudApi`], a [`MetadataStore`] and a
//! [`ContentCipher`]; the engine drives transfers through them.
//!
//! # Upload
//!
//! 1. **Classify**: derive the resume point from the persisted node
//! 2. **Encrypt**: split the cleartext into blocks and encrypt them
//! 3. **Draft**: create the remote draft revision
//! 4. **Upload**: request links and upload the pending blocks
//! 5. **Seal**: sign the manifest and commit the revision
//!
//! # Download
//!
//! Folders are listed page by page; files without cached content are
//! fetched block by block and attached to their revision once complete.

pub mod api;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod store;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiFuture, CloudApi, ContentCipher};
pub use config::EngineConfig;
pub use download::{DownloadHandle, Downloader, ScanCursor, TreeScanner};
pub use engine::SyncEngine;
pub use error::SyncError;
pub use events::{Direction, TransferEvent};
pub use store::{MemoryStore, MetadataStore, StoreTransaction};
pub use upload::{GraphPolicy, ResumeState, UploadHandle, Uploader, classify};
