//! Download pipeline: folder scans and block-wise revision downloads.

pub mod downloader;
pub mod scanner;

pub use downloader::{DownloadHandle, Downloader};
pub use scanner::{ScanCursor, TreeScanner, needs_download};
