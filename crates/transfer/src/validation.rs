use std::path::{Component, Path};

use crate::TransferError;

/// Validates that a cache key is a single plain path component.
///
/// Keys come from remote ids, so anything that could address outside the
/// cache root is rejected: empty keys, separators, `.`/`..`, absolute
/// paths and Windows prefixes.
pub fn validate_cache_key(key: &str) -> Result<(), TransferError> {
    if key.is_empty() {
        return Err(TransferError::InvalidPath("empty cache key".into()));
    }
    if key.contains('/') || key.contains('\\') {
        return Err(TransferError::InvalidPath(format!(
            "separator in cache key: {key}"
        )));
    }

    let mut components = Path::new(key).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(TransferError::InvalidPath(format!(
            "cache key is not a plain name: {key}"
        ))),
    }
}
