//! Diagnostic logging for failures coming out of delegated subsystems

use std::error::Error;
use tracing::error;

/// Log everything known about a failed operation and hand the error back
///
/// Emits the operation name with the error message, each error in the
/// `source()` chain, and the debug representation of the error. The error is
/// returned unchanged so call sites can re-raise it:
///
/// ```ignore
/// stack.start().await.map_err(|e| log_failure("startBridge", e))?;
/// ```
pub fn log_failure<E>(operation: &str, err: E) -> E
where
    E: Error + 'static,
{
    error!(operation = %operation, "Error executing function {}: {}", operation, err);

    let mut source = err.source();
    let mut depth = 1usize;
    while let Some(cause) = source {
        error!(operation = %operation, depth, "Caused by: {}", cause);
        source = cause.source();
        depth += 1;
    }

    error!(operation = %operation, "Full error object: {:?}", err);
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageError;

    #[test]
    fn test_log_failure_returns_error_unchanged() {
        let err = StorageError::InvalidName("a/b".to_string());
        let returned = log_failure("open", err);
        assert!(matches!(returned, StorageError::InvalidName(name) if name == "a/b"));
    }

    #[test]
    fn test_log_failure_walks_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = StorageError::from(io);
        let returned = log_failure("set", err);
        assert!(returned.source().is_some());
    }
}
