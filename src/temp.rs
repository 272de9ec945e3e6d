//! Scoped temp files and directories
//!
//! Artifacts live exactly as long as the block they are handed to:
//! deletion is registered before the block runs and fires on every exit
//! path, including errors and panics.

use std::future::Future;
use std::path::PathBuf;

use scopeguard::defer;
use tracing::warn;

use crate::error::Result;
use crate::events::{EventBus, EventPayload};

fn unique_path(prefix: &str, suffix: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "{}-{}{}",
        prefix,
        uuid::Uuid::new_v4().simple(),
        suffix
    ))
}

fn remove_best_effort(path: &PathBuf, events: &EventBus) {
    let outcome = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match outcome {
        Ok(()) => {
            events.publish(EventPayload::TempCleanup { path: path.clone() });
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            events.publish(EventPayload::TempCleanup { path: path.clone() });
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to remove temp artifact");
        }
    }
}

/// Create a temp file, hand its path to `scope`, delete it afterwards
/// regardless of the outcome.
pub async fn with_temp_file<F, Fut, T>(
    events: &EventBus,
    prefix: &str,
    suffix: &str,
    scope: F,
) -> Result<T>
where
    F: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let path = unique_path(prefix, suffix);
    tokio::fs::write(&path, b"").await?;
    events.publish(EventPayload::TempCreate { path: path.clone() });

    defer! {
        remove_best_effort(&path, events);
    }
    scope(path.clone()).await
}

/// Create a temp directory, hand its path to `scope`, delete the whole
/// tree afterwards regardless of the outcome.
pub async fn with_temp_dir<F, Fut, T>(
    events: &EventBus,
    prefix: &str,
    scope: F,
) -> Result<T>
where
    F: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let path = unique_path(prefix, "");
    tokio::fs::create_dir_all(&path).await?;
    events.publish(EventPayload::TempCreate { path: path.clone() });

    defer! {
        remove_best_effort(&path, events);
    }
    scope(path.clone()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_file_removed_on_success() {
        let events = EventBus::new();
        let kept = with_temp_file(&events, "uex-test", ".txt", |path| async move {
            tokio::fs::write(&path, b"scratch").await?;
            assert!(path.exists());
            Ok(path)
        })
        .await
        .unwrap();
        assert!(!kept.exists());
    }

    #[tokio::test]
    async fn test_dir_removed_on_error() {
        let events = EventBus::new();
        let mut observed = None;
        let outcome: Result<()> = with_temp_dir(&events, "uex-test", |path| {
            observed = Some(path.clone());
            async move {
                tokio::fs::write(path.join("inner.txt"), b"x").await?;
                Err(Error::adapter("test", "forced failure"))
            }
        })
        .await;

        assert!(outcome.is_err());
        assert!(!observed.unwrap().exists(), "dir must be removed on error");
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let events = EventBus::new();
        let mut rx = events.subscribe_matching("temp:*");

        with_temp_file(&events, "uex-test", "", |_| async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().name(), "temp:create");
        assert_eq!(rx.recv().await.unwrap().name(), "temp:cleanup");
    }

    #[tokio::test]
    async fn test_unique_paths() {
        let a = unique_path("p", ".x");
        let b = unique_path("p", ".x");
        assert_ne!(a, b);
    }
}
