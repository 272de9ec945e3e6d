//! SFTP file transfer over pooled connections
//!
//! One SFTP session is opened per operation on the pooled SSH handle
//! (sessions multiplex over the same connection as command channels).
//! Directory operations pre-scan, create directories shortest-first, then
//! move files under bounded concurrency, reporting each outcome through a
//! tick callback.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::client::Handle;
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::debug;

use super::client::ClientHandler;
use crate::error::{Error, Result};

/// Per-file progress callback: `(local, remote, error)`; `None` marks
/// success.
pub type TransferTick = Arc<dyn Fn(&str, &str, Option<&Error>) + Send + Sync>;

/// Outcome summary for a directory transfer.
#[derive(Debug, Clone, Default)]
pub struct DirTransferStats {
    /// Files considered.
    pub total_files: u64,
    /// Files transferred without error.
    pub transferred: u64,
    /// Bytes moved.
    pub bytes: u64,
    /// One message per failed file.
    pub errors: Vec<String>,
}

impl DirTransferStats {
    /// Whether every file transferred.
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Open an SFTP session on the pooled connection.
pub(crate) async fn open_session(handle: &Handle<ClientHandler>) -> Result<SftpSession> {
    let mut channel = handle.channel_open_session().await?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| Error::adapter("ssh", format!("sftp subsystem refused: {}", e)))?;
    SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| Error::adapter("ssh", format!("sftp session failed: {}", e)))
}

/// Upload one file. Returns bytes written.
pub(crate) async fn upload_file(
    sftp: &SftpSession,
    local: &Path,
    remote: &str,
) -> Result<u64> {
    let mut src = tokio::fs::File::open(local).await?;
    let mut dst = sftp
        .create(remote)
        .await
        .map_err(|e| Error::adapter("ssh", format!("sftp create {} failed: {}", remote, e)))?;
    let bytes = tokio::io::copy(&mut src, &mut dst)
        .await
        .map_err(|e| Error::adapter("ssh", format!("sftp write {} failed: {}", remote, e)))?;
    dst.shutdown()
        .await
        .map_err(|e| Error::adapter("ssh", format!("sftp close {} failed: {}", remote, e)))?;
    debug!(remote, bytes, "sftp upload complete");
    Ok(bytes)
}

/// Download one file. Returns bytes written.
pub(crate) async fn download_file(
    sftp: &SftpSession,
    remote: &str,
    local: &Path,
) -> Result<u64> {
    if let Some(parent) = local.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut src = sftp
        .open(remote)
        .await
        .map_err(|e| Error::adapter("ssh", format!("sftp open {} failed: {}", remote, e)))?;
    let mut dst = tokio::fs::File::create(local).await?;
    let bytes = tokio::io::copy(&mut src, &mut dst)
        .await
        .map_err(|e| Error::adapter("ssh", format!("sftp read {} failed: {}", remote, e)))?;
    dst.flush().await?;
    debug!(remote, bytes, "sftp download complete");
    Ok(bytes)
}

/// Create a remote directory and any missing ancestors.
pub(crate) async fn ensure_remote_dir(sftp: &SftpSession, remote: &str) -> Result<()> {
    let mut prefix = String::new();
    for component in remote.split('/').filter(|c| !c.is_empty()) {
        prefix.push('/');
        prefix.push_str(component);
        if sftp.metadata(prefix.as_str()).await.is_ok() {
            continue;
        }
        if let Err(e) = sftp.create_dir(prefix.as_str()).await {
            // Lost race with a concurrent creator is fine; anything else
            // will resurface on the transfer itself.
            debug!(dir = %prefix, error = %e, "create_dir failed");
        }
    }
    Ok(())
}

/// Pre-scan of a local tree: relative directory paths (shortest first)
/// and relative file paths with sizes.
fn scan_local_tree(root: &Path) -> std::io::Result<(Vec<PathBuf>, Vec<(PathBuf, u64)>)> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
        })?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        if rel.as_os_str().is_empty() {
            continue;
        }
        if entry.file_type().is_dir() {
            dirs.push(rel);
        } else if entry.file_type().is_file() {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            files.push((rel, size));
        }
    }
    dirs.sort_by_key(|d| d.components().count());
    Ok((dirs, files))
}

/// Upload a directory tree with bounded concurrency.
pub(crate) async fn upload_directory(
    sftp: Arc<SftpSession>,
    local_root: &Path,
    remote_root: &str,
    concurrency: usize,
    tick: Option<TransferTick>,
) -> Result<DirTransferStats> {
    let root = local_root.to_path_buf();
    let (dirs, files) = tokio::task::spawn_blocking(move || scan_local_tree(&root))
        .await
        .map_err(|e| Error::adapter("ssh", format!("scan task failed: {}", e)))??;

    ensure_remote_dir(&sftp, remote_root).await?;
    for dir in &dirs {
        let remote = join_remote(remote_root, dir);
        ensure_remote_dir(&sftp, &remote).await?;
    }

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut stats = DirTransferStats {
        total_files: files.len() as u64,
        ..Default::default()
    };

    let transfers = files.into_iter().map(|(rel, _)| {
        let sftp = Arc::clone(&sftp);
        let semaphore = Arc::clone(&semaphore);
        let tick = tick.clone();
        let local = local_root.join(&rel);
        let remote = join_remote(remote_root, &rel);
        async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            let outcome = upload_file(&sftp, &local, &remote).await;
            if let Some(tick) = &tick {
                tick(
                    &local.to_string_lossy(),
                    &remote,
                    outcome.as_ref().err(),
                );
            }
            (remote, outcome)
        }
    });

    for (remote, outcome) in futures::future::join_all(transfers).await {
        match outcome {
            Ok(bytes) => {
                stats.transferred += 1;
                stats.bytes += bytes;
            }
            Err(e) => stats.errors.push(format!("{}: {}", remote, e)),
        }
    }
    Ok(stats)
}

/// Recursive remote walk: relative directory and `(file, size)` lists,
/// directories shortest-first.
pub(crate) async fn scan_remote_tree(
    sftp: &SftpSession,
    remote_root: &str,
) -> Result<(Vec<String>, Vec<(String, u64)>)> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let mut pending = vec![String::new()];

    while let Some(rel) = pending.pop() {
        let current = if rel.is_empty() {
            remote_root.to_string()
        } else {
            format!("{}/{}", remote_root.trim_end_matches('/'), rel)
        };
        let entries = sftp
            .read_dir(current.as_str())
            .await
            .map_err(|e| Error::adapter("ssh", format!("sftp read_dir {} failed: {}", current, e)))?;
        for entry in entries {
            let name = entry.file_name();
            let child_rel = if rel.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", rel, name)
            };
            let meta = entry.metadata();
            if meta.is_dir() {
                dirs.push(child_rel.clone());
                pending.push(child_rel);
            } else {
                files.push((child_rel, meta.size.unwrap_or(0)));
            }
        }
    }

    dirs.sort_by_key(|d| d.matches('/').count());
    Ok((dirs, files))
}

/// Download a directory tree with bounded concurrency.
pub(crate) async fn download_directory(
    sftp: Arc<SftpSession>,
    remote_root: &str,
    local_root: &Path,
    concurrency: usize,
    tick: Option<TransferTick>,
) -> Result<DirTransferStats> {
    let (dirs, files) = scan_remote_tree(&sftp, remote_root).await?;

    tokio::fs::create_dir_all(local_root).await?;
    for dir in &dirs {
        tokio::fs::create_dir_all(local_root.join(dir)).await?;
    }

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut stats = DirTransferStats {
        total_files: files.len() as u64,
        ..Default::default()
    };

    let transfers = files.into_iter().map(|(rel, _)| {
        let sftp = Arc::clone(&sftp);
        let semaphore = Arc::clone(&semaphore);
        let tick = tick.clone();
        let remote = join_remote(remote_root, Path::new(&rel));
        let local = local_root.join(&rel);
        async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            let outcome = download_file(&sftp, &remote, &local).await;
            if let Some(tick) = &tick {
                tick(
                    &local.to_string_lossy(),
                    &remote,
                    outcome.as_ref().err(),
                );
            }
            (remote, outcome)
        }
    });

    for (remote, outcome) in futures::future::join_all(transfers).await {
        match outcome {
            Ok(bytes) => {
                stats.transferred += 1;
                stats.bytes += bytes;
            }
            Err(e) => stats.errors.push(format!("{}: {}", remote, e)),
        }
    }
    Ok(stats)
}

fn join_remote(root: &str, rel: &Path) -> String {
    let rel = rel.to_string_lossy().replace('\\', "/");
    format!("{}/{}", root.trim_end_matches('/'), rel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_remote() {
        assert_eq!(
            join_remote("/srv/data/", Path::new("a/b.txt")),
            "/srv/data/a/b.txt"
        );
        assert_eq!(join_remote("/srv", Path::new("x")), "/srv/x");
    }

    #[test]
    fn test_scan_local_tree_orders_dirs_shortest_first() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("a/b/c")).unwrap();
        std::fs::write(tmp.path().join("top.txt"), b"1").unwrap();
        std::fs::write(tmp.path().join("a/b/deep.txt"), b"22").unwrap();

        let (dirs, files) = scan_local_tree(tmp.path()).unwrap();
        let depths: Vec<usize> = dirs.iter().map(|d| d.components().count()).collect();
        let mut sorted = depths.clone();
        sorted.sort_unstable();
        assert_eq!(depths, sorted, "directories must be shortest-first");
        assert_eq!(files.len(), 2);
        let total: u64 = files.iter().map(|(_, s)| s).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn test_dir_stats_success() {
        let ok = DirTransferStats {
            total_files: 2,
            transferred: 2,
            bytes: 10,
            errors: Vec::new(),
        };
        assert!(ok.succeeded());
        let failed = DirTransferStats {
            errors: vec!["x: boom".to_string()],
            ..Default::default()
        };
        assert!(!failed.succeeded());
    }
}
