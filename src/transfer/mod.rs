//! File transfer between environments
//!
//! Copies files and directories between any two of local, SSH, Docker,
//! and Kubernetes. Same-instance transfers run native `cp`/`mv` on the
//! target; transfers with a local side run one direct leg; everything
//! else stages through a local temp directory, removed deterministically
//! whatever happens.

mod endpoint;

pub use endpoint::Endpoint;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::command::{Command, DockerOptions, K8sOptions, SshOptions, Target};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::escape::quote_unix;
use crate::events::EventPayload;
use crate::temp;

/// Maps a bare host name from an endpoint to full connection options.
pub type HostResolver = Arc<dyn Fn(&str) -> Option<SshOptions> + Send + Sync>;

/// Progress snapshot handed to the progress callback.
#[derive(Debug, Clone, Default)]
pub struct TransferProgress {
    /// Files known to be part of the transfer.
    pub total_files: u64,
    /// Files finished.
    pub completed_files: u64,
    /// Bytes known to be part of the transfer (0 when unknown).
    pub total_bytes: u64,
    /// Bytes moved so far.
    pub transferred_bytes: u64,
    /// File currently moving.
    pub current_file: Option<String>,
    /// Bytes per second, once measurable.
    pub speed: Option<f64>,
}

/// Progress callback.
pub type TransferProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// Options for one transfer.
#[derive(Clone)]
pub struct TransferOptions {
    /// Recurse into directories.
    pub recursive: bool,
    /// Replace existing destination files.
    pub overwrite: bool,
    /// Preserve permission bits where the legs support it.
    pub preserve_mode: bool,
    /// Preserve timestamps where the legs support it.
    pub preserve_timestamps: bool,
    /// Follow symlinks while walking source trees.
    pub follow_symlinks: bool,
    /// Keep only files matching one of these globs (empty keeps all).
    pub include: Vec<String>,
    /// Drop files matching one of these globs.
    pub exclude: Vec<String>,
    /// Compression hint for legs that can use it.
    pub compress: bool,
    /// Concurrent per-file transfers for directory legs.
    pub concurrency: usize,
    /// Delete destination files absent from the source (sync).
    pub delete_extra: bool,
    /// Progress callback.
    pub progress: Option<TransferProgressCallback>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            overwrite: true,
            preserve_mode: true,
            preserve_timestamps: false,
            follow_symlinks: false,
            include: Vec::new(),
            exclude: Vec::new(),
            compress: false,
            concurrency: 5,
            delete_extra: false,
            progress: None,
        }
    }
}

/// Outcome of one transfer. Failed transfers resolve (not error) with
/// `success == false` and the per-file messages in `errors`.
#[derive(Debug, Clone, Default)]
pub struct TransferOutcome {
    /// Whether every file moved.
    pub success: bool,
    /// Files moved.
    pub files_transferred: u64,
    /// Bytes moved (best effort for container legs).
    pub bytes_transferred: u64,
    /// Wall time.
    pub duration: Duration,
    /// Per-file failure messages.
    pub errors: Vec<String>,
}

/// The transfer engine. Cheap to clone.
#[derive(Clone)]
pub struct TransferEngine {
    engine: Engine,
    resolver: Option<HostResolver>,
}

impl TransferEngine {
    /// Transfer engine over `engine`'s adapters.
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            resolver: None,
        }
    }

    /// Attach a resolver for bare SSH host names.
    pub fn with_resolver(mut self, resolver: HostResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Copy `source` to `destination`.
    pub async fn copy(
        &self,
        source: &str,
        destination: &str,
        options: &TransferOptions,
    ) -> Result<TransferOutcome> {
        let src = Endpoint::parse(source)?;
        let dst = Endpoint::parse(destination)?;
        let started = Instant::now();

        self.engine.events().publish(EventPayload::TransferStart {
            source: source.to_string(),
            destination: destination.to_string(),
        });

        let outcome = self.dispatch(&src, &dst, options).await;
        let mut outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.engine.events().publish(EventPayload::TransferError {
                    source: source.to_string(),
                    destination: destination.to_string(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };
        outcome.duration = started.elapsed();
        outcome.success = outcome.errors.is_empty();

        if outcome.success {
            self.engine
                .events()
                .publish(EventPayload::TransferComplete {
                    source: source.to_string(),
                    destination: destination.to_string(),
                    bytes: outcome.bytes_transferred,
                    duration: outcome.duration,
                });
        } else {
            self.engine.events().publish(EventPayload::TransferError {
                source: source.to_string(),
                destination: destination.to_string(),
                message: outcome.errors.join("; "),
            });
        }
        Ok(outcome)
    }

    /// Copy, then delete the source.
    pub async fn move_item(
        &self,
        source: &str,
        destination: &str,
        options: &TransferOptions,
    ) -> Result<TransferOutcome> {
        let src = Endpoint::parse(source)?;
        let dst = Endpoint::parse(destination)?;

        // Same instance: one native mv.
        if src.same_instance(&dst) && !matches!(src, Endpoint::Local { .. }) {
            let started = Instant::now();
            self.run_native(&src, "mv", &src.path_str(), &dst.path_str())
                .await?;
            return Ok(TransferOutcome {
                success: true,
                files_transferred: 1,
                bytes_transferred: 0,
                duration: started.elapsed(),
                errors: Vec::new(),
            });
        }

        let outcome = self.copy(source, destination, options).await?;
        if outcome.success {
            self.delete(&src).await?;
        }
        Ok(outcome)
    }

    /// Copy with `delete_extra`: destination files absent from the
    /// source are removed afterwards.
    pub async fn sync(
        &self,
        source: &str,
        destination: &str,
        options: &TransferOptions,
    ) -> Result<TransferOutcome> {
        let mut options = options.clone();
        options.delete_extra = true;
        self.copy(source, destination, &options).await
    }

    async fn dispatch(
        &self,
        src: &Endpoint,
        dst: &Endpoint,
        options: &TransferOptions,
    ) -> Result<TransferOutcome> {
        // Same instance, both remote: native cp on the target.
        if src.same_instance(dst) && !matches!(src, Endpoint::Local { .. }) {
            let flag = if options.recursive { "cp -r" } else { "cp" };
            self.run_native(src, flag, &src.path_str(), &dst.path_str())
                .await?;
            return Ok(TransferOutcome {
                success: true,
                files_transferred: 1,
                ..Default::default()
            });
        }

        match (src, dst) {
            (Endpoint::Local { path: from }, Endpoint::Local { path: to }) => {
                self.copy_local(from, to, options).await
            }
            (Endpoint::Local { path }, _) => {
                let outcome = self.push(path, dst, options).await?;
                if options.delete_extra {
                    self.delete_extra_remote(path, dst, options).await?;
                }
                Ok(outcome)
            }
            (_, Endpoint::Local { path }) => self.fetch(src, path, options).await,
            // Cross-environment: two legs through a local staging dir,
            // removed deterministically even on failure.
            _ => {
                let events = self.engine.events().clone();
                let this = self.clone();
                let src = src.clone();
                let dst = dst.clone();
                let options = options.clone();
                temp::with_temp_dir(&events, "uex-transfer", move |stage| async move {
                    let stage_entry = stage.join("payload");
                    let fetched = this.fetch(&src, &stage_entry, &options).await?;
                    let pushed = this.push(&stage_entry, &dst, &options).await?;
                    Ok(TransferOutcome {
                        success: fetched.errors.is_empty() && pushed.errors.is_empty(),
                        files_transferred: pushed.files_transferred,
                        bytes_transferred: fetched
                            .bytes_transferred
                            .max(pushed.bytes_transferred),
                        duration: Duration::default(),
                        errors: fetched
                            .errors
                            .into_iter()
                            .chain(pushed.errors)
                            .collect(),
                    })
                })
                .await
            }
        }
    }

    /// Move a local path into a remote endpoint, staging a filtered tree
    /// first when include/exclude globs are set.
    async fn push(
        &self,
        local: &Path,
        dst: &Endpoint,
        options: &TransferOptions,
    ) -> Result<TransferOutcome> {
        let is_dir = local.is_dir();
        if is_dir && !options.recursive {
            return Err(Error::adapter(
                "transfer",
                "source is a directory and recursive is off",
            ));
        }

        if is_dir && !(options.include.is_empty() && options.exclude.is_empty()) {
            let events = self.engine.events().clone();
            let this = self.clone();
            let local = local.to_path_buf();
            let dst = dst.clone();
            let mut inner = options.clone();
            inner.include.clear();
            inner.exclude.clear();
            let filters = options.clone();
            return temp::with_temp_dir(&events, "uex-filter", move |stage| async move {
                let filtered = stage.join("filtered");
                this.copy_local(&local, &filtered, &filters).await?;
                this.push_direct(&filtered, &dst, &inner).await
            })
            .await;
        }

        self.push_direct(local, dst, options).await
    }

    /// One direct push leg, filters already applied.
    async fn push_direct(
        &self,
        local: &Path,
        dst: &Endpoint,
        options: &TransferOptions,
    ) -> Result<TransferOutcome> {
        let is_dir = local.is_dir();
        match dst {
            Endpoint::Ssh { path, .. } => {
                let opts = self.ssh_options(dst)?;
                let ssh = self.engine.ssh_adapter();
                if is_dir {
                    let tick = self.progress_tick(local, options);
                    let stats = ssh
                        .upload_directory(&opts, local, path, tick)
                        .await?;
                    Ok(TransferOutcome {
                        success: stats.succeeded(),
                        files_transferred: stats.transferred,
                        bytes_transferred: stats.bytes,
                        errors: stats.errors,
                        ..Default::default()
                    })
                } else {
                    let bytes = ssh.upload_file(&opts, local, path).await?;
                    Ok(single_file_outcome(bytes))
                }
            }
            Endpoint::Docker { container, path } => {
                let bytes = self
                    .engine
                    .docker_adapter()
                    .copy_to(container, local, path)
                    .await?;
                Ok(single_file_outcome_with(bytes, count_files(local)))
            }
            Endpoint::K8s { .. } => {
                let opts = self.k8s_options(dst);
                self.engine
                    .k8s_adapter()
                    .copy_to(&opts, local, &dst.path_str())
                    .await?;
                Ok(single_file_outcome_with(
                    local_size(local),
                    count_files(local),
                ))
            }
            Endpoint::Local { .. } => unreachable!("push target is remote"),
        }
    }

    /// Move a remote endpoint into a local path.
    async fn fetch(
        &self,
        src: &Endpoint,
        local: &Path,
        options: &TransferOptions,
    ) -> Result<TransferOutcome> {
        match src {
            Endpoint::Ssh { path, .. } => {
                let opts = self.ssh_options(src)?;
                let ssh = self.engine.ssh_adapter();
                let is_dir = self.remote_is_dir(src).await?;
                if is_dir {
                    if !options.recursive {
                        return Err(Error::adapter(
                            "transfer",
                            "source is a directory and recursive is off",
                        ));
                    }
                    let tick = self.progress_tick(local, options);
                    let stats = ssh
                        .download_directory(&opts, path, local, tick)
                        .await?;
                    Ok(TransferOutcome {
                        success: stats.succeeded(),
                        files_transferred: stats.transferred,
                        bytes_transferred: stats.bytes,
                        errors: stats.errors,
                        ..Default::default()
                    })
                } else {
                    let bytes = ssh.download_file(&opts, path, local).await?;
                    Ok(single_file_outcome(bytes))
                }
            }
            Endpoint::Docker { container, path } => {
                let bytes = self
                    .engine
                    .docker_adapter()
                    .copy_from(container, path, local)
                    .await?;
                Ok(single_file_outcome_with(bytes, count_files(local)))
            }
            Endpoint::K8s { .. } => {
                let opts = self.k8s_options(src);
                self.engine
                    .k8s_adapter()
                    .copy_from(&opts, &src.path_str(), local)
                    .await?;
                Ok(single_file_outcome_with(
                    local_size(local),
                    count_files(local),
                ))
            }
            Endpoint::Local { .. } => unreachable!("fetch source is remote"),
        }
    }

    /// Local→local copy honoring filters, overwrite, and recursion.
    async fn copy_local(
        &self,
        from: &Path,
        to: &Path,
        options: &TransferOptions,
    ) -> Result<TransferOutcome> {
        let mut outcome = TransferOutcome::default();

        if from.is_file() {
            match copy_one_file(from, to, options.overwrite).await {
                Ok(bytes) => {
                    outcome.files_transferred = 1;
                    outcome.bytes_transferred = bytes;
                }
                Err(e) => outcome.errors.push(format!("{}: {}", from.display(), e)),
            }
            return Ok(outcome);
        }

        if !from.is_dir() {
            return Err(Error::adapter(
                "transfer",
                format!("source not found: {}", from.display()),
            ));
        }
        if !options.recursive {
            return Err(Error::adapter(
                "transfer",
                "source is a directory and recursive is off",
            ));
        }

        let include = compile_globs(&options.include);
        let exclude = compile_globs(&options.exclude);
        let total = scan_totals(from, options.follow_symlinks, &include, &exclude);
        let started = Instant::now();

        for entry in walkdir::WalkDir::new(from).follow_links(options.follow_symlinks) {
            let entry = entry.map_err(|e| Error::adapter("transfer", e.to_string()))?;
            let rel = entry
                .path()
                .strip_prefix(from)
                .unwrap_or(entry.path())
                .to_path_buf();
            if rel.as_os_str().is_empty() {
                continue;
            }
            let rel_str = rel.to_string_lossy().replace('\\', "/");
            let target = to.join(&rel);

            if entry.file_type().is_dir() {
                tokio::fs::create_dir_all(&target).await?;
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            if !passes_filters(&rel_str, &include, &exclude) {
                continue;
            }

            match copy_one_file(entry.path(), &target, options.overwrite).await {
                Ok(bytes) => {
                    outcome.files_transferred += 1;
                    outcome.bytes_transferred += bytes;
                }
                Err(e) => outcome
                    .errors
                    .push(format!("{}: {}", entry.path().display(), e)),
            }

            if let Some(progress) = &options.progress {
                let elapsed = started.elapsed().as_secs_f64();
                progress(TransferProgress {
                    total_files: total.0,
                    completed_files: outcome.files_transferred,
                    total_bytes: total.1,
                    transferred_bytes: outcome.bytes_transferred,
                    current_file: Some(rel_str.clone()),
                    speed: (elapsed > 0.0)
                        .then(|| outcome.bytes_transferred as f64 / elapsed),
                });
            }
        }

        if options.delete_extra {
            self.delete_extra_local(from, to, options).await?;
        }
        Ok(outcome)
    }

    /// Remove destination files that no longer exist in the source
    /// (local destination).
    async fn delete_extra_local(
        &self,
        from: &Path,
        to: &Path,
        options: &TransferOptions,
    ) -> Result<()> {
        let source: BTreeSet<String> = list_local_files(from, options.follow_symlinks);
        let dest = list_local_files(to, false);
        for extra in dest.difference(&source) {
            let doomed = to.join(extra);
            debug!(path = %doomed.display(), "sync removing extra file");
            if let Err(e) = tokio::fs::remove_file(&doomed).await {
                warn!(path = %doomed.display(), error = %e, "failed to remove extra file");
            }
        }
        Ok(())
    }

    /// Remove remote destination files absent from the local source.
    async fn delete_extra_remote(
        &self,
        from: &Path,
        dst: &Endpoint,
        options: &TransferOptions,
    ) -> Result<()> {
        if !from.is_dir() {
            return Ok(());
        }
        let source = list_local_files(from, options.follow_symlinks);
        let root = dst.path_str();
        let listing = self
            .exec_on(
                dst,
                Command::shell(format!("find {} -type f", quote_unix(&root))).nothrow(),
            )
            .await?;
        if !listing.ok() {
            return Ok(());
        }

        let prefix = format!("{}/", root.trim_end_matches('/'));
        let extras: Vec<String> = listing
            .lines()
            .into_iter()
            .filter_map(|line| line.strip_prefix(&prefix).map(str::to_string))
            .filter(|rel| !source.contains(rel))
            .map(|rel| format!("{}{}", prefix, rel))
            .collect();
        if extras.is_empty() {
            return Ok(());
        }

        let quoted: Vec<String> = extras.iter().map(|p| quote_unix(p).into_owned()).collect();
        self.exec_on(
            dst,
            Command::shell(format!("rm -f {}", quoted.join(" "))),
        )
        .await?;
        Ok(())
    }

    /// Delete an endpoint's path in its own environment.
    async fn delete(&self, endpoint: &Endpoint) -> Result<()> {
        match endpoint {
            Endpoint::Local { path } => {
                if path.is_dir() {
                    tokio::fs::remove_dir_all(path).await?;
                } else {
                    tokio::fs::remove_file(path).await?;
                }
                Ok(())
            }
            _ => {
                self.exec_on(
                    endpoint,
                    Command::shell(format!(
                        "rm -rf {}",
                        quote_unix(&endpoint.path_str())
                    )),
                )
                .await?;
                Ok(())
            }
        }
    }

    /// Native `cp`/`mv` on a same-instance pair.
    async fn run_native(
        &self,
        endpoint: &Endpoint,
        program: &str,
        from: &str,
        to: &str,
    ) -> Result<()> {
        let result = self
            .exec_on(
                endpoint,
                Command::shell(format!(
                    "{} {} {}",
                    program,
                    quote_unix(from),
                    quote_unix(to)
                )),
            )
            .await?;
        if !result.ok() {
            return Err(Error::adapter(
                "transfer",
                format!("native {} failed: {}", program, result.stderr.trim()),
            ));
        }
        Ok(())
    }

    async fn exec_on(
        &self,
        endpoint: &Endpoint,
        command: Command,
    ) -> Result<crate::result::ExecutionResult> {
        let target = match endpoint {
            Endpoint::Local { .. } => Target::Local,
            Endpoint::Ssh { .. } => Target::Ssh(self.ssh_options(endpoint)?),
            Endpoint::Docker { container, .. } => {
                Target::Docker(DockerOptions::new(container.clone()))
            }
            Endpoint::K8s { .. } => Target::K8s(self.k8s_options(endpoint)),
        };
        self.engine
            .execute_now(command.target(target).quiet())
            .await
    }

    fn ssh_options(&self, endpoint: &Endpoint) -> Result<SshOptions> {
        let Endpoint::Ssh {
            user, host, port, ..
        } = endpoint
        else {
            return Err(Error::adapter("transfer", "endpoint is not ssh"));
        };

        let resolved = self
            .resolver
            .as_ref()
            .and_then(|resolve| resolve(host));
        let mut opts = match resolved {
            Some(opts) => opts,
            None => {
                let user = user.clone().unwrap_or_else(|| {
                    std::env::var("USER").unwrap_or_else(|_| "root".to_string())
                });
                SshOptions::new(host.clone(), user)
            }
        };
        // Explicit URL parts win over resolver defaults.
        if let Some(user) = user {
            opts.username = user.clone();
        }
        if let Some(port) = port {
            opts.port = *port;
        }
        Ok(opts)
    }

    fn k8s_options(&self, endpoint: &Endpoint) -> K8sOptions {
        let Endpoint::K8s { namespace, pod, .. } = endpoint else {
            unreachable!("endpoint is k8s");
        };
        let mut opts = K8sOptions::new(pod.clone());
        if let Some(ns) = namespace {
            opts = opts.namespace(ns.clone());
        }
        opts
    }

    async fn remote_is_dir(&self, endpoint: &Endpoint) -> Result<bool> {
        let result = self
            .exec_on(
                endpoint,
                Command::shell(format!(
                    "test -d {}",
                    quote_unix(&endpoint.path_str())
                ))
                .nothrow(),
            )
            .await?;
        Ok(result.ok())
    }

    /// Adapt the per-file SFTP tick into the caller's progress callback.
    fn progress_tick(
        &self,
        root: &Path,
        options: &TransferOptions,
    ) -> Option<crate::adapters::ssh::TransferTick> {
        let progress = options.progress.clone()?;
        let totals = if root.is_dir() {
            scan_totals(root, options.follow_symlinks, &[], &[])
        } else {
            (1, local_size(root))
        };
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        Some(Arc::new(move |local, _remote, error| {
            let done = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if error.is_none() {
                progress(TransferProgress {
                    total_files: totals.0,
                    completed_files: done,
                    total_bytes: totals.1,
                    transferred_bytes: 0,
                    current_file: Some(local.to_string()),
                    speed: None,
                });
            }
        }))
    }
}

async fn copy_one_file(from: &Path, to: &Path, overwrite: bool) -> Result<u64> {
    if !overwrite && to.exists() {
        return Err(Error::adapter(
            "transfer",
            "destination exists and overwrite is off",
        ));
    }
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(tokio::fs::copy(from, to).await?)
}

fn single_file_outcome(bytes: u64) -> TransferOutcome {
    single_file_outcome_with(bytes, 1)
}

fn single_file_outcome_with(bytes: u64, files: u64) -> TransferOutcome {
    TransferOutcome {
        success: true,
        files_transferred: files,
        bytes_transferred: bytes,
        ..Default::default()
    }
}

fn compile_globs(patterns: &[String]) -> Vec<glob::Pattern> {
    patterns
        .iter()
        .filter_map(|p| glob::Pattern::new(p).ok())
        .collect()
}

fn passes_filters(rel: &str, include: &[glob::Pattern], exclude: &[glob::Pattern]) -> bool {
    if !include.is_empty() && !include.iter().any(|p| p.matches(rel)) {
        return false;
    }
    !exclude.iter().any(|p| p.matches(rel))
}

/// Pre-scan a local tree: `(file count, total bytes)` after filters.
fn scan_totals(
    root: &Path,
    follow_symlinks: bool,
    include: &[glob::Pattern],
    exclude: &[glob::Pattern],
) -> (u64, u64) {
    let mut files = 0u64;
    let mut bytes = 0u64;
    for entry in walkdir::WalkDir::new(root)
        .follow_links(follow_symlinks)
        .into_iter()
        .flatten()
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        if !passes_filters(&rel, include, exclude) {
            continue;
        }
        files += 1;
        bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
    }
    (files, bytes)
}

fn list_local_files(root: &Path, follow_symlinks: bool) -> BTreeSet<String> {
    walkdir::WalkDir::new(root)
        .follow_links(follow_symlinks)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(root)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect()
}

fn count_files(path: &Path) -> u64 {
    if path.is_file() {
        1
    } else {
        list_local_files(path, false).len() as u64
    }
}

fn local_size(path: &Path) -> u64 {
    if path.is_file() {
        std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
    } else {
        scan_totals(path, false, &[], &[]).1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfers() -> TransferEngine {
        TransferEngine::new(Engine::new())
    }

    #[tokio::test]
    async fn test_local_file_copy() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        let dst = dir.path().join("nested/b.txt");
        tokio::fs::write(&src, b"payload").await.unwrap();

        let outcome = transfers()
            .copy(
                &src.to_string_lossy(),
                &dst.to_string_lossy(),
                &TransferOptions::default(),
            )
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.files_transferred, 1);
        assert_eq!(outcome.bytes_transferred, 7);
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_local_dir_copy_with_filters() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tree");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("keep.rs"), b"rs").unwrap();
        std::fs::write(src.join("sub/also.rs"), b"rs2").unwrap();
        std::fs::write(src.join("skip.log"), b"log").unwrap();

        let dst = dir.path().join("out");
        let options = TransferOptions {
            include: vec!["**/*.rs".to_string(), "*.rs".to_string()],
            ..Default::default()
        };
        let outcome = transfers()
            .copy(
                &src.to_string_lossy(),
                &dst.to_string_lossy(),
                &options,
            )
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.files_transferred, 2);
        assert!(dst.join("keep.rs").exists());
        assert!(dst.join("sub/also.rs").exists());
        assert!(!dst.join("skip.log").exists());
    }

    #[tokio::test]
    async fn test_overwrite_off_records_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        std::fs::write(&src, b"new").unwrap();
        std::fs::write(&dst, b"old").unwrap();

        let options = TransferOptions {
            overwrite: false,
            ..Default::default()
        };
        let outcome = transfers()
            .copy(&src.to_string_lossy(), &dst.to_string_lossy(), &options)
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(std::fs::read(&dst).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_move_deletes_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("moved.txt");
        let dst = dir.path().join("dest.txt");
        std::fs::write(&src, b"x").unwrap();

        let outcome = transfers()
            .move_item(
                &src.to_string_lossy(),
                &dst.to_string_lossy(),
                &TransferOptions::default(),
            )
            .await
            .unwrap();

        assert!(outcome.success);
        assert!(!src.exists());
        assert!(dst.exists());
    }

    #[tokio::test]
    async fn test_sync_deletes_extra() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(&dst).unwrap();
        std::fs::write(src.join("wanted.txt"), b"1").unwrap();
        std::fs::write(dst.join("stale.txt"), b"2").unwrap();

        let outcome = transfers()
            .sync(
                &src.to_string_lossy(),
                &dst.to_string_lossy(),
                &TransferOptions::default(),
            )
            .await
            .unwrap();

        assert!(outcome.success);
        assert!(dst.join("wanted.txt").exists());
        assert!(!dst.join("stale.txt").exists());
    }

    #[tokio::test]
    async fn test_transfer_events() {
        let engine = Engine::new();
        let mut rx = engine.events().subscribe_matching("transfer:*");
        let transfers = TransferEngine::new(engine);

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a");
        std::fs::write(&src, b"x").unwrap();
        transfers
            .copy(
                &src.to_string_lossy(),
                &dir.path().join("b").to_string_lossy(),
                &TransferOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().name(), "transfer:start");
        assert_eq!(rx.recv().await.unwrap().name(), "transfer:complete");
    }

    #[tokio::test]
    async fn test_progress_callback_fires() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tree");
        std::fs::create_dir_all(&src).unwrap();
        for i in 0..3 {
            std::fs::write(src.join(format!("f{}.txt", i)), b"data").unwrap();
        }

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let options = TransferOptions {
            progress: Some(Arc::new(move |p: TransferProgress| {
                sink.lock().push((p.completed_files, p.total_files));
            })),
            ..Default::default()
        };

        transfers()
            .copy(
                &src.to_string_lossy(),
                &dir.path().join("out").to_string_lossy(),
                &options,
            )
            .await
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen.last().unwrap(), &(3, 3));
    }

    #[test]
    fn test_filter_logic() {
        let include = compile_globs(&["*.rs".to_string()]);
        let exclude = compile_globs(&["target/*".to_string()]);
        assert!(passes_filters("main.rs", &include, &exclude));
        assert!(!passes_filters("notes.md", &include, &exclude));
        assert!(!passes_filters("target/main.rs", &[], &exclude));
        assert!(passes_filters("anything", &[], &[]));
    }
}
