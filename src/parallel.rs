//! Parallel command execution
//!
//! A flat bag of commands run under bounded concurrency, with settled /
//! fail-fast / race variants and the collection helpers built on them.
//! `stop_on_error` stops launching new tasks after the first failure;
//! tasks already running complete on their own.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;

use crate::command::Command;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::result::ExecutionResult;

/// Progress snapshot passed to the progress callback.
#[derive(Debug, Clone)]
pub struct ParallelProgress {
    /// Tasks completed (either way).
    pub completed: usize,
    /// Total tasks.
    pub total: usize,
    /// Failures so far.
    pub failed: usize,
}

/// Callback invoked after each task settles.
pub type ProgressCallback = Arc<dyn Fn(ParallelProgress) + Send + Sync>;

/// Options for a parallel run.
#[derive(Clone, Default)]
pub struct ParallelOptions {
    /// Concurrent task cap; `None` is unlimited.
    pub max_concurrency: Option<usize>,
    /// Stop launching new tasks after the first failure.
    pub stop_on_error: bool,
    /// Per-task progress callback.
    pub progress: Option<ProgressCallback>,
}

impl ParallelOptions {
    /// Defaults: unlimited concurrency, keep going on failure.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap concurrency.
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Stop launching after the first failure.
    pub fn stop_on_error(mut self) -> Self {
        self.stop_on_error = true;
        self
    }

    /// Observe progress.
    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }
}

/// Outcome of a settled parallel run.
pub struct ParallelResults {
    /// Per-task outcomes, in input order. `None` marks tasks never
    /// launched because `stop_on_error` tripped.
    pub results: Vec<Option<Result<ExecutionResult>>>,
    /// Count of successful tasks.
    pub succeeded: usize,
    /// Count of failed tasks.
    pub failed: usize,
    /// Wall time for the whole bag.
    pub duration: Duration,
}

impl ParallelResults {
    /// Whether every launched task succeeded and none were skipped.
    pub fn all_ok(&self) -> bool {
        self.failed == 0 && self.results.iter().all(Option::is_some)
    }
}

/// Run every command, never failing the bag itself (settled semantics).
pub async fn settled(
    engine: &Engine,
    commands: Vec<Command>,
    options: ParallelOptions,
) -> ParallelResults {
    let started = Instant::now();
    let total = commands.len();
    let semaphore = options
        .max_concurrency
        .map(|limit| Arc::new(Semaphore::new(limit.max(1))));
    let stop = Arc::new(AtomicBool::new(false));
    let completed = Arc::new(AtomicUsize::new(0));
    let failed_count = Arc::new(AtomicUsize::new(0));

    let mut tasks: FuturesUnordered<_> = commands
        .into_iter()
        .enumerate()
        .map(|(index, command)| {
            let engine = engine.clone();
            let semaphore = semaphore.clone();
            let stop = Arc::clone(&stop);
            let completed = Arc::clone(&completed);
            let failed_count = Arc::clone(&failed_count);
            let progress = options.progress.clone();
            let stop_on_error = options.stop_on_error;
            async move {
                let _permit = match semaphore {
                    Some(s) => Some(s.acquire_owned().await.expect("semaphore open")),
                    None => None,
                };
                // Skip launching once a failure has been observed.
                if stop_on_error && stop.load(Ordering::SeqCst) {
                    return (index, None);
                }
                let outcome = engine.execute_now(command).await;
                if outcome.is_err() {
                    failed_count.fetch_add(1, Ordering::SeqCst);
                    stop.store(true, Ordering::SeqCst);
                }
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(progress) = &progress {
                    progress(ParallelProgress {
                        completed: done,
                        total,
                        failed: failed_count.load(Ordering::SeqCst),
                    });
                }
                (index, Some(outcome))
            }
        })
        .collect();

    let mut results: Vec<Option<Result<ExecutionResult>>> =
        (0..total).map(|_| None).collect();
    while let Some((index, outcome)) = tasks.next().await {
        results[index] = outcome;
    }

    let succeeded = results
        .iter()
        .filter(|r| matches!(r, Some(Ok(_))))
        .count();
    let failed = results
        .iter()
        .filter(|r| matches!(r, Some(Err(_))))
        .count();

    ParallelResults {
        results,
        succeeded,
        failed,
        duration: started.elapsed(),
    }
}

/// Run every command; fail the whole bag on the first failure (already
/// running tasks complete before the error is returned).
pub async fn all(
    engine: &Engine,
    commands: Vec<Command>,
    options: ParallelOptions,
) -> Result<Vec<ExecutionResult>> {
    let outcome = settled(engine, commands, options.stop_on_error()).await;
    let mut results = Vec::with_capacity(outcome.results.len());
    for slot in outcome.results {
        match slot {
            Some(Ok(result)) => results.push(result),
            Some(Err(e)) => return Err(e),
            None => {
                return Err(Error::adapter(
                    "parallel",
                    "task skipped after earlier failure",
                ))
            }
        }
    }
    Ok(results)
}

/// Resolve with the first command to finish; the rest are cancelled.
pub async fn race(engine: &Engine, commands: Vec<Command>) -> Result<ExecutionResult> {
    if commands.is_empty() {
        return Err(Error::adapter("parallel", "race over an empty set"));
    }
    let tokens: Vec<_> = commands.iter().map(|c| c.cancel.clone()).collect();
    let mut tasks: FuturesUnordered<_> = commands
        .into_iter()
        .map(|command| {
            let engine = engine.clone();
            async move { engine.execute_now(command).await }
        })
        .collect();

    let first = tasks.next().await.expect("non-empty race");
    for token in tokens {
        token.cancel();
    }
    // Let the losers observe cancellation before returning.
    while tasks.next().await.is_some() {}
    first
}

/// Map items to commands and run them; results keep input order.
pub async fn map<T, F>(
    engine: &Engine,
    items: Vec<T>,
    to_command: F,
    options: ParallelOptions,
) -> Result<Vec<ExecutionResult>>
where
    F: Fn(&T) -> Command,
{
    let commands = items.iter().map(&to_command).collect();
    all(engine, commands, options).await
}

/// Keep the items whose command succeeded.
pub async fn filter<T, F>(
    engine: &Engine,
    items: Vec<T>,
    to_command: F,
    options: ParallelOptions,
) -> Vec<T>
where
    F: Fn(&T) -> Command,
{
    let commands = items.iter().map(|item| to_command(item).nothrow()).collect();
    let outcome = settled(engine, commands, options).await;
    items
        .into_iter()
        .zip(outcome.results)
        .filter(|(_, result)| matches!(result, Some(Ok(r)) if r.ok()))
        .map(|(item, _)| item)
        .collect()
}

/// Whether at least one command succeeds.
pub async fn some(engine: &Engine, commands: Vec<Command>) -> bool {
    let commands = commands.into_iter().map(Command::nothrow).collect();
    let outcome = settled(engine, commands, ParallelOptions::new()).await;
    outcome
        .results
        .iter()
        .any(|r| matches!(r, Some(Ok(result)) if result.ok()))
}

/// Whether every command succeeds.
pub async fn every(engine: &Engine, commands: Vec<Command>) -> bool {
    let commands = commands.into_iter().map(Command::nothrow).collect();
    let outcome = settled(engine, commands, ParallelOptions::new()).await;
    !outcome.results.is_empty()
        && outcome
            .results
            .iter()
            .all(|r| matches!(r, Some(Ok(result)) if result.ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::MockResponse;

    fn mock_engine() -> Engine {
        Engine::new().mock()
    }

    #[tokio::test]
    async fn test_settled_keeps_input_order() {
        let engine = mock_engine();
        engine.mock_adapter().respond_to(
            "slow",
            MockResponse::ok("slow").after(Duration::from_millis(50)),
        );
        engine.mock_adapter().respond_to("fast", MockResponse::ok("fast"));

        let outcome = settled(
            &engine,
            vec![Command::shell("slow"), Command::shell("fast")],
            ParallelOptions::new(),
        )
        .await;

        assert_eq!(outcome.succeeded, 2);
        let first = outcome.results[0].as_ref().unwrap().as_ref().unwrap();
        assert_eq!(first.text(), "slow");
    }

    #[tokio::test]
    async fn test_bounded_concurrency() {
        let engine = mock_engine();
        engine.mock_adapter().default_response(
            MockResponse::ok("x").after(Duration::from_millis(30)),
        );

        let commands: Vec<Command> =
            (0..6).map(|i| Command::shell(format!("task-{}", i))).collect();
        let started = Instant::now();
        let outcome = settled(
            &engine,
            commands,
            ParallelOptions::new().max_concurrency(2),
        )
        .await;
        // 6 tasks of 30ms at concurrency 2 take at least 3 rounds.
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert_eq!(outcome.succeeded, 6);
    }

    #[tokio::test]
    async fn test_stop_on_error_skips_pending() {
        let engine = mock_engine();
        engine
            .mock_adapter()
            .respond_to("bad", MockResponse::fail(1, ""));
        engine.mock_adapter().default_response(
            MockResponse::ok("fine").after(Duration::from_millis(10)),
        );

        let mut commands = vec![Command::shell("bad")];
        commands.extend((0..10).map(|i| Command::shell(format!("after-{}", i))));

        let outcome = settled(
            &engine,
            commands,
            ParallelOptions::new().max_concurrency(1).stop_on_error(),
        )
        .await;

        assert_eq!(outcome.failed, 1);
        let skipped = outcome.results.iter().filter(|r| r.is_none()).count();
        assert!(skipped > 0, "pending tasks should be skipped");
    }

    #[tokio::test]
    async fn test_all_fails_fast() {
        let engine = mock_engine();
        engine
            .mock_adapter()
            .respond_to("bad", MockResponse::fail(2, "broken"));
        engine.mock_adapter().respond_to("ok", MockResponse::ok("fine"));

        let err = all(
            &engine,
            vec![Command::shell("ok"), Command::shell("bad")],
            ParallelOptions::new(),
        )
        .await
        .unwrap_err();
        assert!(err.is_command_failure() || matches!(err, Error::Adapter { .. }));
    }

    #[tokio::test]
    async fn test_race_returns_fastest() {
        let engine = mock_engine();
        engine.mock_adapter().respond_to(
            "tortoise",
            MockResponse::ok("slow").after(Duration::from_millis(200)),
        );
        engine
            .mock_adapter()
            .respond_to("hare", MockResponse::ok("quick").after(Duration::from_millis(5)));

        let winner = race(
            &engine,
            vec![Command::shell("tortoise"), Command::shell("hare")],
        )
        .await
        .unwrap();
        assert_eq!(winner.text(), "quick");
    }

    #[tokio::test]
    async fn test_filter_some_every() {
        let engine = mock_engine();
        engine.mock_adapter().respond_to("check a", MockResponse::ok(""));
        engine
            .mock_adapter()
            .respond_to("check b", MockResponse::fail(1, ""));

        let kept = filter(
            &engine,
            vec!["a", "b"],
            |item| Command::shell(format!("check {}", item)),
            ParallelOptions::new(),
        )
        .await;
        assert_eq!(kept, vec!["a"]);

        assert!(
            some(
                &engine,
                vec![Command::shell("check a"), Command::shell("check b")]
            )
            .await
        );
        assert!(
            !every(
                &engine,
                vec![Command::shell("check a"), Command::shell("check b")]
            )
            .await
        );
    }

    #[tokio::test]
    async fn test_progress_reporting() {
        let engine = mock_engine();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        settled(
            &engine,
            (0..4).map(|i| Command::shell(format!("t{}", i))).collect(),
            ParallelOptions::new().on_progress(Arc::new(move |p| {
                sink.lock().push((p.completed, p.total));
            })),
        )
        .await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|(_, total)| *total == 4));
    }
}
