//! Staged pipelines
//!
//! An ordered sequence of stages where each stage's stdout streams into
//! the next stage's stdin. Stages are concrete commands or conditional
//! factories deciding on a command (or skipping) from the previous
//! result. `execute_parallel` groups consecutive concrete stages and
//! runs each group with bounded concurrency; conditional stages always
//! serialize.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::command::{Command, StdinPayload};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::parallel::{self, ParallelOptions};
use crate::result::ExecutionResult;

/// Factory for a conditional stage: previous result in, command out
/// (`None` skips the stage).
pub type StageFactory = Arc<dyn Fn(&ExecutionResult) -> Option<Command> + Send + Sync>;

/// Transform applied to a stage's stdout before the next stage sees it.
pub type StageTransform = Arc<dyn Fn(String) -> String + Send + Sync>;

/// Per-stage progress hook: `(stage index, result)`.
pub type StageProgress = Arc<dyn Fn(usize, &ExecutionResult) + Send + Sync>;

/// One pipeline stage.
pub enum Stage {
    /// A concrete command.
    Command(Command),
    /// A factory consulted with the previous stage's result.
    Conditional(StageFactory),
}

struct StageSpec {
    stage: Stage,
    transform: Option<StageTransform>,
}

/// Outcome of a pipeline run.
#[derive(Debug)]
pub struct PipelineResult {
    /// Results of the stages that ran, in order.
    pub results: Vec<ExecutionResult>,
    /// Stages skipped by their factory.
    pub skipped: usize,
    /// Wall time.
    pub duration: Duration,
}

impl PipelineResult {
    /// The final stage's result.
    pub fn last(&self) -> Option<&ExecutionResult> {
        self.results.last()
    }
}

/// Ordered pipeline builder.
pub struct Pipeline {
    engine: Engine,
    stages: Vec<StageSpec>,
    progress: Option<StageProgress>,
}

impl Pipeline {
    /// Empty pipeline on `engine`.
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            stages: Vec::new(),
            progress: None,
        }
    }

    /// Append a concrete command stage.
    pub fn stage(mut self, command: Command) -> Self {
        self.stages.push(StageSpec {
            stage: Stage::Command(command),
            transform: None,
        });
        self
    }

    /// Append a conditional stage.
    pub fn stage_if(mut self, factory: StageFactory) -> Self {
        self.stages.push(StageSpec {
            stage: Stage::Conditional(factory),
            transform: None,
        });
        self
    }

    /// Transform the stdout of the most recently added stage before the
    /// next stage consumes it.
    pub fn transform(mut self, transform: StageTransform) -> Self {
        if let Some(last) = self.stages.last_mut() {
            last.transform = Some(transform);
        }
        self
    }

    /// Observe each stage's completion.
    pub fn on_stage(mut self, progress: StageProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Run every stage sequentially, streaming stdout to stdin.
    pub async fn execute(self) -> Result<PipelineResult> {
        let started = Instant::now();
        let engine = self.engine;
        let progress = self.progress;
        let mut results: Vec<ExecutionResult> = Vec::new();
        let mut skipped = 0usize;
        let mut carry: Option<String> = None;

        for (index, spec) in self.stages.into_iter().enumerate() {
            let command = match spec.stage {
                Stage::Command(command) => Some(command),
                Stage::Conditional(factory) => {
                    let previous = results.last().ok_or_else(|| {
                        Error::adapter(
                            "pipeline",
                            "conditional stage cannot be the first stage",
                        )
                    })?;
                    factory(previous)
                }
            };
            let Some(mut command) = command else {
                skipped += 1;
                continue;
            };

            if let Some(stdin) = carry.take() {
                command.stdin = StdinPayload::text(stdin);
            }
            let result = engine.execute_now(command).await?;
            if let Some(progress) = &progress {
                progress(index, &result);
            }
            let stdout = match &spec.transform {
                Some(transform) => transform(result.stdout.clone()),
                None => result.stdout.clone(),
            };
            carry = Some(stdout);
            results.push(result);
        }

        Ok(PipelineResult {
            results,
            skipped,
            duration: started.elapsed(),
        })
    }

    /// Run with consecutive concrete stages grouped and executed
    /// concurrently (bounded by `max_concurrency`). Every stage in a
    /// group receives the previous group's final stdout; the group's
    /// output is its last stage's stdout. Conditional stages form
    /// singleton groups and serialize the flow.
    pub async fn execute_parallel(self, max_concurrency: usize) -> Result<PipelineResult> {
        let started = Instant::now();
        let engine = self.engine;
        let progress = self.progress;
        let mut results: Vec<ExecutionResult> = Vec::new();
        let mut skipped = 0usize;
        let mut carry: Option<String> = None;
        let mut stage_index = 0usize;

        let mut stages = self.stages.into_iter().peekable();
        while stages.peek().is_some() {
            // Collect one group: a run of concrete stages, or a single
            // conditional.
            let mut group: Vec<StageSpec> = Vec::new();
            while let Some(spec) = stages.peek() {
                let concrete = matches!(spec.stage, Stage::Command(_));
                if group.is_empty() {
                    let spec = stages.next().expect("peeked");
                    let single = !matches!(spec.stage, Stage::Command(_));
                    group.push(spec);
                    if single {
                        break;
                    }
                } else if concrete {
                    group.push(stages.next().expect("peeked"));
                } else {
                    break;
                }
            }

            if group.len() == 1 {
                let spec = group.pop().expect("single member");
                let command = match spec.stage {
                    Stage::Command(command) => Some(command),
                    Stage::Conditional(factory) => {
                        let previous = results.last().ok_or_else(|| {
                            Error::adapter(
                                "pipeline",
                                "conditional stage cannot be the first stage",
                            )
                        })?;
                        factory(previous)
                    }
                };
                match command {
                    Some(mut command) => {
                        if let Some(stdin) = carry.take() {
                            command.stdin = StdinPayload::text(stdin);
                        }
                        let result = engine.execute_now(command).await?;
                        if let Some(progress) = &progress {
                            progress(stage_index, &result);
                        }
                        carry = Some(match &spec.transform {
                            Some(transform) => transform(result.stdout.clone()),
                            None => result.stdout.clone(),
                        });
                        results.push(result);
                    }
                    None => skipped += 1,
                }
                stage_index += 1;
                continue;
            }

            // Concurrent group: same stdin for every member.
            let group_stdin = carry.clone();
            let mut commands = Vec::new();
            let mut transforms = Vec::new();
            for spec in group {
                let Stage::Command(mut command) = spec.stage else {
                    unreachable!("groups of >1 contain only concrete stages");
                };
                if let Some(stdin) = &group_stdin {
                    command.stdin = StdinPayload::text(stdin.clone());
                }
                commands.push(command);
                transforms.push(spec.transform);
            }

            let count = commands.len();
            let group_results = parallel::all(
                &engine,
                commands,
                ParallelOptions::new().max_concurrency(max_concurrency),
            )
            .await?;

            for (offset, result) in group_results.iter().enumerate() {
                if let Some(progress) = &progress {
                    progress(stage_index + offset, result);
                }
            }
            // The declaration-order last stage carries the flow onward.
            if let Some(last) = group_results.last() {
                carry = Some(match &transforms[count - 1] {
                    Some(transform) => transform(last.stdout.clone()),
                    None => last.stdout.clone(),
                });
            }
            results.extend(group_results);
            stage_index += count;
        }

        Ok(PipelineResult {
            results,
            skipped,
            duration: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::MockResponse;

    #[tokio::test]
    async fn test_sequential_streaming() {
        let engine = Engine::new();
        let outcome = Pipeline::new(engine)
            .stage(Command::shell("printf 'c\\na\\nb\\n'"))
            .stage(Command::shell("sort"))
            .stage(Command::shell("head -n 1"))
            .execute()
            .await
            .unwrap();

        assert_eq!(outcome.results.len(), 3);
        assert_eq!(outcome.last().unwrap().text(), "a");
    }

    #[tokio::test]
    async fn test_conditional_stage_runs_and_skips() {
        let engine = Engine::new();
        let outcome = Pipeline::new(engine.clone())
            .stage(Command::shell("echo trigger"))
            .stage_if(Arc::new(|prev| {
                if prev.text() == "trigger" {
                    Some(Command::shell("tr a-z A-Z"))
                } else {
                    None
                }
            }))
            .execute()
            .await
            .unwrap();
        assert_eq!(outcome.last().unwrap().text(), "TRIGGER");
        assert_eq!(outcome.skipped, 0);

        let skipped = Pipeline::new(engine)
            .stage(Command::shell("echo other"))
            .stage_if(Arc::new(|prev| {
                (prev.text() == "trigger").then(|| Command::shell("cat"))
            }))
            .execute()
            .await
            .unwrap();
        assert_eq!(skipped.skipped, 1);
        assert_eq!(skipped.results.len(), 1);
    }

    #[tokio::test]
    async fn test_conditional_first_stage_rejected() {
        let engine = Engine::new();
        let err = Pipeline::new(engine)
            .stage_if(Arc::new(|_| None))
            .execute()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("first stage"));
    }

    #[tokio::test]
    async fn test_transform_between_stages() {
        let engine = Engine::new();
        let outcome = Pipeline::new(engine)
            .stage(Command::shell("echo seed"))
            .transform(Arc::new(|stdout| stdout.replace("seed", "grown")))
            .stage(Command::shell("cat"))
            .execute()
            .await
            .unwrap();
        assert_eq!(outcome.last().unwrap().text(), "grown");
    }

    #[tokio::test]
    async fn test_parallel_groups() {
        let engine = Engine::new().mock();
        let mock = engine.mock_adapter();
        mock.respond_to("seed", MockResponse::ok("input"));
        mock.respond_to(
            "branch-1",
            MockResponse::ok("one").after(Duration::from_millis(20)),
        );
        mock.respond_to(
            "branch-2",
            MockResponse::ok("two").after(Duration::from_millis(20)),
        );
        mock.respond_to("final", MockResponse::ok("done"));

        let outcome = Pipeline::new(engine)
            .stage(Command::shell("seed"))
            .stage(Command::shell("branch-1"))
            .stage(Command::shell("branch-2"))
            .stage_if(Arc::new(|prev| {
                assert_eq!(prev.text(), "two");
                Some(Command::shell("final"))
            }))
            .execute_parallel(4)
            .await
            .unwrap();

        assert_eq!(outcome.results.len(), 4);
        assert_eq!(outcome.last().unwrap().text(), "done");
    }

    #[tokio::test]
    async fn test_stage_progress_hook() {
        let engine = Engine::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        Pipeline::new(engine)
            .stage(Command::shell("echo a"))
            .stage(Command::shell("cat"))
            .on_stage(Arc::new(move |index, result| {
                sink.lock().push((index, result.text().to_string()));
            }))
            .execute()
            .await
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (0, "a".to_string()));
    }
}
