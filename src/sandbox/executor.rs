//! The execution state machine.
//!
//! `validating -> ensuring_image -> running -> (timed_out | completed)
//! -> (local_fallback?) -> done`

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::image::{engine_unreachable, ImageError, ImageManager};
use super::isolation::IsolationProfile;
use super::version::{VersionCache, VersionProbe};
use super::{ExecutionOutcome, ExecutionResult};
use crate::config::{Config, ExecutionMode, ExecutionOptions, Interpreter};
use crate::process::{CommandOutput, CommandRunner, CommandSpec, ProcessError, SystemRunner};

/// Largest snippet accepted, in bytes.
pub const MAX_CODE_BYTES: usize = 64_000;

/// "Infrastructure could not run the requested workload."
const INFRA_EXIT_CODE: i32 = 125;
/// The host interpreter is not installed.
const MISSING_INTERPRETER_EXIT_CODE: i32 = 127;

/// Result of a run that cannot have left the container profile.
///
/// Only [`SandboxExecutor::execute_contained`] produces one, so code that
/// accepts a `ContainedResult` has isolation guaranteed by type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainedResult(ExecutionResult);

impl ContainedResult {
    pub const fn result(&self) -> &ExecutionResult {
        &self.0
    }

    pub fn into_result(self) -> ExecutionResult {
        self.0
    }
}

impl From<ContainedResult> for ExecutionOutcome {
    fn from(contained: ContainedResult) -> Self {
        Self::Container(contained.0)
    }
}

/// How the container attempt ended, before version enrichment.
enum ContainerRun {
    Finished(ExecutionResult),
    ImageUnavailable(ImageError),
    EngineUnreachable(ExecutionResult),
}

impl ContainerRun {
    const fn engine_unreachable(&self) -> bool {
        match self {
            Self::Finished(_) => false,
            Self::ImageUnavailable(e) => e.is_engine_unreachable(),
            Self::EngineUnreachable(_) => true,
        }
    }
}

/// Runs snippets under the configured isolation profile.
#[derive(Clone)]
pub struct SandboxExecutor {
    options: ExecutionOptions,
    engine: String,
    interpreter: Interpreter,
    profile: IsolationProfile,
    runner: Arc<dyn CommandRunner>,
    images: ImageManager,
    versions: VersionProbe,
}

impl SandboxExecutor {
    /// Executor with real processes, the `docker` engine and Perl.
    pub fn new(options: ExecutionOptions) -> Self {
        Self::builder(options).build()
    }

    pub fn from_config(config: &Config) -> Self {
        Self::builder(config.options.clone())
            .engine(&config.engine)
            .interpreter(config.interpreter.clone())
            .build()
    }

    pub fn builder(options: ExecutionOptions) -> SandboxExecutorBuilder {
        SandboxExecutorBuilder {
            options,
            engine: "docker".to_string(),
            interpreter: Interpreter::default(),
            runner: None,
            cache: None,
            pull_backoff: None,
        }
    }

    pub const fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Execute `code` according to the configured mode.
    ///
    /// Never fails: rejections, infrastructure failures, timeouts and
    /// interpreter errors are all reported in the result.
    #[instrument(skip(self, code), fields(mode = self.options.mode.as_str(), code_len = code.len()))]
    pub async fn execute(&self, code: &str) -> ExecutionOutcome {
        let mode = self.options.mode;
        if let Some(rejected) = self.validate(code, mode).await {
            return match mode {
                ExecutionMode::Container => ExecutionOutcome::Container(rejected),
                ExecutionMode::Local => ExecutionOutcome::Local(rejected),
            };
        }

        if mode == ExecutionMode::Local {
            let mut result = self.run_local(code).await;
            result.perl_version = self.versions.resolve(&self.options.image, ExecutionMode::Local).await;
            return ExecutionOutcome::Local(result);
        }

        let run = self.run_container(code).await;
        if self.options.allow_local_fallback && run.engine_unreachable() {
            warn!("Container engine unreachable, running on the host WITHOUT isolation");
            return ExecutionOutcome::Local(self.run_local(code).await);
        }

        ExecutionOutcome::Container(self.settle(run).await)
    }

    /// Execute `code` in a container regardless of mode, never falling back.
    #[instrument(skip(self, code), fields(code_len = code.len()))]
    pub async fn execute_contained(&self, code: &str) -> ContainedResult {
        if let Some(rejected) = self.validate(code, ExecutionMode::Container).await {
            return ContainedResult(rejected);
        }
        let run = self.run_container(code).await;
        ContainedResult(self.settle(run).await)
    }

    /// Fast rejection of blank or oversized input. Spawns nothing; the
    /// version is reported only if already known.
    async fn validate(&self, code: &str, mode: ExecutionMode) -> Option<ExecutionResult> {
        let stderr = if code.trim().is_empty() {
            "No code provided"
        } else if code.len() > MAX_CODE_BYTES {
            "Code too large (max 64KB)"
        } else {
            return None;
        };
        debug!(reason = stderr, "Rejected input");

        let image = match mode {
            ExecutionMode::Container => self.options.image.clone(),
            ExecutionMode::Local => self.interpreter.local_tag(),
        };
        let mut result = ExecutionResult::rejected(1, stderr, image);
        result.perl_version = self.versions.cached(&self.options.image, mode).await;
        Some(result)
    }

    async fn run_container(&self, code: &str) -> ContainerRun {
        let image = &self.options.image;
        if let Err(e) = self.images.ensure(image).await {
            return ContainerRun::ImageUnavailable(e);
        }

        let name = format!("perlcode-exec-{}", Uuid::new_v4());
        let mut command = vec![self.interpreter.program.clone()];
        command.extend(self.interpreter.stdin_args.iter().cloned());
        let spec = CommandSpec::new(
            &self.engine,
            self.profile.run_args(&name, true, &command),
            self.options.timeout,
        )
        .stdin(code)
        .kill_container(&self.engine, &name);

        debug!(container = %name, "Launching container");
        match self.runner.run(spec).await {
            // Engine and snippet share this stderr, so a snippet that prints the
            // signature and fails is indistinguishable from a dead engine. With
            // fallback on it gets a second, unisolated run: keep fallback off for
            // public input.
            Ok(out) if out.exit_code != 0 && !out.timed_out && engine_unreachable(&out.stderr) => {
                warn!(stderr = %out.stderr.trim(), "Container engine unreachable");
                ContainerRun::EngineUnreachable(self.infra_failure(
                    format!("container engine unavailable while running {image}"),
                    out.runtime,
                ))
            }
            Ok(out) => ContainerRun::Finished(finished(out, image.clone())),
            Err(ProcessError::Spawn { source, .. }) => {
                warn!(error = %source, "Container engine CLI could not be started");
                ContainerRun::EngineUnreachable(self.infra_failure(
                    format!("container engine unavailable while running {image}"),
                    Duration::ZERO,
                ))
            }
            Err(e) => {
                warn!(error = %e, "Container run failed");
                ContainerRun::Finished(
                    self.infra_failure(format!("sandbox run failed for {image}"), Duration::ZERO),
                )
            }
        }
    }

    /// Attach the interpreter version to a container result.
    async fn settle(&self, run: ContainerRun) -> ExecutionResult {
        let image = &self.options.image;
        match run {
            ContainerRun::Finished(mut result) => {
                result.perl_version = self.versions.resolve(image, ExecutionMode::Container).await;
                result
            }
            // Probing would repeat the same failing inspect/pull; report what is known.
            ContainerRun::ImageUnavailable(e) => {
                let mut result = self.infra_failure(e.to_string(), Duration::ZERO);
                result.perl_version = self.versions.cached(image, ExecutionMode::Container).await;
                result
            }
            ContainerRun::EngineUnreachable(mut result) => {
                result.perl_version = self.versions.cached(image, ExecutionMode::Container).await;
                result
            }
        }
    }

    /// Run on the host interpreter, with the same timeout discipline.
    /// No isolation: never for untrusted input.
    async fn run_local(&self, code: &str) -> ExecutionResult {
        let tag = self.interpreter.local_tag();
        let spec = CommandSpec::new(
            &self.interpreter.program,
            self.interpreter.stdin_args.iter().cloned(),
            self.options.timeout,
        )
        .stdin(code);

        info!(interpreter = %self.interpreter.program, "Running on host interpreter");
        match self.runner.run(spec).await {
            Ok(out) => finished(out, tag),
            Err(ProcessError::Spawn { source, .. }) => {
                warn!(error = %source, "Host interpreter could not be started");
                ExecutionResult::rejected(
                    MISSING_INTERPRETER_EXIT_CODE,
                    format!("{tag} interpreter not available"),
                    tag,
                )
            }
            Err(e) => {
                warn!(error = %e, "Host run failed");
                ExecutionResult::rejected(INFRA_EXIT_CODE, "local run failed", tag)
            }
        }
    }

    fn infra_failure(&self, stderr: String, runtime: Duration) -> ExecutionResult {
        ExecutionResult {
            runtime_ms: millis(runtime),
            ..ExecutionResult::rejected(INFRA_EXIT_CODE, stderr, self.options.image.clone())
        }
    }
}

fn finished(out: CommandOutput, image: String) -> ExecutionResult {
    ExecutionResult {
        success: out.succeeded(),
        runtime_ms: millis(out.runtime),
        stdout: out.stdout,
        stderr: out.stderr,
        exit_code: out.exit_code,
        timed_out: out.timed_out,
        image,
        perl_version: None,
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Assembles a [`SandboxExecutor`].
pub struct SandboxExecutorBuilder {
    options: ExecutionOptions,
    engine: String,
    interpreter: Interpreter,
    runner: Option<Arc<dyn CommandRunner>>,
    cache: Option<Arc<VersionCache>>,
    pull_backoff: Option<Duration>,
}

impl SandboxExecutorBuilder {
    /// Container engine CLI (default `docker`).
    #[must_use]
    pub fn engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    #[must_use]
    pub fn interpreter(mut self, interpreter: Interpreter) -> Self {
        self.interpreter = interpreter;
        self
    }

    #[must_use]
    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Share a version cache between executors.
    #[must_use]
    pub fn version_cache(mut self, cache: Arc<VersionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub const fn pull_backoff(mut self, backoff: Duration) -> Self {
        self.pull_backoff = Some(backoff);
        self
    }

    pub fn build(self) -> SandboxExecutor {
        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(SystemRunner::new()) as Arc<dyn CommandRunner>);
        let mut images = ImageManager::new(Arc::clone(&runner), &self.engine);
        if let Some(backoff) = self.pull_backoff {
            images = images.with_retry_backoff(backoff);
        }
        let profile = IsolationProfile::from_options(&self.options);
        let versions = VersionProbe::new(
            Arc::clone(&runner),
            images.clone(),
            profile.clone(),
            self.interpreter.clone(),
            self.cache.unwrap_or_default(),
        );

        SandboxExecutor {
            options: self.options,
            engine: self.engine,
            interpreter: self.interpreter,
            profile,
            runner,
            images,
            versions,
        }
    }
}
