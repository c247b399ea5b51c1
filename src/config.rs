//! Execution settings sourced from the environment.
//!
//! The surrounding service configures the sandbox through environment
//! variables. Every value is validated before an executor is built, so a
//! misconfigured deployment fails at startup rather than on the first run.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Minor-version-pinned interpreter image used when none is configured.
pub const DEFAULT_IMAGE: &str = "perl:5.38-slim";

/// Timeouts below this are raised to it; shorter runs cannot even start a container.
const MIN_TIMEOUT_MS: u64 = 250;

/// Invalid configuration value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got {value:?}")]
    NotPositive { var: &'static str, value: String },

    #[error("{var} must not be empty")]
    Empty { var: &'static str },

    #[error("{var}: {message}")]
    Invalid { var: &'static str, message: String },
}

/// Where submitted code runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Locked-down container (the only mode fit for untrusted input).
    #[default]
    Container,
    /// Host interpreter, no isolation.
    Local,
}

impl ExecutionMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Local => "local",
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" | "container" => Ok(Self::Container),
            "local" => Ok(Self::Local),
            other => Err(format!(
                "unknown execution mode {other:?} (expected docker, container or local)"
            )),
        }
    }
}

/// Per-run resource and isolation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Hard wall-clock limit for one run.
    pub timeout: Duration,
    /// Container image holding the interpreter.
    pub image: String,
    /// Memory ceiling in engine syntax (e.g. `256m`).
    pub memory: String,
    /// CPU ceiling in engine syntax (e.g. `1`, `0.5`).
    pub cpus: String,
    /// Maximum number of processes inside the container.
    pub pids_limit: u32,
    pub mode: ExecutionMode,
    /// Re-run on the host when the container engine is unreachable.
    /// Must stay off wherever public input is executed.
    pub allow_local_fallback: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            image: DEFAULT_IMAGE.to_string(),
            memory: "256m".to_string(),
            cpus: "1".to_string(),
            pids_limit: 64,
            mode: ExecutionMode::Container,
            allow_local_fallback: false,
        }
    }
}

/// How to invoke the interpreter, inside a container or on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    /// Program name or path.
    pub program: String,
    /// Arguments that make the program read its script from stdin.
    pub stdin_args: Vec<String>,
    /// Arguments for a side-effect-free invocation that prints the version.
    pub version_args: Vec<String>,
}

impl Interpreter {
    /// The Perl interpreter: `perl -` reads the script from stdin.
    pub fn perl() -> Self {
        Self::perl_at("perl")
    }

    /// Perl, invoked through a specific binary.
    pub fn perl_at(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            stdin_args: vec!["-".to_string()],
            version_args: vec!["-e".to_string(), "print $^V".to_string()],
        }
    }

    /// Image tag reported for host runs, e.g. `local-perl`.
    pub fn local_tag(&self) -> String {
        let name = self
            .program
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.program);
        format!("local-{name}")
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::perl()
    }
}

/// Top-level configuration for the daemon.
#[derive(Debug, Clone)]
pub struct Config {
    pub options: ExecutionOptions,

    /// Container engine CLI (`docker`, `podman`).
    pub engine: String,

    pub interpreter: Interpreter,

    /// Maximum simultaneous executions.
    pub concurrency: usize,

    /// Executions allowed per session per day.
    pub daily_limit: u32,

    /// JSON snippet catalog served by the execute tool.
    pub snippets_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            options: ExecutionOptions::default(),
            engine: "docker".to_string(),
            interpreter: Interpreter::default(),
            concurrency: 2,
            daily_limit: 20,
            snippets_path: None,
        }
    }
}

impl Config {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Unset variables take their defaults; set-but-invalid ones are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let base = defaults.options;

        let timeout_ms = positive(&lookup, "EXECUTION_TIMEOUT_MS", 2000)?;
        let mode = match lookup("PERLCODE_EXECUTION_MODE") {
            Some(raw) => raw.parse().map_err(|message| ConfigError::Invalid {
                var: "PERLCODE_EXECUTION_MODE",
                message,
            })?,
            None => base.mode,
        };

        let options = ExecutionOptions {
            timeout: Duration::from_millis(timeout_ms.max(MIN_TIMEOUT_MS)),
            image: non_empty(&lookup, "EXECUTION_IMAGE", &base.image)?,
            memory: non_empty(&lookup, "EXECUTION_MEMORY", &base.memory)?,
            cpus: non_empty(&lookup, "EXECUTION_CPUS", &base.cpus)?,
            pids_limit: narrow("EXECUTION_PIDS_LIMIT", positive(&lookup, "EXECUTION_PIDS_LIMIT", 64)?)?,
            mode,
            allow_local_fallback: flag(&lookup, "PERLCODE_ALLOW_LOCAL_PERL", false)?,
        };

        let program = non_empty(&lookup, "PERL_INTERPRETER", &defaults.interpreter.program)?;

        let config = Self {
            options,
            engine: non_empty(&lookup, "CONTAINER_ENGINE", &defaults.engine)?,
            interpreter: Interpreter::perl_at(program),
            concurrency: narrow(
                "EXECUTION_CONCURRENCY",
                positive(&lookup, "EXECUTION_CONCURRENCY", 2)?,
            )?,
            daily_limit: narrow(
                "DAILY_EXECUTION_LIMIT",
                positive(&lookup, "DAILY_EXECUTION_LIMIT", 20)?,
            )?,
            snippets_path: lookup("PERLCODE_SNIPPETS")
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
        };

        debug!(
            mode = config.options.mode.as_str(),
            image = %config.options.image,
            timeout_ms = config.options.timeout.as_millis(),
            concurrency = config.concurrency,
            "Configuration resolved"
        );

        Ok(config)
    }
}

fn positive<F>(lookup: &F, var: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ConfigError::NotPositive { var, value: raw }),
    }
}

fn narrow<T: TryFrom<u64>>(var: &'static str, value: u64) -> Result<T, ConfigError> {
    T::try_from(value).map_err(|_| ConfigError::Invalid {
        var,
        message: format!("{value} is out of range"),
    })
}

fn non_empty<F>(lookup: &F, var: &'static str, default: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(default.to_string()),
        Some(raw) if raw.trim().is_empty() => Err(ConfigError::Empty { var }),
        Some(raw) => Ok(raw.trim().to_string()),
    }
}

fn flag<F>(lookup: &F, var: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            message: format!("expected a boolean, got {raw:?}"),
        }),
    }
}
