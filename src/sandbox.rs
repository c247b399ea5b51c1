//! Untrusted code execution.
//!
//! The executor validates a snippet, makes sure the interpreter image is
//! present, and runs the snippet in a locked-down container with the code
//! streamed over stdin. Every failure mode comes back as an
//! [`ExecutionResult`]; nothing is raised to the caller.

mod executor;
mod image;
mod isolation;
mod version;

pub use executor::{ContainedResult, SandboxExecutor, MAX_CODE_BYTES};
pub use image::{ImageError, ImageManager};
pub use isolation::IsolationProfile;
pub use version::{VersionCache, VersionProbe};

use serde::Serialize;

/// Result of one execution request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// True iff the exit code is 0 and the run did not time out.
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Wall-clock time from spawn to exit or kill.
    pub runtime_ms: u64,
    pub timed_out: bool,
    /// Image used, or the local sentinel (e.g. `local-perl`) for host runs.
    pub image: String,
    /// Interpreter version, absent when it could not be determined.
    pub perl_version: Option<String>,
}

impl ExecutionResult {
    /// A result for a request that never reached a process.
    pub(crate) fn rejected(exit_code: i32, stderr: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
            runtime_ms: 0,
            timed_out: false,
            image: image.into(),
            perl_version: None,
        }
    }
}

/// Where an execution actually ran.
///
/// Host runs have no isolation at all; they are kept distinct so callers can
/// tell (and refuse) them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Ran (or was rejected) under the container isolation profile.
    Container(ExecutionResult),
    /// Ran directly on the host interpreter, by configuration or fallback.
    Local(ExecutionResult),
}

impl ExecutionOutcome {
    pub const fn result(&self) -> &ExecutionResult {
        match self {
            Self::Container(result) | Self::Local(result) => result,
        }
    }

    pub fn into_result(self) -> ExecutionResult {
        match self {
            Self::Container(result) | Self::Local(result) => result,
        }
    }

    pub const fn is_isolated(&self) -> bool {
        matches!(self, Self::Container(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_camel_case_fields() {
        let result = ExecutionResult {
            success: true,
            stdout: "hi\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
            runtime_ms: 42,
            timed_out: false,
            image: "perl:5.38-slim".to_string(),
            perl_version: Some("v5.38.2".to_string()),
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["exitCode"], 0);
        assert_eq!(json["runtimeMs"], 42);
        assert_eq!(json["timedOut"], false);
        assert_eq!(json["perlVersion"], "v5.38.2");
    }

    #[test]
    fn outcome_exposes_isolation() {
        let result = ExecutionResult::rejected(1, "No code provided", "perl:5.38-slim");
        let contained = ExecutionOutcome::Container(result.clone());
        let local = ExecutionOutcome::Local(result.clone());

        assert!(contained.is_isolated());
        assert!(!local.is_isolated());
        assert_eq!(local.result(), &result);
        assert_eq!(contained.into_result(), result);
    }
}
