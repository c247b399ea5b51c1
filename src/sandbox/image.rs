//! Makes sure the interpreter image is present before a run.
//!
//! A local `image inspect` is the fast path and needs no network. Otherwise
//! the image is pulled, with one retry after a short backoff. The check runs
//! before every execution: images can be evicted, and an inspect is cheap
//! next to a wasted run.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::process::{CommandRunner, CommandSpec, ProcessError};

const INSPECT_TIMEOUT: Duration = Duration::from_secs(10);
const PULL_TIMEOUT: Duration = Duration::from_secs(180);
const PULL_ATTEMPTS: u32 = 2;
const PULL_BACKOFF: Duration = Duration::from_millis(1500);

/// Engine CLI output when its daemon is not running or not reachable.
static ENGINE_UNREACHABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)cannot connect to the (docker|podman) daemon|cannot connect to podman|is the docker daemon running")
        .expect("engine-unreachable pattern is valid")
});

/// True when engine output says the engine itself could not be reached.
pub(crate) fn engine_unreachable(stderr: &str) -> bool {
    ENGINE_UNREACHABLE.is_match(stderr)
}

/// Why an image could not be made available.
///
/// Messages name only the image and a failure category; engine output can
/// carry host paths and socket addresses and is logged instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("image pull timed out after {}s for {image}", timeout.as_secs())]
    PullTimedOut { image: String, timeout: Duration },

    #[error("image pull failed for {image}")]
    PullFailed { image: String },

    #[error("container engine unavailable while preparing {image}")]
    EngineUnreachable { image: String },
}

impl ImageError {
    pub const fn is_engine_unreachable(&self) -> bool {
        matches!(self, Self::EngineUnreachable { .. })
    }
}

/// Inspect-then-pull image provisioning.
#[derive(Clone)]
pub struct ImageManager {
    runner: Arc<dyn CommandRunner>,
    engine: String,
    pull_timeout: Duration,
    retry_backoff: Duration,
}

impl ImageManager {
    pub fn new(runner: Arc<dyn CommandRunner>, engine: impl Into<String>) -> Self {
        Self {
            runner,
            engine: engine.into(),
            pull_timeout: PULL_TIMEOUT,
            retry_backoff: PULL_BACKOFF,
        }
    }

    /// Override the delay between pull attempts.
    #[must_use]
    pub const fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// Ensure `image` is present locally.
    #[instrument(skip(self), fields(engine = %self.engine))]
    pub async fn ensure(&self, image: &str) -> Result<(), ImageError> {
        let inspect = CommandSpec::new(&self.engine, ["image", "inspect", image], INSPECT_TIMEOUT);
        match self.runner.run(inspect).await {
            Ok(out) if out.succeeded() => {
                debug!("Image present");
                return Ok(());
            }
            Ok(out) if engine_unreachable(&out.stderr) => {
                warn!(stderr = %out.stderr.trim(), "Container engine unreachable");
                return Err(ImageError::EngineUnreachable {
                    image: image.to_string(),
                });
            }
            Err(ProcessError::Spawn { source, .. }) => {
                warn!(error = %source, "Container engine CLI could not be started");
                return Err(ImageError::EngineUnreachable {
                    image: image.to_string(),
                });
            }
            Ok(_) | Err(_) => debug!("Image not present locally"),
        }

        let mut last_error = ImageError::PullFailed {
            image: image.to_string(),
        };
        for attempt in 1..=PULL_ATTEMPTS {
            info!(attempt, "Pulling image");
            let pull = CommandSpec::new(&self.engine, ["pull", image], self.pull_timeout);
            match self.runner.run(pull).await {
                Ok(out) if out.succeeded() => {
                    info!(attempt, "Image pulled");
                    return Ok(());
                }
                Ok(out) if out.timed_out => {
                    warn!(attempt, timeout_s = self.pull_timeout.as_secs(), "Image pull timed out");
                    last_error = ImageError::PullTimedOut {
                        image: image.to_string(),
                        timeout: self.pull_timeout,
                    };
                }
                Ok(out) => {
                    let detail = if out.stderr.trim().is_empty() {
                        out.stdout
                    } else {
                        out.stderr
                    };
                    warn!(attempt, exit_code = out.exit_code, output = %detail.trim(), "Image pull failed");
                    last_error = ImageError::PullFailed {
                        image: image.to_string(),
                    };
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Image pull could not run");
                    last_error = ImageError::PullFailed {
                        image: image.to_string(),
                    };
                }
            }

            if attempt < PULL_ATTEMPTS {
                tokio::time::sleep(self.retry_backoff).await;
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::{exited, not_installed, timed_out, FakeRunner};

    const IMAGE: &str = "perl:5.38-slim";

    fn manager(runner: &Arc<FakeRunner>) -> ImageManager {
        ImageManager::new(Arc::clone(runner) as Arc<dyn CommandRunner>, "docker")
            .with_retry_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn present_image_needs_no_pull() {
        let runner = Arc::new(FakeRunner::new(|_| exited(0, "[{}]", "")));

        manager(&runner).ensure(IMAGE).await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].argv(), ["docker", "image", "inspect", IMAGE]);
        assert_eq!(runner.count("pull"), 0);
    }

    #[tokio::test]
    async fn missing_image_is_pulled() {
        let runner = Arc::new(FakeRunner::new(|spec| match spec.args[0].as_str() {
            "image" => exited(1, "", "Error: No such image: perl:5.38-slim"),
            _ => exited(0, "Status: Downloaded newer image", ""),
        }));

        manager(&runner).ensure(IMAGE).await.unwrap();

        assert_eq!(runner.count("pull"), 1);
        assert_eq!(runner.calls()[1].timeout, PULL_TIMEOUT);
    }

    #[tokio::test]
    async fn pull_is_retried_once() {
        let runner = Arc::new(FakeRunner::new(|spec| match spec.args[0].as_str() {
            "image" => exited(1, "", "No such image"),
            _ => exited(1, "", "Get https://registry-1.docker.io/v2/: dial tcp 10.0.0.1:443: i/o timeout"),
        }));

        let err = manager(&runner).ensure(IMAGE).await.unwrap_err();

        assert_eq!(runner.count("pull"), 2);
        assert_eq!(err, ImageError::PullFailed { image: IMAGE.into() });
        // Registry addresses never reach the message.
        assert_eq!(err.to_string(), "image pull failed for perl:5.38-slim");
    }

    #[tokio::test]
    async fn second_attempt_can_succeed() {
        let pulls = std::sync::atomic::AtomicUsize::new(0);
        let runner = Arc::new(FakeRunner::new(move |spec| match spec.args[0].as_str() {
            "image" => exited(1, "", "No such image"),
            _ if pulls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 => {
                exited(1, "", "net/http: TLS handshake timeout")
            }
            _ => exited(0, "", ""),
        }));

        manager(&runner).ensure(IMAGE).await.unwrap();
        assert_eq!(runner.count("pull"), 2);
    }

    #[tokio::test]
    async fn pull_timeout_is_reported_distinctly() {
        let runner = Arc::new(FakeRunner::new(|spec| match spec.args[0].as_str() {
            "image" => exited(1, "", "No such image"),
            _ => timed_out(),
        }));

        let err = manager(&runner).ensure(IMAGE).await.unwrap_err();

        assert!(matches!(err, ImageError::PullTimedOut { .. }));
        assert_eq!(
            err.to_string(),
            "image pull timed out after 180s for perl:5.38-slim"
        );
    }

    #[tokio::test]
    async fn unreachable_engine_skips_pulling() {
        let runner = Arc::new(FakeRunner::new(|_| {
            exited(
                1,
                "",
                "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?",
            )
        }));

        let err = manager(&runner).ensure(IMAGE).await.unwrap_err();

        assert!(err.is_engine_unreachable());
        assert_eq!(runner.count("pull"), 0);
        assert!(!err.to_string().contains("docker.sock"));
    }

    #[tokio::test]
    async fn missing_engine_cli_is_unreachable() {
        let runner = Arc::new(FakeRunner::new(|_| not_installed("docker")));

        let err = manager(&runner).ensure(IMAGE).await.unwrap_err();

        assert!(err.is_engine_unreachable());
    }

    #[test]
    fn recognizes_engine_unreachable_output() {
        assert!(engine_unreachable(
            "docker: Cannot connect to the Docker daemon at unix:///var/run/docker.sock."
        ));
        assert!(engine_unreachable("Error: cannot connect to Podman. Please verify"));
        assert!(!engine_unreachable("Can't locate Foo.pm in @INC"));
    }
}
