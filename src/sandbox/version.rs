//! Interpreter version probe with a per-image cache.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::image::ImageManager;
use super::isolation::IsolationProfile;
use crate::config::{ExecutionMode, Interpreter};
use crate::process::{CommandRunner, CommandSpec};

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

static VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"v?\d+(?:\.\d+)+").expect("version pattern is valid"));

/// Resolved interpreter versions, keyed by image (or local tag).
///
/// Populated at most once per key and never invalidated: a pulled image is
/// immutable. Failed probes are not cached.
#[derive(Debug, Default)]
pub struct VersionCache {
    entries: RwLock<HashMap<String, String>>,
}

impl VersionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).cloned()
    }

    /// First write wins; concurrent probes of one key resolve to the same value.
    pub async fn insert(&self, key: &str, version: &str) {
        self.entries
            .write()
            .await
            .entry(key.to_string())
            .or_insert_with(|| version.to_string());
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Runs a trivial interpreter invocation to learn its version.
#[derive(Clone)]
pub struct VersionProbe {
    runner: Arc<dyn CommandRunner>,
    images: ImageManager,
    profile: IsolationProfile,
    interpreter: Interpreter,
    cache: Arc<VersionCache>,
}

impl VersionProbe {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        images: ImageManager,
        profile: IsolationProfile,
        interpreter: Interpreter,
        cache: Arc<VersionCache>,
    ) -> Self {
        Self {
            runner,
            images,
            profile,
            interpreter,
            cache,
        }
    }

    /// Version for `image` (container mode) or the host interpreter (local mode).
    ///
    /// Any failure yields `None`.
    #[instrument(skip(self, mode), fields(mode = mode.as_str()))]
    pub async fn resolve(&self, image: &str, mode: ExecutionMode) -> Option<String> {
        let key = self.cache_key(image, mode);
        if let Some(version) = self.cache.get(&key).await {
            return Some(version);
        }

        let version = match mode {
            ExecutionMode::Container => self.probe_container(image).await,
            ExecutionMode::Local => self.probe_local().await,
        }?;

        self.cache.insert(&key, &version).await;
        Some(version)
    }

    /// Cached version only; never spawns a probe.
    pub async fn cached(&self, image: &str, mode: ExecutionMode) -> Option<String> {
        self.cache.get(&self.cache_key(image, mode)).await
    }

    fn cache_key(&self, image: &str, mode: ExecutionMode) -> String {
        match mode {
            ExecutionMode::Container => image.to_string(),
            ExecutionMode::Local => self.interpreter.local_tag(),
        }
    }

    async fn probe_container(&self, image: &str) -> Option<String> {
        if let Err(e) = self.images.ensure(image).await {
            debug!(error = %e, "Version probe skipped, image unavailable");
            return None;
        }

        let engine = self.images.engine();
        let name = format!("perlcode-probe-{}", Uuid::new_v4());
        let mut command = vec![self.interpreter.program.clone()];
        command.extend(self.interpreter.version_args.iter().cloned());

        let profile = IsolationProfile {
            image: image.to_string(),
            ..self.profile.clone()
        };
        let spec = CommandSpec::new(engine, profile.run_args(&name, false, &command), PROBE_TIMEOUT)
            .kill_container(engine, &name);
        self.probe(spec).await
    }

    async fn probe_local(&self) -> Option<String> {
        let spec = CommandSpec::new(
            &self.interpreter.program,
            self.interpreter.version_args.iter().cloned(),
            PROBE_TIMEOUT,
        );
        self.probe(spec).await
    }

    async fn probe(&self, spec: CommandSpec) -> Option<String> {
        match self.runner.run(spec).await {
            Ok(out) if out.succeeded() => {
                let version = parse_version(&out.stdout);
                if version.is_none() {
                    debug!(stdout = %out.stdout.trim(), "Unparseable version output");
                }
                version
            }
            Ok(out) => {
                debug!(exit_code = out.exit_code, timed_out = out.timed_out, "Version probe failed");
                None
            }
            Err(e) => {
                debug!(error = %e, "Version probe could not run");
                None
            }
        }
    }
}

fn parse_version(output: &str) -> Option<String> {
    VERSION.find(output.trim()).map(|m| m.as_str().to_string())
}
