//! The execute request handler: rate limiting, snippet eligibility and
//! run bookkeeping around the sandbox executor.
//!
//! Replies carry an HTTP-style status and a JSON body so the same handler
//! can sit behind MCP or a web route.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

use crate::gate::ExecutionGate;
use crate::sandbox::SandboxExecutor;

/// A published code example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snippet {
    pub slug: String,
    #[serde(default)]
    pub code_snippet: Option<String>,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub published_at: Option<String>,
}

impl Snippet {
    /// Verified, published code, if this snippet may be executed.
    pub fn executable_code(&self) -> Option<&str> {
        if !self.is_verified || self.published_at.is_none() {
            return None;
        }
        self.code_snippet.as_deref().filter(|code| !code.is_empty())
    }
}

/// Source of snippets by slug.
#[async_trait]
pub trait SnippetCatalog: Send + Sync {
    async fn lookup(&self, slug: &str) -> Result<Option<Snippet>>;
}

/// Catalog loaded from a JSON array of snippets.
#[derive(Debug, Default)]
pub struct JsonCatalog {
    snippets: HashMap<String, Snippet>,
}

impl JsonCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read snippet catalog {}", path.display()))?;
        let snippets: Vec<Snippet> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse snippet catalog {}", path.display()))?;
        info!(path = %path.display(), count = snippets.len(), "Loaded snippet catalog");
        Ok(Self::from_snippets(snippets))
    }

    pub fn from_snippets(snippets: impl IntoIterator<Item = Snippet>) -> Self {
        Self {
            snippets: snippets
                .into_iter()
                .map(|snippet| (snippet.slug.clone(), snippet))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.snippets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snippets.is_empty()
    }
}

#[async_trait]
impl SnippetCatalog for JsonCatalog {
    async fn lookup(&self, slug: &str) -> Result<Option<Snippet>> {
        Ok(self.snippets.get(slug).cloned())
    }
}

/// One recorded execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeRun {
    pub session_token: String,
    pub slug: String,
    pub code_snippet: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub runtime_ms: u64,
    pub perl_version: Option<String>,
}

/// Per-session execution accounting.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Executions recorded for `session_token` today.
    async fn daily_count(&self, session_token: &str) -> Result<u32>;

    /// Store `run` and count it against its session.
    async fn record(&self, run: CodeRun) -> Result<()>;
}

#[derive(Debug, Default)]
struct LedgerState {
    /// session token -> (UTC day number, executions that day)
    counts: HashMap<String, (u64, u32)>,
    runs: Vec<CodeRun>,
}

/// In-memory ledger; counts reset at UTC midnight.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn runs(&self) -> Vec<CodeRun> {
        self.state.lock().await.runs.clone()
    }
}

fn utc_day() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| since.as_secs() / 86_400)
}

#[async_trait]
impl RunLedger for MemoryLedger {
    async fn daily_count(&self, session_token: &str) -> Result<u32> {
        let today = utc_day();
        let state = self.state.lock().await;
        Ok(match state.counts.get(session_token) {
            Some(&(day, count)) if day == today => count,
            _ => 0,
        })
    }

    async fn record(&self, run: CodeRun) -> Result<()> {
        let today = utc_day();
        let mut state = self.state.lock().await;
        let entry = state
            .counts
            .entry(run.session_token.clone())
            .or_insert((today, 0));
        if entry.0 != today {
            *entry = (today, 0);
        }
        entry.1 = entry.1.saturating_add(1);
        state.runs.push(run);
        Ok(())
    }
}

/// Incoming execute request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteRequest {
    pub slug: Option<String>,
    pub session_token: Option<String>,
}

/// Status code and JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteReply {
    pub status: u16,
    pub body: Value,
}

impl ExecuteReply {
    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            body: json!({ "error": message }),
        }
    }

    pub const fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// Runs verified snippets on behalf of rate-limited sessions.
pub struct ExecuteService {
    executor: SandboxExecutor,
    gate: ExecutionGate,
    catalog: Arc<dyn SnippetCatalog>,
    ledger: Arc<dyn RunLedger>,
    daily_limit: u32,
}

impl ExecuteService {
    pub fn new(
        executor: SandboxExecutor,
        gate: ExecutionGate,
        catalog: Arc<dyn SnippetCatalog>,
        ledger: Arc<dyn RunLedger>,
        daily_limit: u32,
    ) -> Self {
        Self {
            executor,
            gate,
            catalog,
            ledger,
            daily_limit: daily_limit.max(1),
        }
    }

    #[instrument(skip(self, request), fields(slug = request.slug.as_deref().unwrap_or("")))]
    pub async fn handle(&self, request: ExecuteRequest) -> ExecuteReply {
        let Some(slug) = request.slug.filter(|s| !s.is_empty()) else {
            return ExecuteReply::error(400, "Slug is required");
        };
        let Some(session_token) = request.session_token.filter(|s| !s.is_empty()) else {
            return ExecuteReply::error(400, "Session token is required");
        };

        match self.run(slug, session_token).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = ?e, "Execute error");
                ExecuteReply::error(500, "Execution failed")
            }
        }
    }

    async fn run(&self, slug: String, session_token: String) -> Result<ExecuteReply> {
        let count = self
            .ledger
            .daily_count(&session_token)
            .await
            .context("Failed to read session count")?;
        if count >= self.daily_limit {
            debug!(count, limit = self.daily_limit, "Daily limit reached");
            return Ok(ExecuteReply {
                status: 429,
                body: json!({
                    "error": "Daily execution limit reached. Try again tomorrow.",
                    "limit": self.daily_limit,
                    "remaining": 0,
                }),
            });
        }

        let Some(snippet) = self
            .catalog
            .lookup(&slug)
            .await
            .context("Failed to look up snippet")?
        else {
            return Ok(ExecuteReply::error(404, "Not found"));
        };
        let Some(code) = snippet.executable_code() else {
            return Ok(ExecuteReply::error(
                403,
                "Code execution is not available for this page",
            ));
        };

        let _permit = self.gate.acquire().await?;
        // Public input: never leaves the container profile, whatever the mode.
        let result = self.executor.execute_contained(code).await.into_result();

        self.ledger
            .record(CodeRun {
                session_token,
                slug: snippet.slug.clone(),
                code_snippet: code.to_string(),
                stdout: result.stdout.clone(),
                stderr: result.stderr.clone(),
                exit_code: result.exit_code,
                runtime_ms: result.runtime_ms,
                perl_version: result.perl_version.clone(),
            })
            .await
            .context("Failed to record code run")?;

        let remaining = self.daily_limit.saturating_sub(count + 1);
        info!(
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            runtime_ms = result.runtime_ms,
            remaining,
            "Snippet executed"
        );

        Ok(ExecuteReply {
            status: 200,
            body: json!({
                "success": result.success,
                "stdout": result.stdout,
                "stderr": result.stderr,
                "exitCode": result.exit_code,
                "runtimeMs": result.runtime_ms,
                "perlVersion": result.perl_version,
                "remaining": remaining,
            }),
        })
    }
}
