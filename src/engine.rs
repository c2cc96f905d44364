//! Durable state-machine engine.
//!
//! Executes a linear chain of named transitions for a typed request/response
//! pair, persisting the current state and accumulated response between
//! transitions so a crashed run resumes where it left off. A transition that
//! returns [`TransitionError::Retry`] is re-entered with bounded backoff; one
//! that returns [`TransitionError::Abort`] terminates the run in the chain's
//! end state immediately.
//!
//! Runs are keyed by a caller-chosen resource id; the engine serializes runs
//! that share an id, so two activations of the same image key can never
//! execute concurrently. Each started run is assigned a monotonically
//! increasing version.
//!
//! Run records are JSON files in the engine's db directory, written with the
//! temp-file + rename pattern so a crash never leaves a torn record.

use crate::constants::{ENGINE_MAX_ATTEMPTS, ENGINE_RETRY_BASE_DELAY, ENGINE_RETRY_MAX_DELAY};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How a transition failed.
#[derive(Debug)]
pub enum TransitionError {
    /// Transient failure: the engine re-enters the transition after backoff.
    Retry(Error),
    /// Permanent failure: the run terminates in the end state, no retries.
    Abort(Error),
}

/// Outcome of one transition execution.
pub type TransitionResult<Resp> = std::result::Result<Resp, TransitionError>;

/// Per-execution context handed to a transition.
pub struct TransitionCtx {
    attempt: u64,
}

impl TransitionCtx {
    /// Number of times the current transition has already failed (0 on the
    /// first execution).
    pub fn attempt(&self) -> u64 {
        self.attempt
    }
}

/// Boxed transition handler.
pub type Handler<Req, Resp> = Box<
    dyn Fn(TransitionCtx, Req, Resp) -> Pin<Box<dyn Future<Output = TransitionResult<Resp>> + Send>>
        + Send
        + Sync,
>;

/// Wraps an async closure into a [`Handler`].
pub fn handler<Req, Resp, F, Fut>(f: F) -> Handler<Req, Resp>
where
    F: Fn(TransitionCtx, Req, Resp) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TransitionResult<Resp>> + Send + 'static,
{
    Box::new(move |ctx, req, resp| Box::pin(f(ctx, req, resp)))
}

/// A named linear chain of transitions.
pub struct Chain<Req, Resp> {
    name: String,
    states: Vec<(String, Handler<Req, Resp>)>,
    end_state: String,
}

/// Builder for [`Chain`]: `Chain::named(..).start(..).to(..)...end(..)`.
pub struct ChainBuilder<Req, Resp> {
    name: String,
    states: Vec<(String, Handler<Req, Resp>)>,
}

impl<Req, Resp> Chain<Req, Resp> {
    /// Begins a chain definition.
    pub fn named(name: &str) -> ChainBuilder<Req, Resp> {
        ChainBuilder {
            name: name.to_string(),
            states: Vec::new(),
        }
    }
}

impl<Req, Resp> ChainBuilder<Req, Resp> {
    /// Adds the initial state.
    pub fn start(mut self, state: &str, handler: Handler<Req, Resp>) -> Self {
        self.states.push((state.to_string(), handler));
        self
    }

    /// Adds a subsequent state.
    pub fn to(mut self, state: &str, handler: Handler<Req, Resp>) -> Self {
        self.states.push((state.to_string(), handler));
        self
    }

    /// Names the terminal failure state and finishes the chain.
    pub fn end(self, end_state: &str) -> Chain<Req, Resp> {
        Chain {
            name: self.name,
            states: self.states,
            end_state: end_state.to_string(),
        }
    }
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Complete,
    Failed,
}

/// Durable record of one run, serialized to the engine db directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord<Req, Resp> {
    pub version: String,
    pub resource_id: String,
    pub request: Req,
    pub state: String,
    pub response: Resp,
    pub status: RunStatus,
    pub attempt: u64,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Final result of a run, as observed by [`Engine::wait`].
#[derive(Debug, Clone)]
pub struct RunOutcome<Resp> {
    pub status: RunStatus,
    pub response: Resp,
    pub error: Option<String>,
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Backstop on per-state attempts; the pipeline's own retry budget is
    /// expected to abort first.
    pub max_attempts: u64,
    /// Base delay of the exponential backoff between retries.
    pub retry_base_delay: Duration,
    /// Cap on a single backoff sleep.
    pub retry_max_delay: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_attempts: ENGINE_MAX_ATTEMPTS,
            retry_base_delay: ENGINE_RETRY_BASE_DELAY,
            retry_max_delay: ENGINE_RETRY_MAX_DELAY,
        }
    }
}

struct Inner<Req, Resp> {
    db_dir: PathBuf,
    options: EngineOptions,
    chain: Chain<Req, Resp>,
    runs: Mutex<HashMap<String, watch::Receiver<Option<RunOutcome<Resp>>>>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Durable state-machine engine over one [`Chain`].
pub struct Engine<Req, Resp> {
    inner: Arc<Inner<Req, Resp>>,
}

impl<Req, Resp> Clone for Engine<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Req, Resp> Engine<Req, Resp>
where
    Req: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    Resp: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Opens the engine over `db_dir`, creating the directory if needed.
    pub fn new(db_dir: &Path, chain: Chain<Req, Resp>, options: EngineOptions) -> Result<Self> {
        std::fs::create_dir_all(db_dir)?;
        Ok(Self {
            inner: Arc::new(Inner {
                db_dir: db_dir.to_path_buf(),
                options,
                chain,
                runs: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Starts (or resumes) a run for `resource_id` and returns its version.
    ///
    /// If a run for this resource is still marked running (live in this
    /// process, or recovered from a crash) that run is resumed and its
    /// existing version returned instead of starting a fresh one.
    pub fn start(&self, resource_id: &str, request: Req, response: Resp) -> Result<String> {
        let path = self.inner.record_path(resource_id);

        if let Some(existing) = Inner::<Req, Resp>::load_record(&path)? {
            if existing.status == RunStatus::Running {
                let version = existing.version.clone();
                let live = self.inner.runs.lock().unwrap().contains_key(&version);
                if !live {
                    info!(
                        resource_id,
                        version = %version,
                        state = %existing.state,
                        "resuming interrupted run"
                    );
                    self.spawn_run(existing);
                }
                return Ok(version);
            }
        }

        let first_state = self
            .inner
            .chain
            .states
            .first()
            .map(|(name, _)| name.clone())
            .ok_or_else(|| Error::Engine("chain has no states".to_string()))?;

        let now = Utc::now();
        let record = RunRecord {
            version: Uuid::now_v7().to_string(),
            resource_id: resource_id.to_string(),
            request,
            state: first_state,
            response,
            status: RunStatus::Running,
            attempt: 0,
            error: None,
            started_at: now,
            updated_at: now,
        };
        self.inner.persist(&record)?;

        info!(
            chain = %self.inner.chain.name,
            resource_id,
            version = %record.version,
            "run started"
        );
        let version = record.version.clone();
        self.spawn_run(record);
        Ok(version)
    }

    /// Re-spawns every unfinished run found in the db directory. Returns the
    /// resumed versions.
    pub fn resume(&self) -> Result<Vec<String>> {
        let mut resumed = Vec::new();
        for entry in std::fs::read_dir(&self.inner.db_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let record = match Inner::<Req, Resp>::load_record(&path)? {
                Some(record) => record,
                None => continue,
            };
            if record.status != RunStatus::Running {
                continue;
            }
            let live = self
                .inner
                .runs
                .lock()
                .unwrap()
                .contains_key(&record.version);
            if live {
                continue;
            }
            info!(
                resource_id = %record.resource_id,
                version = %record.version,
                state = %record.state,
                "resuming run"
            );
            resumed.push(record.version.clone());
            self.spawn_run(record);
        }
        Ok(resumed)
    }

    /// Blocks until the run identified by `version` finishes.
    pub async fn wait(&self, version: &str) -> Result<RunOutcome<Resp>> {
        let rx = self.inner.runs.lock().unwrap().get(version).cloned();

        if let Some(mut rx) = rx {
            let outcome = rx
                .wait_for(|outcome| outcome.is_some())
                .await
                .map_err(|_| Error::Engine(format!("run {} dropped before finishing", version)))?;
            return Ok(outcome.clone().expect("watch value checked above"));
        }

        // Not live in this process: look for a finished record on disk.
        for entry in std::fs::read_dir(&self.inner.db_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = Inner::<Req, Resp>::load_record(&path)? {
                if record.version == version && record.status != RunStatus::Running {
                    return Ok(RunOutcome {
                        status: record.status,
                        response: record.response,
                        error: record.error,
                    });
                }
            }
        }

        Err(Error::Engine(format!("unknown run: {}", version)))
    }

    /// Reads the persisted record for `resource_id`, if any.
    pub fn record_for(&self, resource_id: &str) -> Result<Option<RunRecord<Req, Resp>>> {
        Inner::<Req, Resp>::load_record(&self.inner.record_path(resource_id))
    }

    fn spawn_run(&self, record: RunRecord<Req, Resp>) {
        let (tx, rx) = watch::channel(None);
        self.inner
            .runs
            .lock()
            .unwrap()
            .insert(record.version.clone(), rx);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let outcome = drive(inner, record).await;
            let _ = tx.send(Some(outcome));
        });
    }
}

impl<Req, Resp> Inner<Req, Resp>
where
    Req: Serialize + DeserializeOwned,
    Resp: Serialize + DeserializeOwned,
{
    /// Record file for a resource id. The sanitized id keeps records legible;
    /// the digest suffix keeps ids that share a basename from colliding.
    fn record_path(&self, resource_id: &str) -> PathBuf {
        let safe: String = resource_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        let digest = hex::encode(Sha256::digest(resource_id.as_bytes()));
        self.db_dir.join(format!("{}-{}.json", safe, &digest[..12]))
    }

    fn load_record(path: &Path) -> Result<Option<RunRecord<Req, Resp>>> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        let record = serde_json::from_slice(&raw)
            .map_err(|e| Error::Serialization(format!("{}: {}", path.display(), e)))?;
        Ok(Some(record))
    }

    /// Atomic write: temp file then rename.
    fn persist(&self, record: &RunRecord<Req, Resp>) -> Result<()> {
        let path = self.record_path(&record.resource_id);
        let raw = serde_json::to_vec_pretty(record)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let tmp = path.with_extension(format!("tmp.{}", Uuid::now_v7()));
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            Error::Io(e)
        })?;
        Ok(())
    }

    fn key_lock(&self, resource_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(resource_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn backoff(&self, attempt: u64) -> Duration {
        let shift = attempt.saturating_sub(1).min(16) as u32;
        self.options
            .retry_base_delay
            .saturating_mul(1u32 << shift)
            .min(self.options.retry_max_delay)
    }
}

/// Executes one run to completion, persisting progress after every step.
async fn drive<Req, Resp>(
    inner: Arc<Inner<Req, Resp>>,
    mut record: RunRecord<Req, Resp>,
) -> RunOutcome<Resp>
where
    Req: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    Resp: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    // Serialize runs sharing a resource id.
    let lock = inner.key_lock(&record.resource_id);
    let _guard = lock.lock().await;

    let mut idx = inner
        .chain
        .states
        .iter()
        .position(|(name, _)| *name == record.state)
        .unwrap_or(0);

    while idx < inner.chain.states.len() {
        let (name, transition) = &inner.chain.states[idx];
        record.state = name.clone();
        record.updated_at = Utc::now();
        if let Err(e) = inner.persist(&record) {
            error!(version = %record.version, error = %e, "cannot persist run record");
            record.status = RunStatus::Failed;
            record.error = Some(e.to_string());
            break;
        }

        debug!(
            version = %record.version,
            state = %name,
            attempt = record.attempt,
            "executing transition"
        );

        let ctx = TransitionCtx {
            attempt: record.attempt,
        };
        match transition(ctx, record.request.clone(), record.response.clone()).await {
            Ok(response) => {
                record.response = response;
                record.attempt = 0;
                idx += 1;
            }
            Err(TransitionError::Retry(e)) => {
                record.attempt += 1;
                warn!(
                    version = %record.version,
                    state = %name,
                    attempt = record.attempt,
                    error = %e,
                    "transition failed, retrying"
                );
                if record.attempt >= inner.options.max_attempts {
                    record.status = RunStatus::Failed;
                    record.error = Some(
                        Error::MaxRetries {
                            limit: inner.options.max_attempts as u32,
                        }
                        .to_string(),
                    );
                    record.state = inner.chain.end_state.clone();
                    break;
                }
                record.updated_at = Utc::now();
                let _ = inner.persist(&record);
                tokio::time::sleep(inner.backoff(record.attempt)).await;
            }
            Err(TransitionError::Abort(e)) => {
                error!(
                    version = %record.version,
                    state = %name,
                    error = %e,
                    "transition aborted"
                );
                record.status = RunStatus::Failed;
                record.error = Some(e.to_string());
                record.state = inner.chain.end_state.clone();
                break;
            }
        }
    }

    if record.status == RunStatus::Running {
        record.status = RunStatus::Complete;
    }
    record.updated_at = Utc::now();
    if let Err(e) = inner.persist(&record) {
        error!(version = %record.version, error = %e, "cannot persist final run record");
    }

    info!(
        chain = %inner.chain.name,
        version = %record.version,
        status = ?record.status,
        "run finished"
    );

    RunOutcome {
        status: record.status,
        response: record.response,
        error: record.error,
    }
}
