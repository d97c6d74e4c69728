//! Plan approval workflow
//!
//! A plan is written as a pending-approval record; an external actor (a
//! human with an editor, or `nova approve`) answers by writing a response
//! record. The coordinator waits on three signals at once:
//!
//! - a poll tick that reads the response location
//! - an optional change notification from the transport (latency only)
//! - a timeout that resolves to an approval
//!
//! plus an explicit cancellation. Whichever fires first settles the wait,
//! and both records are removed afterwards whatever the outcome.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nova_core::config::{autonomy_level_from_env, parse_autonomy_level};
use nova_core::fail_open::fail_open;
use nova_core::{ApprovalConfig, NovaConfig, NovaError, Result, Task, TaskId, DEFAULT_AUTONOMY_LEVEL};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Task context key carrying a per-task autonomy level
pub const AUTONOMY_CONTEXT_KEY: &str = "autonomyLevel";

/// Lifecycle of an approval record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Modified,
}

/// Request record written for the external approver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub id: String,
    pub task_id: TaskId,
    pub plan: String,
    pub timestamp: DateTime<Utc>,
    pub status: ApprovalStatus,
}

impl PendingApproval {
    pub fn new(task_id: impl Into<String>, plan: impl Into<String>) -> Self {
        Self {
            id: format!("approval-{}", Uuid::new_v4()),
            task_id: task_id.into(),
            plan: plan.into(),
            timestamp: Utc::now(),
            status: ApprovalStatus::Pending,
        }
    }
}

/// Settled outcome of an approval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ApprovalResult {
    Approved,
    Rejected { reason: String },
    Modified { plan: String },
}

/// Verdict carried by a response record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    Approved,
    Rejected,
    Modified,
}

/// Response record written by the approver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponse {
    pub approval_id: String,
    pub result: ResponseKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_plan: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ApprovalResponse {
    pub fn new(approval_id: impl Into<String>, result: &ApprovalResult) -> Self {
        let (kind, reason, modified_plan) = match result {
            ApprovalResult::Approved => (ResponseKind::Approved, None, None),
            ApprovalResult::Rejected { reason } => (ResponseKind::Rejected, Some(reason.clone()), None),
            ApprovalResult::Modified { plan } => (ResponseKind::Modified, None, Some(plan.clone())),
        };
        Self {
            approval_id: approval_id.into(),
            result: kind,
            reason,
            modified_plan,
            timestamp: Utc::now(),
        }
    }

    /// The outcome this record stands for
    ///
    /// A `modified` record without a plan is incomplete and yields `None`.
    pub fn to_result(&self) -> Option<ApprovalResult> {
        match self.result {
            ResponseKind::Approved => Some(ApprovalResult::Approved),
            ResponseKind::Rejected => Some(ApprovalResult::Rejected {
                reason: self
                    .reason
                    .clone()
                    .unwrap_or_else(|| "No reason given".to_string()),
            }),
            ResponseKind::Modified => self
                .modified_plan
                .clone()
                .map(|plan| ApprovalResult::Modified { plan }),
        }
    }
}

/// Change notifications from a transport
///
/// Holds whatever keeps the notification source alive.
pub struct ResponseWatch {
    rx: mpsc::UnboundedReceiver<()>,
    _guard: Option<Box<dyn Send>>,
}

impl ResponseWatch {
    pub fn new(rx: mpsc::UnboundedReceiver<()>) -> Self {
        Self { rx, _guard: None }
    }

    pub fn with_guard(rx: mpsc::UnboundedReceiver<()>, guard: impl Send + 'static) -> Self {
        Self {
            rx,
            _guard: Some(Box::new(guard)),
        }
    }

    /// Wait for the next change; `None` once the source is gone
    pub async fn changed(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

/// Where approval records live
///
/// `read_response` returns `Ok(None)` for a missing or unparsable record;
/// `Err` is reserved for real I/O failures.
#[async_trait]
pub trait ApprovalTransport: Send + Sync {
    async fn write_request(&self, request: &PendingApproval) -> Result<()>;

    async fn read_request(&self) -> Result<Option<PendingApproval>>;

    async fn write_response(&self, response: &ApprovalResponse) -> Result<()>;

    async fn read_response(&self) -> Result<Option<ApprovalResponse>>;

    /// Delete both records; missing records are not an error
    async fn clear(&self) -> Result<()>;

    /// Optional notifications when the response may have changed
    fn watch(&self) -> Result<Option<ResponseWatch>> {
        Ok(None)
    }
}

/// JSON records on the local filesystem
#[derive(Debug, Clone)]
pub struct FileTransport {
    request_path: PathBuf,
    response_path: PathBuf,
}

impl FileTransport {
    pub fn new(request_path: impl Into<PathBuf>, response_path: impl Into<PathBuf>) -> Self {
        Self {
            request_path: request_path.into(),
            response_path: response_path.into(),
        }
    }

    pub fn from_config(config: &ApprovalConfig) -> Self {
        Self::new(&config.request_path, &config.response_path)
    }

    pub fn request_path(&self) -> &Path {
        &self.request_path
    }

    pub fn response_path(&self) -> &Path {
        &self.response_path
    }

    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(value)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                debug!("Ignoring unparsable record at {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    async fn remove(path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ApprovalTransport for FileTransport {
    async fn write_request(&self, request: &PendingApproval) -> Result<()> {
        Self::write_json(&self.request_path, request).await?;
        if let Some(parent) = self.response_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn read_request(&self) -> Result<Option<PendingApproval>> {
        Self::read_json(&self.request_path).await
    }

    async fn write_response(&self, response: &ApprovalResponse) -> Result<()> {
        Self::write_json(&self.response_path, response).await
    }

    async fn read_response(&self) -> Result<Option<ApprovalResponse>> {
        Self::read_json(&self.response_path).await
    }

    async fn clear(&self) -> Result<()> {
        Self::remove(&self.request_path).await?;
        Self::remove(&self.response_path).await
    }

    fn watch(&self) -> Result<Option<ResponseWatch>> {
        let Some(dir) = self.response_path.parent() else {
            return Ok(None);
        };
        let Some(file_name) = self.response_path.file_name().map(|n| n.to_os_string()) else {
            return Ok(None);
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()))
                    {
                        let _ = tx.send(());
                    }
                }
                Err(e) => warn!("Approval watcher error: {}", e),
            },
            Config::default(),
        )
        .map_err(|e| NovaError::ApprovalTransport(e.to_string()))?;

        // The file may not exist yet, so watch its directory
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| NovaError::ApprovalTransport(e.to_string()))?;

        debug!("Watching {} for approval responses", dir.display());
        Ok(Some(ResponseWatch::with_guard(rx, watcher)))
    }
}

#[derive(Default)]
struct MemoryRecords {
    request: Option<PendingApproval>,
    response: Option<String>,
    watchers: Vec<mpsc::UnboundedSender<()>>,
}

/// In-process transport for tests and embedding
#[derive(Default)]
pub struct MemoryTransport {
    records: Mutex<MemoryRecords>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw response body, valid or not
    pub fn respond_raw(&self, body: impl Into<String>) {
        let mut records = self.records();
        records.response = Some(body.into());
        records.watchers.retain(|tx| tx.send(()).is_ok());
    }

    pub fn has_request(&self) -> bool {
        self.records().request.is_some()
    }

    pub fn has_response(&self) -> bool {
        self.records().response.is_some()
    }

    fn records(&self) -> MutexGuard<'_, MemoryRecords> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn watcher_count(&self) -> usize {
        self.records().watchers.len()
    }
}

#[async_trait]
impl ApprovalTransport for MemoryTransport {
    async fn write_request(&self, request: &PendingApproval) -> Result<()> {
        self.records().request = Some(request.clone());
        Ok(())
    }

    async fn read_request(&self) -> Result<Option<PendingApproval>> {
        Ok(self.records().request.clone())
    }

    async fn write_response(&self, response: &ApprovalResponse) -> Result<()> {
        self.respond_raw(serde_json::to_string(response)?);
        Ok(())
    }

    async fn read_response(&self) -> Result<Option<ApprovalResponse>> {
        let body = self.records().response.clone();
        Ok(body.and_then(|body| serde_json::from_str(&body).ok()))
    }

    async fn clear(&self) -> Result<()> {
        let mut records = self.records();
        records.request = None;
        records.response = None;
        records.watchers.retain(|tx| !tx.is_closed());
        Ok(())
    }

    fn watch(&self) -> Result<Option<ResponseWatch>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.records().watchers.push(tx);
        Ok(Some(ResponseWatch::new(rx)))
    }
}

/// Answer whatever approval is currently pending
///
/// This is the approver's side of the protocol. Returns the request that
/// was answered.
pub async fn respond_to_pending(
    transport: &dyn ApprovalTransport,
    result: &ApprovalResult,
) -> Result<PendingApproval> {
    let request = transport
        .read_request()
        .await?
        .ok_or_else(|| NovaError::ApprovalTransport("no pending approval".to_string()))?;
    transport
        .write_response(&ApprovalResponse::new(&request.id, result))
        .await?;
    Ok(request)
}

/// Per-request overrides
#[derive(Debug, Clone, Default)]
pub struct ApprovalOptions {
    /// Explicit timeout; wins over every autonomy signal
    pub timeout: Option<Duration>,
    pub poll_interval: Option<Duration>,
}

impl ApprovalOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }
}

/// Auto-approval delay for an autonomy level (`None` waits indefinitely)
pub fn timeout_for_level(level: u8) -> Option<Duration> {
    match level {
        0..=2 => None,
        3 => Some(Duration::from_secs(5 * 60)),
        _ => Some(Duration::from_secs(60)),
    }
}

/// Autonomy level from a task's context (number or numeric string)
pub fn task_autonomy_level(task: &Task) -> Option<u8> {
    match task.context_value(AUTONOMY_CONTEXT_KEY)? {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| parse_autonomy_level(&n.to_string())),
        serde_json::Value::String(s) => parse_autonomy_level(s),
        _ => None,
    }
}

/// Resolve how long to wait before auto-approving
///
/// Precedence: explicit option, task context, ambient level, default level.
pub fn effective_timeout(
    options: &ApprovalOptions,
    task: &Task,
    ambient_level: Option<u8>,
) -> Option<Duration> {
    if let Some(timeout) = options.timeout {
        return Some(timeout);
    }
    let level = task_autonomy_level(task)
        .or(ambient_level)
        .unwrap_or(DEFAULT_AUTONOMY_LEVEL);
    timeout_for_level(level)
}

/// Coordinates plan approvals over a transport
pub struct PlanApprovalCoordinator {
    transport: Arc<dyn ApprovalTransport>,
    poll_interval: Duration,
    watch: bool,
    autonomy_level: Option<u8>,
    active: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl PlanApprovalCoordinator {
    pub fn new(transport: Arc<dyn ApprovalTransport>, config: &ApprovalConfig) -> Self {
        Self {
            transport,
            poll_interval: config.poll_interval(),
            watch: config.watch,
            autonomy_level: None,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// File-backed coordinator with the configured or environment autonomy level
    pub fn from_config(config: &NovaConfig) -> Self {
        let transport = Arc::new(FileTransport::from_config(&config.approval));
        Self::new(transport, &config.approval)
            .with_autonomy_level(config.build.autonomy_level.or_else(autonomy_level_from_env))
    }

    pub fn with_autonomy_level(mut self, level: Option<u8>) -> Self {
        self.autonomy_level = level;
        self
    }

    pub fn transport(&self) -> &Arc<dyn ApprovalTransport> {
        &self.transport
    }

    /// Ids of approvals currently being waited on
    pub fn active_approvals(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Reject an in-flight wait with [`NovaError::ApprovalCancelled`]
    ///
    /// Returns false when no wait with that id is active.
    pub fn cancel_approval(&self, id: &str) -> bool {
        match self.active().remove(id) {
            Some(cancel) => {
                info!("Cancelling approval {}", id);
                let _ = cancel.send(());
                true
            }
            None => false,
        }
    }

    /// Request approval of a plan and wait for the outcome
    #[instrument(skip(self, plan, task, options), fields(task_id = %task.id))]
    pub async fn request_approval(
        &self,
        plan: &str,
        task: &Task,
        options: &ApprovalOptions,
    ) -> Result<ApprovalResult> {
        let request = PendingApproval::new(&task.id, plan);
        let timeout = effective_timeout(options, task, self.autonomy_level);
        let poll_interval = options.poll_interval.unwrap_or(self.poll_interval);

        // Cancellable from the moment the request record is visible
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.active().insert(request.id.clone(), cancel_tx);

        if let Err(e) = self.transport.write_request(&request).await {
            self.active().remove(&request.id);
            self.cleanup().await;
            return Err(e);
        }

        match timeout {
            Some(t) => info!("Awaiting approval {} (auto-approve in {:?})", request.id, t),
            None => info!("Awaiting approval {} (no timeout)", request.id),
        }

        let outcome = self
            .wait_for_response(&request.id, timeout, poll_interval, cancel_rx)
            .await;

        self.active().remove(&request.id);
        self.cleanup().await;

        match &outcome {
            Ok(result) => info!("Approval {} settled: {:?}", request.id, result),
            Err(e) => warn!("Approval {} ended without a verdict: {}", request.id, e),
        }
        outcome
    }

    async fn wait_for_response(
        &self,
        id: &str,
        timeout: Option<Duration>,
        poll_interval: Duration,
        mut cancel_rx: oneshot::Receiver<()>,
    ) -> Result<ApprovalResult> {
        let mut watch = if self.watch {
            match self.transport.watch() {
                Ok(watch) => watch,
                Err(e) => {
                    warn!("Approval watch unavailable, polling only: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let deadline = async move {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(()) = async {
                    match watch.as_mut() {
                        Some(w) => w.changed().await,
                        None => std::future::pending().await,
                    }
                } => {
                    debug!("Response location changed for {}", id);
                }
                _ = &mut deadline => {
                    info!("Approval {} timed out, auto-approving", id);
                    return Ok(ApprovalResult::Approved);
                }
                _ = &mut cancel_rx => {
                    return Err(NovaError::ApprovalCancelled(id.to_string()));
                }
            }

            if let Some(result) = self.check_response(id).await? {
                return Ok(result);
            }
        }
    }

    async fn check_response(&self, id: &str) -> Result<Option<ApprovalResult>> {
        let Some(response) = self.transport.read_response().await? else {
            return Ok(None);
        };
        if response.approval_id != id {
            debug!(
                "Ignoring response for {} while waiting on {}",
                response.approval_id, id
            );
            return Ok(None);
        }
        Ok(response.to_result())
    }

    async fn cleanup(&self) {
        fail_open("approval record cleanup", || self.transport.clear()).await;
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<()>>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    fn task() -> Task {
        Task::new("t-1", "Design schema", "Tables for players", nova_core::Agent::Pluto)
    }

    fn fast() -> ApprovalConfig {
        ApprovalConfig {
            poll_interval_ms: 20,
            ..ApprovalConfig::default()
        }
    }

    fn file_setup() -> (TempDir, Arc<FileTransport>, Arc<PlanApprovalCoordinator>) {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FileTransport::new(
            dir.path().join(".nova/pending-approval.json"),
            dir.path().join(".nova/approval-response.json"),
        ));
        let coordinator = Arc::new(PlanApprovalCoordinator::new(transport.clone(), &fast()));
        (dir, transport, coordinator)
    }

    async fn wait_for_request(transport: &dyn ApprovalTransport) -> PendingApproval {
        for _ in 0..200 {
            if let Some(request) = transport.read_request().await.unwrap() {
                return request;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("request was never written");
    }

    #[tokio::test]
    async fn test_timeout_auto_approves() {
        let (_dir, transport, coordinator) = file_setup();
        let options = ApprovalOptions::default().with_timeout(Duration::from_millis(100));

        let started = Instant::now();
        let result = coordinator
            .request_approval("plan", &task(), &options)
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result, ApprovalResult::Approved);
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(400));
        assert!(!transport.request_path().exists());
    }

    #[tokio::test]
    async fn test_written_response_is_honored_and_records_removed() {
        let (_dir, transport, coordinator) = file_setup();
        let options = ApprovalOptions::default().with_timeout(Duration::from_secs(10));

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .request_approval("plan", &task(), &options)
                    .await
            })
        };

        let request = wait_for_request(transport.as_ref()).await;
        assert_eq!(request.task_id, "t-1");
        assert_eq!(request.status, ApprovalStatus::Pending);

        let rejected = ApprovalResult::Rejected {
            reason: "missing indexes".to_string(),
        };
        respond_to_pending(transport.as_ref(), &rejected).await.unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result, rejected);
        assert!(!transport.request_path().exists());
        assert!(!transport.response_path().exists());
    }

    #[tokio::test]
    async fn test_modified_plan_is_returned() {
        let transport = Arc::new(MemoryTransport::new());
        let coordinator = Arc::new(PlanApprovalCoordinator::new(transport.clone(), &fast()));
        let options = ApprovalOptions::default().with_timeout(Duration::from_secs(10));

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.request_approval("plan", &task(), &options).await })
        };

        let request = wait_for_request(transport.as_ref()).await;
        let response = ApprovalResponse::new(
            &request.id,
            &ApprovalResult::Modified {
                plan: "smaller plan".to_string(),
            },
        );
        transport.write_response(&response).await.unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(
            result,
            ApprovalResult::Modified {
                plan: "smaller plan".to_string()
            }
        );
        assert!(!transport.has_request());
        assert!(!transport.has_response());
    }

    #[tokio::test]
    async fn test_foreign_and_malformed_responses_are_ignored() {
        let transport = Arc::new(MemoryTransport::new());
        let coordinator = Arc::new(PlanApprovalCoordinator::new(transport.clone(), &fast()));
        let options = ApprovalOptions::default().with_timeout(Duration::from_millis(300));

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.request_approval("plan", &task(), &options).await })
        };

        wait_for_request(transport.as_ref()).await;
        transport.respond_raw("{ not json");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let foreign = ApprovalResponse::new(
            "approval-someone-else",
            &ApprovalResult::Rejected {
                reason: "wrong plan".to_string(),
            },
        );
        transport.write_response(&foreign).await.unwrap();

        // Neither counts, so the timeout decides
        assert_eq!(waiter.await.unwrap().unwrap(), ApprovalResult::Approved);
    }

    #[tokio::test]
    async fn test_cancel_rejects_waiter() {
        let transport = Arc::new(MemoryTransport::new());
        let coordinator = Arc::new(PlanApprovalCoordinator::new(transport.clone(), &fast()));
        let indefinite = task().with_context(AUTONOMY_CONTEXT_KEY, serde_json::json!(1));

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .request_approval("plan", &indefinite, &ApprovalOptions::default())
                    .await
            })
        };

        let request = wait_for_request(transport.as_ref()).await;
        for _ in 0..200 {
            if !coordinator.active_approvals().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(coordinator.active_approvals(), vec![request.id.clone()]);

        assert!(coordinator.cancel_approval(&request.id));
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_cancellation());
        assert!(coordinator.active_approvals().is_empty());
        assert!(!transport.has_request());
        assert!(!coordinator.cancel_approval(&request.id));
    }

    /// Holds `write_request` until a permit is released
    struct GatedTransport {
        inner: MemoryTransport,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl ApprovalTransport for GatedTransport {
        async fn write_request(&self, request: &PendingApproval) -> Result<()> {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| NovaError::Other(e.to_string()))?;
            self.inner.write_request(request).await
        }

        async fn read_request(&self) -> Result<Option<PendingApproval>> {
            self.inner.read_request().await
        }

        async fn write_response(&self, response: &ApprovalResponse) -> Result<()> {
            self.inner.write_response(response).await
        }

        async fn read_response(&self) -> Result<Option<ApprovalResponse>> {
            self.inner.read_response().await
        }

        async fn clear(&self) -> Result<()> {
            self.inner.clear().await
        }
    }

    #[tokio::test]
    async fn test_cancel_during_request_write_is_kept() {
        let transport = Arc::new(GatedTransport {
            inner: MemoryTransport::new(),
            gate: tokio::sync::Semaphore::new(0),
        });
        let coordinator = Arc::new(PlanApprovalCoordinator::new(transport.clone(), &fast()));
        let indefinite = task().with_context(AUTONOMY_CONTEXT_KEY, serde_json::json!(1));

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .request_approval("plan", &indefinite, &ApprovalOptions::default())
                    .await
            })
        };

        // The request record is still held back by the gate
        let mut active = Vec::new();
        for _ in 0..200 {
            active = coordinator.active_approvals();
            if !active.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(active.len(), 1);
        assert!(!transport.inner.has_request());

        assert!(coordinator.cancel_approval(&active[0]));
        transport.gate.add_permits(1);

        let err = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(err.is_cancellation());
        assert!(!transport.inner.has_request());
    }

    #[tokio::test]
    async fn test_settled_approvals_release_watchers() {
        let transport = Arc::new(MemoryTransport::new());
        let coordinator = PlanApprovalCoordinator::new(transport.clone(), &fast());
        let options = ApprovalOptions::default().with_timeout(Duration::from_millis(30));

        for _ in 0..3 {
            let result = coordinator.request_approval("plan", &task(), &options).await.unwrap();
            assert_eq!(result, ApprovalResult::Approved);
        }
        assert_eq!(transport.watcher_count(), 0);
    }

    #[test]
    fn test_effective_timeout_precedence() {
        let plain = task();
        let explicit = ApprovalOptions::default().with_timeout(Duration::from_millis(5));
        assert_eq!(
            effective_timeout(&explicit, &plain, Some(1)),
            Some(Duration::from_millis(5))
        );

        let defaults = ApprovalOptions::default();
        assert_eq!(effective_timeout(&defaults, &plain, None), Some(Duration::from_secs(300)));
        assert_eq!(effective_timeout(&defaults, &plain, Some(2)), None);
        assert_eq!(effective_timeout(&defaults, &plain, Some(5)), Some(Duration::from_secs(60)));

        let string_level = task().with_context(AUTONOMY_CONTEXT_KEY, serde_json::json!("4"));
        assert_eq!(
            effective_timeout(&defaults, &string_level, Some(1)),
            Some(Duration::from_secs(60))
        );

        let bogus = task().with_context(AUTONOMY_CONTEXT_KEY, serde_json::json!(9));
        assert_eq!(effective_timeout(&defaults, &bogus, Some(2)), None);
    }

    #[test]
    fn test_wire_format() {
        let response: ApprovalResponse = serde_json::from_str(
            r#"{"approvalId": "approval-1", "result": "rejected", "reason": "too big"}"#,
        )
        .unwrap();
        assert_eq!(
            response.to_result(),
            Some(ApprovalResult::Rejected {
                reason: "too big".to_string()
            })
        );

        let incomplete: ApprovalResponse =
            serde_json::from_str(r#"{"approvalId": "approval-1", "result": "modified"}"#).unwrap();
        assert_eq!(incomplete.to_result(), None);

        let request = serde_json::to_value(PendingApproval::new("t-1", "plan")).unwrap();
        assert_eq!(request["taskId"], "t-1");
        assert_eq!(request["status"], "pending");

        let result = serde_json::to_value(ApprovalResult::Modified {
            plan: "p".to_string(),
        })
        .unwrap();
        assert_eq!(result["type"], "modified");
    }
}
