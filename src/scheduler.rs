//! Save scheduling: manual saves, periodic autosave, one cycle at a time.
//!
//! Each repository handle gets one [`SaveScheduler`]. Staged annotation
//! files accumulate in the handle's pending set; a *cycle* publishes them:
//!
//! ```text
//!   stage_annotation ──▶ pending set ──trigger──▶ cycle (spawned task)
//!                                                   │
//!                      per annotator: GitSync::commit_and_push (retried)
//!                                                   │
//!                       clear committed entries ◀───┘──▶ CycleReport (watch)
//! ```
//!
//! | Status | Meaning |
//! |--------|---------|
//! | [`SaveStatus::Saved`] | nothing pending, last cycle succeeded |
//! | [`SaveStatus::Unsynced`] | staged on disk, not yet committed |
//! | [`SaveStatus::Committing`] | a cycle is running |
//! | [`SaveStatus::Failed`] | last cycle failed; files stay pending |
//!
//! A failing annotator does not hold back the others: every group is
//! attempted, successful groups are cleared, and the cycle reports the first
//! failure. Authentication failures stop the cycle early.
//!
//! At most one cycle runs per handle. A trigger that arrives while a cycle
//! runs sets a re-run flag and waits for the follow-up cycle, so any number
//! of concurrent triggers collapse into at most one extra cycle. Cycles run
//! on their own task: a caller that stops waiting never cancels a commit.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use label_ledger_core::error::SyncError;
use label_ledger_core::models::Annotator;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::GitConfig;
use crate::repo_cache::{PendingEntry, RepositoryHandle};
use crate::sync::{CommitAuthor, GitSync};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Explicit user save. Runs even when only recovered files are pending.
    Manual,
    /// Timer tick. Skipped when nothing is pending.
    Autosave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveStatus {
    Saved,
    Unsynced { pending: usize },
    Committing { pending: usize },
    Failed { error: SyncError, pending: usize },
}

impl SaveStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Saved => "saved",
            Self::Unsynced { .. } => "not yet synced",
            Self::Committing { .. } => "syncing",
            Self::Failed { .. } => "sync failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Files were published; one HEAD per annotator commit.
    Committed { files: usize, heads: Vec<String> },
    /// A cycle ran but there was nothing to publish.
    NothingToSave,
    /// Autosave tick with an empty pending set.
    Skipped,
}

/// Bounded retry for retryable sync failures, with linear backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &GitConfig) -> Self {
        Self {
            retries: config.push_retries,
            backoff: config.retry_backoff(),
        }
    }
}

/// Result of one finished cycle, published on the report channel.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub result: Result<SaveOutcome, SyncError>,
}

#[derive(Default)]
struct CycleState {
    running: bool,
    rerun: bool,
    /// Number of the running (or last finished) cycle.
    cycle: u64,
    last_error: Option<SyncError>,
}

struct Inner {
    handle: Arc<RepositoryHandle>,
    sync: Arc<dyn GitSync>,
    policy: RetryPolicy,
    email_domain: String,
    state: Mutex<CycleState>,
    reports: watch::Sender<Option<CycleReport>>,
}

#[derive(Clone)]
pub struct SaveScheduler {
    inner: Arc<Inner>,
}

impl SaveScheduler {
    pub fn new(
        handle: Arc<RepositoryHandle>,
        sync: Arc<dyn GitSync>,
        policy: RetryPolicy,
        email_domain: impl Into<String>,
    ) -> Self {
        let (reports, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                handle,
                sync,
                policy,
                email_domain: email_domain.into(),
                state: Mutex::new(CycleState::default()),
                reports,
            }),
        }
    }

    pub fn handle(&self) -> &Arc<RepositoryHandle> {
        &self.inner.handle
    }

    pub fn status(&self) -> SaveStatus {
        let state = self.inner.state.lock();
        let pending = self.inner.handle.pending().len();
        if state.running {
            SaveStatus::Committing { pending }
        } else if let Some(error) = &state.last_error {
            SaveStatus::Failed {
                error: error.clone(),
                pending,
            }
        } else if pending > 0 {
            SaveStatus::Unsynced { pending }
        } else {
            SaveStatus::Saved
        }
    }

    /// Receiver of every finished cycle's report.
    pub fn subscribe(&self) -> watch::Receiver<Option<CycleReport>> {
        self.inner.reports.subscribe()
    }

    /// Start (or join) a save cycle and wait for its result.
    pub async fn request_save(&self, trigger: Trigger) -> Result<SaveOutcome, SyncError> {
        let mut reports = self.inner.reports.subscribe();
        let target = {
            let mut state = self.inner.state.lock();
            if state.running {
                state.rerun = true;
                state.cycle + 1
            } else {
                if self.inner.handle.pending().is_empty() {
                    return Ok(match trigger {
                        Trigger::Autosave => SaveOutcome::Skipped,
                        Trigger::Manual => SaveOutcome::NothingToSave,
                    });
                }
                state.running = true;
                state.cycle += 1;
                tokio::spawn(drive(self.inner.clone()));
                state.cycle
            }
        };
        tracing::debug!(?trigger, cycle = target, "save requested");

        loop {
            let finished = reports
                .borrow_and_update()
                .as_ref()
                .filter(|report| report.cycle >= target)
                .map(|report| report.result.clone());
            if let Some(result) = finished {
                return result;
            }
            if reports.changed().await.is_err() {
                return Err(SyncError::Git("save scheduler stopped".to_string()));
            }
        }
    }

    /// Fire [`Trigger::Autosave`] every `interval` until the handle is shut down.
    pub fn spawn_autosave(&self, interval: Duration) -> AutosaveHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let scheduler = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        match scheduler.request_save(Trigger::Autosave).await {
                            Ok(SaveOutcome::Skipped) => {}
                            Ok(outcome) => tracing::info!(?outcome, "autosave"),
                            Err(e) => tracing::warn!(error = %e, "autosave failed; will retry on next tick"),
                        }
                    }
                }
            }
            scheduler.request_save(Trigger::Manual).await
        });
        AutosaveHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}

/// Running autosave timer.
pub struct AutosaveHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<SaveOutcome, SyncError>>,
}

impl AutosaveHandle {
    /// Stop the timer and run a final flush of anything still pending.
    pub async fn shutdown(mut self) -> Result<SaveOutcome, SyncError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(SyncError::Git(format!("autosave task failed: {}", e))),
        }
    }
}

async fn drive(inner: Arc<Inner>) {
    loop {
        let cycle = inner.state.lock().cycle;
        let result = run_cycle(&inner, cycle).await;

        let done = {
            let mut state = inner.state.lock();
            state.last_error = result.as_ref().err().cloned();
            inner
                .reports
                .send_replace(Some(CycleReport { cycle, result }));
            if state.rerun {
                state.rerun = false;
                state.cycle += 1;
                false
            } else {
                state.running = false;
                true
            }
        };
        if done {
            return;
        }
    }
}

async fn run_cycle(inner: &Inner, cycle: u64) -> Result<SaveOutcome, SyncError> {
    let snapshot = inner.handle.pending().snapshot();
    if snapshot.is_empty() {
        return Ok(SaveOutcome::NothingToSave);
    }

    let mut groups: BTreeMap<Annotator, Vec<PendingEntry>> = BTreeMap::new();
    for entry in snapshot {
        groups.entry(entry.annotator.clone()).or_default().push(entry);
    }
    tracing::info!(
        url = inner.handle.url(),
        cycle,
        annotators = groups.len(),
        "save cycle started"
    );

    let mut files = 0;
    let mut heads = Vec::new();
    let mut first_error: Option<SyncError> = None;
    for (annotator, entries) in groups {
        let paths: Vec<String> = entries.iter().map(|e| e.path.clone()).collect();
        let author = CommitAuthor::for_annotator(&annotator, &inner.email_domain);
        let message = format!(
            "Update annotations by {} ({} file{})",
            annotator.login(),
            paths.len(),
            if paths.len() == 1 { "" } else { "s" }
        );

        match commit_with_retry(inner, &paths, &author, &message).await {
            Ok(head) => {
                heads.extend(head);
                inner.handle.pending().clear(&entries);
                files += entries.len();
            }
            Err(err @ SyncError::Auth(_)) => return Err(err),
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }

    if let Some(err) = first_error {
        tracing::warn!(url = inner.handle.url(), cycle, files, error = %err, "save cycle finished with failures");
        return Err(err);
    }
    tracing::info!(url = inner.handle.url(), cycle, files, "save cycle finished");
    Ok(SaveOutcome::Committed { files, heads })
}

async fn commit_with_retry(
    inner: &Inner,
    paths: &[String],
    author: &CommitAuthor,
    message: &str,
) -> Result<Option<String>, SyncError> {
    let mut attempt = 0u32;
    loop {
        let result = {
            let _guard = inner.handle.lock_worktree().await;
            inner
                .sync
                .commit_and_push(&inner.handle, paths, author, message)
                .await
        };
        match result {
            Ok(head) => return Ok(Some(head)),
            Err(SyncError::NothingToCommit) => return Ok(None),
            Err(e) if e.is_retryable() && attempt < inner.policy.retries => {
                attempt += 1;
                let delay = inner.policy.backoff * attempt;
                tracing::warn!(
                    error = %e,
                    attempt,
                    retries = inner.policy.retries,
                    delay_ms = delay.as_millis() as u64,
                    "sync failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                tracing::error!(error = %e, author = %author.name, "sync failed; changes stay pending");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo_url::RepoLocation;
    use async_trait::async_trait;
    use std::collections::{HashSet, VecDeque};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records calls and simulates a clone whose commits may not be pushed yet.
    #[derive(Default)]
    struct FakeSync {
        active: AtomicUsize,
        max_active: AtomicUsize,
        calls: AtomicUsize,
        delay: Duration,
        failures: Mutex<VecDeque<SyncError>>,
        committed: Mutex<HashSet<String>>,
        commits: Mutex<Vec<(String, Vec<String>)>>,
        pushes: AtomicUsize,
        /// Every attempt by this author fails with the given error.
        broken_author: Option<(String, SyncError)>,
    }

    impl FakeSync {
        fn failing(errors: Vec<SyncError>) -> Self {
            Self {
                failures: Mutex::new(errors.into()),
                ..Self::default()
            }
        }

        fn broken_for(login: &str, err: SyncError) -> Self {
            Self {
                broken_author: Some((login.to_string(), err)),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl GitSync for FakeSync {
        async fn commit_and_push(
            &self,
            _handle: &RepositoryHandle,
            paths: &[String],
            author: &CommitAuthor,
            _message: &str,
        ) -> Result<String, SyncError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;

            if let Some((name, err)) = &self.broken_author {
                if *name == author.name {
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    return Err(err.clone());
                }
            }

            let fresh: Vec<String> = {
                let mut committed = self.committed.lock();
                paths.iter().filter(|p| committed.insert((*p).clone())).cloned().collect()
            };
            if !fresh.is_empty() {
                self.commits.lock().push((author.name.clone(), fresh));
            }
            let failure = self.failures.lock().pop_front();
            self.active.fetch_sub(1, Ordering::SeqCst);
            match failure {
                Some(e) => Err(e),
                None => {
                    self.pushes.fetch_add(1, Ordering::SeqCst);
                    Ok(format!("head-{}", self.calls.load(Ordering::SeqCst)))
                }
            }
        }

        async fn pull(&self, _handle: &RepositoryHandle) -> Result<String, SyncError> {
            Ok("head-0".to_string())
        }
    }

    fn handle() -> Arc<RepositoryHandle> {
        Arc::new(RepositoryHandle::new(
            RepoLocation::parse("https://github.com/acme/labels").unwrap(),
            PathBuf::from("/clones/acme/labels_default"),
            "main".to_string(),
        ))
    }

    fn scheduler(handle: Arc<RepositoryHandle>, sync: Arc<FakeSync>) -> SaveScheduler {
        let policy = RetryPolicy {
            retries: 2,
            backoff: Duration::from_millis(1),
        };
        SaveScheduler::new(handle, sync, policy, "users.noreply.github.com")
    }

    fn stage(handle: &RepositoryHandle, login: &str, file: &str) {
        let annotator = Annotator::new(login).unwrap();
        handle
            .pending()
            .mark(&format!("v1/annotation/{}/{}", login, file), &annotator);
    }

    #[tokio::test]
    async fn test_empty_pending_set() {
        let s = scheduler(handle(), Arc::new(FakeSync::default()));
        assert_eq!(s.request_save(Trigger::Autosave).await, Ok(SaveOutcome::Skipped));
        assert_eq!(s.request_save(Trigger::Manual).await, Ok(SaveOutcome::NothingToSave));
        assert_eq!(s.status(), SaveStatus::Saved);
    }

    #[tokio::test]
    async fn test_one_commit_per_annotator() {
        let h = handle();
        let sync = Arc::new(FakeSync::default());
        let s = scheduler(h.clone(), sync.clone());
        stage(&h, "alice", "a.jsonl");
        stage(&h, "alice", "b.jsonl");
        stage(&h, "bob", "a.jsonl");
        assert_eq!(s.status(), SaveStatus::Unsynced { pending: 3 });

        let outcome = s.request_save(Trigger::Manual).await.unwrap();
        assert!(matches!(outcome, SaveOutcome::Committed { files: 3, ref heads } if heads.len() == 2));
        let commits = sync.commits.lock().clone();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].0, "alice");
        assert_eq!(commits[0].1.len(), 2);
        assert_eq!(commits[1].0, "bob");
        assert_eq!(s.status(), SaveStatus::Saved);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_triggers_never_overlap() {
        let h = handle();
        let sync = Arc::new(FakeSync {
            delay: Duration::from_millis(5),
            ..FakeSync::default()
        });
        let s = scheduler(h.clone(), sync.clone());

        let mut tasks = Vec::new();
        for i in 0..20 {
            let s = s.clone();
            let h = h.clone();
            tasks.push(tokio::spawn(async move {
                stage(&h, if i % 2 == 0 { "alice" } else { "bob" }, &format!("f{}.jsonl", i));
                let trigger = if i % 3 == 0 { Trigger::Autosave } else { Trigger::Manual };
                s.request_save(trigger).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        s.request_save(Trigger::Manual).await.unwrap();

        assert_eq!(sync.max_active.load(Ordering::SeqCst), 1);
        assert!(h.pending().is_empty());
        let committed: usize = sync.commits.lock().iter().map(|(_, p)| p.len()).sum();
        assert_eq!(committed, 20);
    }

    #[tokio::test]
    async fn test_rejected_push_is_retried_without_second_commit() {
        let h = handle();
        let sync = Arc::new(FakeSync::failing(vec![SyncError::NonFastForward(
            "fetch first".into(),
        )]));
        let s = scheduler(h.clone(), sync.clone());
        stage(&h, "alice", "a.jsonl");

        s.request_save(Trigger::Manual).await.unwrap();
        assert_eq!(sync.calls.load(Ordering::SeqCst), 2);
        assert_eq!(sync.commits.lock().len(), 1);
        assert_eq!(sync.pushes.load(Ordering::SeqCst), 1);
        assert!(h.pending().is_empty());
    }

    #[tokio::test]
    async fn test_auth_error_is_not_retried() {
        let h = handle();
        let sync = Arc::new(FakeSync::failing(vec![SyncError::Auth("403".into())]));
        let s = scheduler(h.clone(), sync.clone());
        stage(&h, "alice", "a.jsonl");

        let err = s.request_save(Trigger::Manual).await.unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));
        assert_eq!(sync.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(s.status(), SaveStatus::Failed { pending: 1, .. }));
    }

    #[tokio::test]
    async fn test_exhausted_retries_keep_pending_until_next_trigger() {
        let h = handle();
        let net = || SyncError::Network("timed out".into());
        let sync = Arc::new(FakeSync::failing(vec![net(), net(), net()]));
        let s = scheduler(h.clone(), sync.clone());
        stage(&h, "alice", "a.jsonl");

        assert!(s.request_save(Trigger::Manual).await.is_err());
        assert_eq!(sync.calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.pending().len(), 1);

        let outcome = s.request_save(Trigger::Autosave).await.unwrap();
        assert!(matches!(outcome, SaveOutcome::Committed { files: 1, .. }));
        assert_eq!(sync.commits.lock().len(), 1);
        assert_eq!(s.status(), SaveStatus::Saved);
    }

    #[tokio::test]
    async fn test_restaged_during_cycle_stays_pending() {
        let h = handle();
        let sync = Arc::new(FakeSync {
            delay: Duration::from_millis(50),
            ..FakeSync::default()
        });
        let s = scheduler(h.clone(), sync.clone());
        stage(&h, "alice", "a.jsonl");

        let running = {
            let s = s.clone();
            tokio::spawn(async move { s.request_save(Trigger::Manual).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(s.status(), SaveStatus::Committing { .. }));
        stage(&h, "alice", "a.jsonl");
        running.await.unwrap().unwrap();

        assert_eq!(h.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_cancel_cycle() {
        let h = handle();
        let sync = Arc::new(FakeSync {
            delay: Duration::from_millis(30),
            ..FakeSync::default()
        });
        let s = scheduler(h.clone(), sync.clone());
        stage(&h, "alice", "a.jsonl");

        let _ = tokio::time::timeout(Duration::from_millis(5), s.request_save(Trigger::Manual)).await;
        let mut reports = s.subscribe();
        while reports.borrow().is_none() {
            reports.changed().await.unwrap();
        }
        assert!(h.pending().is_empty());
        assert_eq!(sync.pushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_autosave_shutdown_flushes() {
        let h = handle();
        let sync = Arc::new(FakeSync::default());
        let s = scheduler(h.clone(), sync.clone());

        let autosave = s.spawn_autosave(Duration::from_secs(3600));
        stage(&h, "bob", "x.jsonl");
        let outcome = autosave.shutdown().await.unwrap();
        assert!(matches!(outcome, SaveOutcome::Committed { files: 1, .. }));
        assert!(h.pending().is_empty());
    }

    #[tokio::test]
    async fn test_failing_annotator_does_not_block_others() {
        let h = handle();
        let sync = Arc::new(FakeSync::broken_for(
            "alice",
            SyncError::Git("pathspec did not match any files".into()),
        ));
        let s = scheduler(h.clone(), sync.clone());
        stage(&h, "alice", "a.jsonl");
        stage(&h, "bob", "b.jsonl");
        stage(&h, "carol", "c.jsonl");

        let err = s.request_save(Trigger::Manual).await.unwrap_err();
        assert!(matches!(err, SyncError::Git(_)));

        let authors: Vec<String> = sync.commits.lock().iter().map(|(a, _)| a.clone()).collect();
        assert_eq!(authors, vec!["bob", "carol"]);
        assert_eq!(h.pending().paths(), vec!["v1/annotation/alice/a.jsonl".to_string()]);
        assert!(matches!(s.status(), SaveStatus::Failed { pending: 1, .. }));
    }

    #[tokio::test]
    async fn test_auth_failure_stops_the_cycle() {
        let h = handle();
        let sync = Arc::new(FakeSync::broken_for("alice", SyncError::Auth("401".into())));
        let s = scheduler(h.clone(), sync.clone());
        stage(&h, "alice", "a.jsonl");
        stage(&h, "bob", "b.jsonl");

        let err = s.request_save(Trigger::Manual).await.unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));
        assert_eq!(sync.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.pending().len(), 2);
    }
}
