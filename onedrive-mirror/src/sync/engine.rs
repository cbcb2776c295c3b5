use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{StreamExt, stream};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::now_unix;

use super::applier::{self, ApplyError, LocalApplier, RemoveOutcome};
use super::auth::{AccessToken, AuthError, AuthManager};
use super::classify::{Action, classify};
use super::index::{
    IndexError, IndexRecord, RecordInput, StatusUpdate, SyncIndex, SyncState, SyncStatus,
};
use super::manifest::write_manifest;
use super::paths;
use super::remote::{ContentSource, RemoteDriveClient, RemoteError, RemoteItem};

const ROOT_NODE_ID: &str = "root";

#[derive(Debug, Error)]
pub enum PassError {
    #[error("authorization failed: {0}")]
    Auth(AuthError),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("local I/O error: {0}")]
    LocalIo(#[from] ApplyError),
    #[error("no credentials stored for user {0}")]
    UnknownUser(String),
}

impl PassError {
    /// The credential was rejected; the user has to authorize again.
    pub fn is_auth(&self) -> bool {
        match self {
            PassError::Auth(err) => err.needs_reauthorization(),
            PassError::Remote(err) => err.is_auth(),
            _ => false,
        }
    }
}

impl From<AuthError> for PassError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::UnknownUser(user_id) => PassError::UnknownUser(user_id),
            other => PassError::Auth(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingMode {
    /// Change feed; resumes from the stored cursor when there is one.
    Delta,
    /// Recursive children listing; every pass is a full enumeration.
    Children,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PassMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub mirror_root: PathBuf,
    pub listing: ListingMode,
    pub download_concurrency: usize,
    pub pass_deadline: Option<Duration>,
    pub stale_running_after: Duration,
    pub token_skew_secs: i64,
    pub manifest_dir: Option<PathBuf>,
}

impl EngineConfig {
    pub fn new(mirror_root: impl Into<PathBuf>) -> Self {
        Self {
            mirror_root: mirror_root.into(),
            listing: ListingMode::Delta,
            download_concurrency: 4,
            pass_deadline: None,
            stale_running_after: Duration::from_secs(6 * 60 * 60),
            token_skew_secs: 60,
            manifest_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub user_id: String,
    pub mode: Option<PassMode>,
    pub observed: usize,
    pub created: usize,
    pub updated: usize,
    pub moved: usize,
    pub unchanged: usize,
    pub failed: usize,
    /// Actions not started because the pass deadline expired.
    pub deferred: usize,
    pub removed: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(PassReport),
    /// Another pass for the same user holds the running state.
    Skipped,
}

struct Listing {
    items: Vec<RemoteItem>,
    cursor: Option<String>,
    mode: PassMode,
    complete: bool,
}

/// Collects enumerated items, keeping first-seen order and last-seen value.
#[derive(Default)]
struct Collector {
    items: Vec<RemoteItem>,
    positions: HashMap<String, usize>,
}

impl Collector {
    fn extend(&mut self, items: Vec<RemoteItem>) {
        for item in items {
            match self.positions.get(&item.id) {
                Some(&pos) => self.items[pos] = item,
                None => {
                    self.positions.insert(item.id.clone(), self.items.len());
                    self.items.push(item);
                }
            }
        }
    }

    fn finish(self, mode: PassMode, cursor: Option<String>, complete: bool) -> Listing {
        Listing {
            items: self.items,
            cursor,
            mode,
            complete,
        }
    }
}

struct Job {
    item: RemoteItem,
    target: PathBuf,
    action: Action,
    prior: Option<IndexRecord>,
}

#[derive(Debug, Error)]
enum JobError {
    #[error("pass deadline expired")]
    Deadline,
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

/// Runs reconciliation passes that converge a local mirror onto the
/// remote drive of each user.
pub struct Reconciler {
    index: SyncIndex,
    remote: Arc<dyn RemoteDriveClient>,
    auth: Arc<dyn AuthManager>,
    applier: LocalApplier,
    config: EngineConfig,
}

impl Reconciler {
    pub fn new(
        index: SyncIndex,
        remote: Arc<dyn RemoteDriveClient>,
        auth: Arc<dyn AuthManager>,
        config: EngineConfig,
    ) -> Self {
        Self {
            applier: LocalApplier::new(config.download_concurrency),
            index,
            remote,
            auth,
            config,
        }
    }

    pub async fn status(&self, user_id: &str) -> Result<SyncStatus, IndexError> {
        self.index.get_status(user_id).await
    }

    /// Runs a pass on the runtime and returns immediately.
    pub fn start_pass(
        self: &Arc<Self>,
        user_id: impl Into<String>,
    ) -> JoinHandle<Result<PassOutcome, PassError>> {
        let this = Arc::clone(self);
        let user_id = user_id.into();
        tokio::spawn(async move { this.run_pass(&user_id).await })
    }

    pub async fn run_pass(&self, user_id: &str) -> Result<PassOutcome, PassError> {
        let started_at = now_unix();
        if !self
            .index
            .try_begin_pass(user_id, started_at, self.config.stale_running_after)
            .await?
        {
            info!(user_id, "pass already running, skipping");
            return Ok(PassOutcome::Skipped);
        }

        let deadline = self.config.pass_deadline.map(|limit| Instant::now() + limit);
        match self.execute(user_id, deadline).await {
            Ok(report) => {
                info!(
                    user_id,
                    observed = report.observed,
                    created = report.created,
                    updated = report.updated,
                    moved = report.moved,
                    removed = report.removed,
                    failed = report.failed,
                    truncated = report.truncated,
                    "pass complete"
                );
                Ok(PassOutcome::Completed(report))
            }
            Err(err) => {
                warn!(user_id, auth = err.is_auth(), "pass failed: {err}");
                let update = StatusUpdate {
                    last_error: Some(Some(err.to_string())),
                    ..StatusUpdate::state(SyncState::Error)
                };
                if let Err(status_err) = self.index.set_status(user_id, &update).await {
                    warn!(user_id, "failed to record pass error: {status_err}");
                }
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        user_id: &str,
        deadline: Option<Instant>,
    ) -> Result<PassReport, PassError> {
        let mut token = self.valid_token(user_id).await?;
        let status = self.index.get_status(user_id).await?;

        let display_name = self.index.display_name(user_id).await?;
        let user_root = paths::user_root(&self.config.mirror_root, user_id, display_name.as_deref());
        let root_present = applier::is_present(&user_root, true).await;
        self.applier.materialize_folder(&user_root).await?;

        // A missing root means the local tree is gone; a cursor would only
        // report changes since the last pass.
        let cursor = match (self.config.listing, root_present) {
            (ListingMode::Delta, true) => status.resume_cursor.clone(),
            _ => None,
        };
        if !root_present && status.resume_cursor.is_some() {
            info!(user_id, root = %user_root.display(), "mirror root missing, forcing full listing");
        }

        self.index.begin_generation(user_id).await?;
        let mut listing = self
            .enumerate_with_retry(user_id, &mut token, cursor.as_deref(), deadline)
            .await?;
        if listing.mode == PassMode::Incremental && self.folder_moved(user_id, &listing.items).await? {
            // Descendants of a moved folder are not reported by the feed.
            info!(user_id, "folder moved remotely, re-enumerating in full");
            listing = self
                .enumerate_with_retry(user_id, &mut token, None, deadline)
                .await?;
        }

        let mut report = PassReport {
            user_id: user_id.to_string(),
            mode: Some(listing.mode),
            ..PassReport::default()
        };
        let jobs = self
            .plan(user_id, &user_root, &listing.items, &mut report)
            .await?;
        let moved_from = self
            .apply(user_id, &token.secret, jobs, deadline, &mut report)
            .await?;
        self.remove_moved(user_id, moved_from).await?;

        // Anything not enumerated is still believed to exist remotely.
        if listing.mode == PassMode::Incremental || !listing.complete {
            self.index.carry_forward(user_id).await?;
        }
        let swept = self.index.sweep(user_id).await?;
        report.removed = swept.ids.len();
        self.remove_deepest_first(swept.local_paths).await;

        report.truncated = !listing.complete || report.deferred > 0;
        self.finish(user_id, &listing, &report).await?;
        Ok(report)
    }

    async fn valid_token(&self, user_id: &str) -> Result<AccessToken, PassError> {
        let token = self.auth.access_token(user_id).await?;
        if token.expires_within(now_unix(), self.config.token_skew_secs) {
            debug!(user_id, "access token near expiry, refreshing");
            return Ok(self.auth.refresh(user_id).await?);
        }
        Ok(token)
    }

    async fn enumerate_with_retry(
        &self,
        user_id: &str,
        token: &mut AccessToken,
        cursor: Option<&str>,
        deadline: Option<Instant>,
    ) -> Result<Listing, PassError> {
        match self.enumerate(user_id, &token.secret, cursor, deadline).await {
            Err(err) if err.is_auth() => {
                warn!(user_id, "remote rejected access token, refreshing once");
                *token = self.auth.refresh(user_id).await?;
                Ok(self.enumerate(user_id, &token.secret, cursor, deadline).await?)
            }
            other => Ok(other?),
        }
    }

    async fn enumerate(
        &self,
        user_id: &str,
        token: &str,
        cursor: Option<&str>,
        deadline: Option<Instant>,
    ) -> Result<Listing, RemoteError> {
        match self.config.listing {
            ListingMode::Children => self.enumerate_children(token, deadline).await,
            ListingMode::Delta => match self.enumerate_delta(token, cursor, deadline).await {
                Err(RemoteError::CursorExpired(reason)) if cursor.is_some() => {
                    info!(user_id, "resume cursor rejected ({reason}), starting over");
                    self.enumerate_delta(token, None, deadline).await
                }
                other => other,
            },
        }
    }

    async fn enumerate_delta(
        &self,
        token: &str,
        cursor: Option<&str>,
        deadline: Option<Instant>,
    ) -> Result<Listing, RemoteError> {
        let mode = if cursor.is_some() {
            PassMode::Incremental
        } else {
            PassMode::Full
        };
        let mut collector = Collector::default();
        let mut link = cursor.map(str::to_string);
        loop {
            if expired(deadline) {
                return Ok(collector.finish(mode, None, false));
            }
            let page = self.remote.list_delta(token, link.as_deref()).await?;
            collector.extend(page.items);
            match page.next_link {
                Some(next) => link = Some(next),
                None => return Ok(collector.finish(mode, page.cursor, true)),
            }
        }
    }

    async fn enumerate_children(
        &self,
        token: &str,
        deadline: Option<Instant>,
    ) -> Result<Listing, RemoteError> {
        let mut collector = Collector::default();
        let mut pending = vec![ROOT_NODE_ID.to_string()];
        while let Some(node_id) = pending.pop() {
            if expired(deadline) {
                return Ok(collector.finish(PassMode::Full, None, false));
            }
            let children = self.remote.list_children(token, &node_id).await?;
            pending.extend(
                children
                    .iter()
                    .rev()
                    .filter(|child| child.is_folder)
                    .map(|child| child.id.clone()),
            );
            collector.extend(children);
        }
        Ok(collector.finish(PassMode::Full, None, true))
    }

    async fn folder_moved(&self, user_id: &str, items: &[RemoteItem]) -> Result<bool, IndexError> {
        for item in items.iter().filter(|i| i.is_folder && !i.is_root && !i.is_deleted) {
            if let Some(prior) = self.index.get_record(user_id, &item.id).await? {
                if prior.name != item.name || prior.parent_id != item.parent_id {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Classifies every listed item and writes its record. Returns the
    /// actions that still have to touch the filesystem.
    async fn plan(
        &self,
        user_id: &str,
        user_root: &Path,
        items: &[RemoteItem],
        report: &mut PassReport,
    ) -> Result<Vec<Job>, PassError> {
        let mut folder_paths: HashMap<String, PathBuf> = HashMap::new();
        let mut jobs = Vec::new();

        for item in items {
            if item.is_root {
                folder_paths.insert(item.id.clone(), user_root.to_path_buf());
                continue;
            }
            if item.is_deleted {
                if self.index.retire(user_id, &item.id).await? {
                    debug!(user_id, item_id = %item.id, "retired by tombstone");
                }
                continue;
            }
            report.observed += 1;

            let target = self.target_path(user_id, user_root, item, &folder_paths).await?;
            let prior = self.index.get_record(user_id, &item.id).await?;
            let present = applier::is_present(&target, item.is_folder).await;
            let action = classify(item, prior.as_ref(), &target, present);
            if item.is_folder {
                folder_paths.insert(item.id.clone(), target.clone());
            }

            self.index.upsert(&record_input(user_id, item, &target)).await?;
            if action.needs_materialization() {
                jobs.push(Job {
                    item: item.clone(),
                    target,
                    action,
                    prior,
                });
            } else {
                report.unchanged += 1;
            }
        }
        Ok(jobs)
    }

    async fn target_path(
        &self,
        user_id: &str,
        user_root: &Path,
        item: &RemoteItem,
        folder_paths: &HashMap<String, PathBuf>,
    ) -> Result<PathBuf, IndexError> {
        if item
            .remote_path_hint
            .as_deref()
            .is_some_and(paths::has_root_marker)
        {
            return Ok(paths::local_path_for(user_root, item));
        }
        // Change-feed entries usually carry no path hint; walk the parent.
        let Some(parent_id) = item.parent_id.as_deref() else {
            return Ok(paths::local_path_for(user_root, item));
        };
        if let Some(parent_dir) = folder_paths.get(parent_id) {
            return Ok(paths::child_path(parent_dir, item));
        }
        Ok(match self.index.get_record(user_id, parent_id).await? {
            Some(parent) if parent.is_folder => paths::child_path(&parent.local_path, item),
            _ => paths::local_path_for(user_root, item),
        })
    }

    /// Materializes planned actions with bounded concurrency. A failed
    /// action rolls its record back and the pass continues. Returns the
    /// old paths of completed moves.
    async fn apply(
        &self,
        user_id: &str,
        token: &str,
        jobs: Vec<Job>,
        deadline: Option<Instant>,
        report: &mut PassReport,
    ) -> Result<Vec<(String, PathBuf)>, PassError> {
        let concurrency = self.config.download_concurrency.max(1);
        let results: Vec<(Job, Result<(), JobError>)> = stream::iter(jobs)
            .map(|job| async move {
                let result = self.materialize(token, &job, deadline).await;
                (job, result)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut moved_from = Vec::new();
        for (job, result) in results {
            match result {
                Ok(()) => match job.action {
                    Action::Create => report.created += 1,
                    Action::Update => report.updated += 1,
                    Action::Move { from } => {
                        report.moved += 1;
                        moved_from.push((job.item.id, from));
                    }
                    Action::NoOp => report.unchanged += 1,
                },
                Err(err) => {
                    if matches!(err, JobError::Deadline) {
                        report.deferred += 1;
                    } else {
                        report.failed += 1;
                        warn!(
                            user_id,
                            item_id = %job.item.id,
                            path = %job.target.display(),
                            "materialization failed: {err}"
                        );
                    }
                    // A prior record only stays valid while its artifact is on disk.
                    let prior = match job.prior {
                        Some(prior) => applier::is_present(&prior.local_path, prior.is_folder)
                            .await
                            .then_some(prior),
                        None => None,
                    };
                    match prior {
                        Some(prior) => self.index.restore(&prior).await?,
                        None => self.index.unconfirm(user_id, &job.item.id).await?,
                    }
                }
            }
        }
        Ok(moved_from)
    }

    async fn materialize(
        &self,
        token: &str,
        job: &Job,
        deadline: Option<Instant>,
    ) -> Result<(), JobError> {
        if job.item.is_folder {
            self.applier.materialize_folder(&job.target).await?;
            return Ok(());
        }
        if expired(deadline) {
            return Err(JobError::Deadline);
        }
        let source = match &job.item.download_url {
            Some(url) => ContentSource {
                url: url.clone(),
                sha256: job.item.sha256.clone(),
            },
            None => self.remote.resolve_download_source(token, &job.item.id).await?,
        };
        let written = self.applier.materialize_file(&job.target, &source).await?;
        debug!(item_id = %job.item.id, path = %job.target.display(), bytes = written, "downloaded");
        Ok(())
    }

    async fn remove_moved(
        &self,
        user_id: &str,
        mut moved_from: Vec<(String, PathBuf)>,
    ) -> Result<(), IndexError> {
        moved_from.sort_by_key(|(_, path)| std::cmp::Reverse(path.components().count()));
        for (item_id, old_path) in moved_from {
            // Another item may have moved into the vacated path this pass.
            if self.index.path_claimed(user_id, &old_path, &item_id).await? {
                continue;
            }
            self.remove_best_effort(&old_path).await;
        }
        Ok(())
    }

    async fn remove_deepest_first(&self, mut paths: Vec<PathBuf>) {
        paths.sort_by_key(|path| std::cmp::Reverse(path.components().count()));
        for path in paths {
            self.remove_best_effort(&path).await;
        }
    }

    async fn remove_best_effort(&self, path: &Path) {
        match self.applier.remove_path(path).await {
            Ok(RemoveOutcome::Removed) => debug!(path = %path.display(), "removed"),
            Ok(RemoveOutcome::NotEmpty) => debug!(path = %path.display(), "directory not empty, kept"),
            Ok(RemoveOutcome::Missing) => {}
            Err(err) => warn!(path = %path.display(), "failed to remove: {err}"),
        }
    }

    async fn finish(
        &self,
        user_id: &str,
        listing: &Listing,
        report: &PassReport,
    ) -> Result<(), PassError> {
        let now = now_unix();
        let mut update = StatusUpdate {
            last_error: Some(None),
            ..StatusUpdate::state(SyncState::Idle)
        };
        if listing.complete {
            match listing.mode {
                PassMode::Full => update.last_full_sync_at = Some(now),
                PassMode::Incremental => update.last_incremental_sync_at = Some(now),
            }
        }
        // Failed or deferred items must be reported again next pass. An
        // older cursor replays them for an incremental pass; after a full
        // listing it may predate them, so the next pass lists in full.
        let settled = listing.complete && report.failed == 0 && report.deferred == 0;
        if settled {
            update.resume_cursor = Some(listing.cursor.clone());
        } else if listing.mode == PassMode::Full {
            update.resume_cursor = Some(None);
        }
        self.index.set_status(user_id, &update).await?;

        let Some(dir) = &self.config.manifest_dir else {
            return Ok(());
        };
        if !report.truncated {
            let records = self.index.list_records(user_id).await?;
            let target = dir.join(format!("{user_id}.json"));
            if let Err(err) = write_manifest(&target, &records).await {
                warn!(user_id, "failed to write manifest: {err}");
            }
        }
        Ok(())
    }
}

fn record_input(user_id: &str, item: &RemoteItem, target: &Path) -> RecordInput {
    RecordInput {
        user_id: user_id.to_string(),
        id: item.id.clone(),
        name: item.name.clone(),
        is_folder: item.is_folder,
        size: item.size,
        parent_id: item.parent_id.clone(),
        remote_path: item.remote_path_hint.clone(),
        local_path: target.to_path_buf(),
        content_tag: item.content_tag.clone(),
        created_at: item.created_at,
        modified_at: item.modified_at,
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
