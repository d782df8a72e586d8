//! Bulk history import: directory refresh, per-channel backfill, metadata.
//!
//! Each run refreshes the user and channel directories, then walks every
//! channel's history strictly forward from that channel's import cursor.
//! Fresh channels (no cursor yet) get a full backfill; channels seen before
//! get a cheap incremental check. The two groups run as separate scheduling
//! passes because their worker counts differ: incremental checks are mostly
//! one request each, so they tolerate a wider pool on the same request
//! budget.
//!
//! Failure policy: everything channel-scoped is contained. Rate limits are
//! retried in place; a channel that turns out to be gone, or flakes mid-page,
//! is abandoned for this run with its cursor advanced to the newest message
//! that was durably stored, so the next run resumes exactly where this one
//! reached. Only credential rejection and storage failures escape, and those
//! abort the whole run.

use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::{paced, ApiError, ChatApi};
use crate::config::LimitsConfig;
use crate::limiter::RateLimiter;
use crate::models::Channel;
use crate::scheduler::{run_bounded, Failures};
use crate::stop::StopFlag;
use crate::store::Store;

pub struct HistoryImporter {
    api: Arc<dyn ChatApi>,
    store: Store,
    limiter: Arc<RateLimiter>,
    limits: LimitsConfig,
    stop: StopFlag,
}

/// What one import run accomplished.
#[derive(Debug, Default)]
pub struct ImportReport {
    pub users_seen: usize,
    pub channels_seen: usize,
    pub channels_backfilled: usize,
    pub channels_incremental: usize,
    pub messages_stored: usize,
    /// Channels abandoned mid-run (gone or transiently failing).
    pub channels_abandoned: usize,
}

impl HistoryImporter {
    pub fn new(
        api: Arc<dyn ChatApi>,
        store: Store,
        limiter: Arc<RateLimiter>,
        limits: LimitsConfig,
        stop: StopFlag,
    ) -> Self {
        Self {
            api,
            store,
            limiter,
            limits,
            stop,
        }
    }

    /// One full import pass. Safe to interrupt and re-run: all writes are
    /// idempotent and cursors only advance past durably stored messages.
    pub async fn run(&self) -> Result<ImportReport> {
        let mut report = ImportReport::default();

        info!("refreshing user directory");
        report.users_seen = self.refresh_users().await?;

        info!("refreshing channel directory");
        let channels = self.refresh_channels().await?;
        report.channels_seen = channels.len();

        self.sync_workspace_metadata().await;

        // Partition on cursor presence: a channel with no import cursor has
        // never completed a page and gets the full backfill treatment.
        let mut fresh = Vec::new();
        let mut seen = Vec::new();
        for channel in channels {
            if self.store.import_cursor(&channel.id).await?.is_some() {
                seen.push(channel);
            } else {
                fresh.push(channel);
            }
        }
        report.channels_incremental = seen.len();
        report.channels_backfilled = fresh.len();
        info!(
            incremental = seen.len(),
            backfill = fresh.len(),
            "starting channel sync"
        );

        let stored = AtomicUsize::new(0);
        let abandoned = AtomicUsize::new(0);

        let failures = run_bounded(seen.len(), self.limits.incremental_concurrency, |i| {
            self.sync_channel(&seen[i], &stored, &abandoned)
        })
        .await;
        first_fatal(failures)?;

        if !self.stop.is_stopped() {
            let failures = run_bounded(fresh.len(), self.limits.backfill_concurrency, |i| {
                self.sync_channel(&fresh[i], &stored, &abandoned)
            })
            .await;
            first_fatal(failures)?;
        }

        report.messages_stored = stored.load(Ordering::SeqCst);
        report.channels_abandoned = abandoned.load(Ordering::SeqCst);
        Ok(report)
    }

    // ============ Directory refresh ============

    async fn refresh_users(&self) -> Result<usize> {
        let mut count = 0;
        let mut cursor: Option<String> = None;
        loop {
            let page = paced(&self.limiter, || {
                self.api.list_users(cursor.as_deref())
            })
            .await?;
            for user in &page.items {
                self.store.upsert_user(user).await?;
            }
            count += page.items.len();
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(count),
            }
        }
    }

    async fn refresh_channels(&self) -> Result<Vec<Channel>> {
        let mut channels = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = paced(&self.limiter, || {
                self.api.list_channels(cursor.as_deref())
            })
            .await?;
            for channel in &page.items {
                self.store.upsert_channel(channel).await?;
            }
            channels.extend(page.items);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(channels),
            }
        }
    }

    // ============ Per-channel sync ============

    /// Sync one channel end to end. Returns `Err` only for failures that are
    /// fatal to the whole run; everything channel-scoped is contained here.
    async fn sync_channel(
        &self,
        channel: &Channel,
        stored: &AtomicUsize,
        abandoned: &AtomicUsize,
    ) -> Result<()> {
        if self.stop.is_stopped() {
            return Ok(());
        }

        let since = self.store.import_cursor(&channel.id).await?;
        let mut newest: Option<String> = None;

        let outcome = self
            .pull_history(channel, since.as_deref(), &mut newest, stored)
            .await;

        // Terminal cursor write on every exit path: whatever was durably
        // stored is never re-fetched.
        if let Some(ts) = &newest {
            self.store.set_import_cursor(&channel.id, ts).await?;
        }

        match outcome {
            Ok(()) => {}
            Err(err) => match err.downcast_ref::<ApiError>() {
                Some(ApiError::AuthInvalid(_)) | None => return Err(err),
                Some(_) => {
                    abandoned.fetch_add(1, Ordering::SeqCst);
                    warn!(channel = %channel.id, error = %err, "abandoning channel for this run");
                    return Ok(());
                }
            },
        }

        self.sync_channel_metadata(channel).await;
        Ok(())
    }

    async fn pull_history(
        &self,
        channel: &Channel,
        since: Option<&str>,
        newest: &mut Option<String>,
        stored: &AtomicUsize,
    ) -> Result<()> {
        self.ensure_member(channel).await;

        let mut page_cursor: Option<String> = None;
        loop {
            if self.stop.is_stopped() {
                return Ok(());
            }
            let page = paced(&self.limiter, || {
                self.api
                    .history(&channel.id, since, page_cursor.as_deref())
            })
            .await?;

            self.store.upsert_message_page(&page.items).await?;
            stored.fetch_add(page.items.len(), Ordering::SeqCst);

            for message in &page.items {
                bump(newest, &message.ts);
                if message.is_thread_parent() {
                    self.pull_replies(channel, &message.ts, since, newest, stored)
                        .await?;
                }
            }

            match page.next_cursor {
                Some(next) => page_cursor = Some(next),
                None => return Ok(()),
            }
        }
    }

    /// Replies land under the same cursor regime as the parent channel:
    /// bounded below by `since`, so a resumed run only fetches replies it has
    /// not stored yet.
    async fn pull_replies(
        &self,
        channel: &Channel,
        thread_ts: &str,
        since: Option<&str>,
        newest: &mut Option<String>,
        stored: &AtomicUsize,
    ) -> Result<()> {
        let mut page_cursor: Option<String> = None;
        loop {
            let page = paced(&self.limiter, || {
                self.api
                    .replies(&channel.id, thread_ts, since, page_cursor.as_deref())
            })
            .await;
            let page = match page {
                Ok(page) => page,
                // A vanished thread is not worth abandoning the channel over.
                Err(ApiError::Gone(code)) => {
                    debug!(channel = %channel.id, thread_ts, code, "thread unavailable");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };

            self.store.upsert_message_page(&page.items).await?;
            stored.fetch_add(page.items.len(), Ordering::SeqCst);
            for message in &page.items {
                bump(newest, &message.ts);
            }

            match page.next_cursor {
                Some(next) => page_cursor = Some(next),
                None => return Ok(()),
            }
        }
    }

    /// Best-effort join for public channels the credential can see but is not
    /// yet a member of. A refusal just means history will come back `Gone`.
    async fn ensure_member(&self, channel: &Channel) {
        if channel.is_member || channel.is_private || channel.is_im || channel.is_mpim {
            return;
        }
        let result = paced(&self.limiter, || self.api.join_channel(&channel.id)).await;
        if let Err(err) = result {
            debug!(channel = %channel.id, error = %err, "could not join channel");
        }
    }

    // ============ Metadata ============

    /// Workspace-scoped listings are cheap and refreshed on every run.
    /// Failures here never affect message import.
    async fn sync_workspace_metadata(&self) {
        for kind in ["emoji", "usergroups", "files", "stars"] {
            let result = match kind {
                "emoji" => paced(&self.limiter, || self.api.list_emoji()).await,
                "usergroups" => paced(&self.limiter, || self.api.list_usergroups()).await,
                "files" => paced(&self.limiter, || self.api.list_files()).await,
                _ => paced(&self.limiter, || self.api.list_stars()).await,
            };
            match result {
                Ok(items) => {
                    if let Err(err) = self.store.replace_workspace_meta(kind, &items).await {
                        warn!(kind, error = %err, "failed to store workspace metadata");
                    }
                }
                Err(err) => warn!(kind, error = %err, "failed to list workspace metadata"),
            }
        }
    }

    /// Pins and bookmarks change rarely, so they sit behind a TTL gate
    /// instead of burning two requests per channel per run.
    async fn sync_channel_metadata(&self, channel: &Channel) {
        for kind in ["pins", "bookmarks"] {
            if let Err(err) = self.refresh_channel_meta(channel, kind).await {
                debug!(channel = %channel.id, kind, error = %err, "channel metadata refresh failed");
            }
        }
    }

    async fn refresh_channel_meta(&self, channel: &Channel, kind: &str) -> Result<()> {
        if self
            .store
            .is_metadata_fresh(&channel.id, kind, self.limits.metadata_ttl())
            .await?
        {
            return Ok(());
        }
        let items = if kind == "pins" {
            paced(&self.limiter, || self.api.list_pins(&channel.id)).await?
        } else {
            paced(&self.limiter, || self.api.list_bookmarks(&channel.id)).await?
        };
        self.store
            .replace_channel_meta(&channel.id, kind, &items)
            .await?;
        self.store.touch_metadata(&channel.id, kind).await?;
        Ok(())
    }
}

/// Surface the first fatal failure from a scheduling pass. By construction
/// `sync_channel` only returns errors that are fatal to the run.
fn first_fatal(mut failures: Failures) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }
    let (index, err) = failures.remove(0);
    Err(err.context(format!("channel sync {} failed fatally", index)))
}

fn bump(newest: &mut Option<String>, ts: &str) {
    if newest.as_deref().map_or(true, |n| ts > n) {
        *newest = Some(ts.to_string());
    }
}
