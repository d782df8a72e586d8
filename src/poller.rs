//! Pull-based live capture.
//!
//! The poller loops forever: walk the channel list sequentially, fetch
//! everything newer than each channel's poll cursor, store it, publish
//! notifications, sleep, repeat. Sequential on purpose — a polling cycle is
//! latency-insensitive and the shared request pacer dominates throughput
//! anyway, so worker fan-out would buy nothing here.
//!
//! Cold start: a channel with no poll cursor starts at "now". The poller's
//! job is to keep up with new traffic; history belongs to the importer. The
//! sentinel for "never polled" is the absent cursor row itself, so the first
//! cycle writes the current wall clock as the cursor and fetches nothing.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::{paced, ApiError, ChatApi};
use crate::config::LimitsConfig;
use crate::limiter::RateLimiter;
use crate::models::{now_ts, Channel, MessageEvent};
use crate::notify::Notifier;
use crate::stop::StopFlag;
use crate::store::Store;

pub struct Poller {
    api: Arc<dyn ChatApi>,
    store: Store,
    limiter: Arc<RateLimiter>,
    notifier: Notifier,
    limits: LimitsConfig,
    stop: StopFlag,
}

impl Poller {
    pub fn new(
        api: Arc<dyn ChatApi>,
        store: Store,
        limiter: Arc<RateLimiter>,
        notifier: Notifier,
        limits: LimitsConfig,
        stop: StopFlag,
    ) -> Self {
        Self {
            api,
            store,
            limiter,
            notifier,
            limits,
            stop,
        }
    }

    /// Poll until stopped. Returns `Err` only when the credential is rejected
    /// or storage fails; everything else is retried next cycle.
    pub async fn run(&self) -> Result<()> {
        let mut channels: Vec<Channel> = Vec::new();
        let mut channels_age = Duration::MAX;
        let refresh_after = Duration::from_secs(self.limits.channel_refresh_secs);
        let cycle_sleep = Duration::from_secs(self.limits.poll_interval_secs);

        loop {
            if self.stop.is_stopped() {
                return Ok(());
            }

            if channels_age >= refresh_after {
                match self.refresh_channels().await {
                    Ok(list) => {
                        info!(channels = list.len(), "poller refreshed channel list");
                        channels = list;
                        channels_age = Duration::ZERO;
                    }
                    Err(err) => {
                        if is_fatal(&err) {
                            return Err(err.into());
                        }
                        warn!(error = %err, "channel list refresh failed, reusing previous list");
                    }
                }
            }

            for channel in &channels {
                if self.stop.is_stopped() {
                    return Ok(());
                }
                if let Err(err) = self.poll_channel(channel).await {
                    match err.downcast_ref::<ApiError>() {
                        Some(ApiError::AuthInvalid(_)) | None => return Err(err),
                        Some(_) => {
                            debug!(channel = %channel.id, error = %err, "poll skipped this cycle")
                        }
                    }
                }
            }

            tokio::time::sleep(cycle_sleep).await;
            channels_age = channels_age.saturating_add(cycle_sleep);
        }
    }

    async fn refresh_channels(&self) -> Result<Vec<Channel>, ApiError> {
        let mut channels = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = paced(&self.limiter, || {
                self.api.list_channels(cursor.as_deref())
            })
            .await?;
            channels.extend(page.items);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(channels),
            }
        }
    }

    /// One channel, one cycle: everything newer than the poll cursor.
    async fn poll_channel(&self, channel: &Channel) -> Result<()> {
        let Some(since) = self.store.poll_cursor(&channel.id).await? else {
            // Never polled: anchor at now and pick up from here next cycle.
            self.store.set_poll_cursor(&channel.id, &now_ts()).await?;
            return Ok(());
        };

        let mut newest = since.clone();
        let mut page_cursor: Option<String> = None;
        loop {
            let page = paced(&self.limiter, || {
                self.api
                    .history(&channel.id, Some(since.as_str()), page_cursor.as_deref())
            })
            .await?;

            self.store.upsert_message_page(&page.items).await?;
            for message in &page.items {
                if message.ts > newest {
                    newest = message.ts.clone();
                }
                self.notifier.publish(MessageEvent::from(message));
                if message.is_thread_parent() {
                    self.poll_replies(channel, &message.ts, &since).await?;
                }
            }

            match page.next_cursor {
                Some(next) => page_cursor = Some(next),
                None => break,
            }
        }

        if newest > since {
            self.store.set_poll_cursor(&channel.id, &newest).await?;
        }
        Ok(())
    }

    async fn poll_replies(&self, channel: &Channel, thread_ts: &str, since: &str) -> Result<()> {
        let mut page_cursor: Option<String> = None;
        loop {
            let page = paced(&self.limiter, || {
                self.api
                    .replies(&channel.id, thread_ts, Some(since), page_cursor.as_deref())
            })
            .await;
            let page = match page {
                Ok(page) => page,
                Err(ApiError::Gone(code)) => {
                    debug!(channel = %channel.id, thread_ts, code, "thread unavailable");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };

            self.store.upsert_message_page(&page.items).await?;
            for message in &page.items {
                if message.ts.as_str() > since {
                    self.notifier.publish(MessageEvent::from(message));
                }
            }

            match page.next_cursor {
                Some(next) => page_cursor = Some(next),
                None => return Ok(()),
            }
        }
    }
}

fn is_fatal(err: &ApiError) -> bool {
    matches!(err, ApiError::AuthInvalid(_))
}
