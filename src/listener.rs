//! Push-based live capture over the workspace's event socket.
//!
//! The listener negotiates a socket URL, connects, acknowledges every
//! envelope, and applies the events it understands to the store. Everything
//! arriving here is also reachable by the poller and the importer, so a
//! dropped connection or an unrecognized event costs freshness, never data.
//!
//! Reaction events carry no message body, so the listener re-fetches the
//! affected message and replaces the stored row. If the message was edited
//! between the event and the fetch, the fetch returns the newer body and the
//! stored row is newer than the event that triggered it. Accepted: the store
//! converges on whatever the source currently says.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::api::{self, paced, ApiError, ChatApi};
use crate::limiter::RateLimiter;
use crate::models::MessageEvent;
use crate::notify::Notifier;
use crate::stop::StopFlag;
use crate::store::Store;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct EventListener {
    api: Arc<dyn ChatApi>,
    store: Store,
    limiter: Arc<RateLimiter>,
    notifier: Notifier,
    stop: StopFlag,
    /// Author ids already confirmed present in the store this session.
    known_users: HashSet<String>,
}

impl EventListener {
    pub fn new(
        api: Arc<dyn ChatApi>,
        store: Store,
        limiter: Arc<RateLimiter>,
        notifier: Notifier,
        stop: StopFlag,
    ) -> Self {
        Self {
            api,
            store,
            limiter,
            notifier,
            stop,
            known_users: HashSet::new(),
        }
    }

    /// Listen until stopped, reconnecting after every disconnect. Returns
    /// `Err` only on credential rejection or storage failure.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            if self.stop.is_stopped() {
                return Ok(());
            }
            let url = match paced(&self.limiter, || self.api.connect_url()).await {
                Ok(url) => url,
                Err(err @ ApiError::AuthInvalid(_)) => {
                    return Err(err).context("event socket negotiation rejected")
                }
                Err(err) => {
                    warn!(error = %err, "could not negotiate event socket, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            match self.listen(&url).await {
                Ok(()) => info!("event socket closed, reconnecting"),
                Err(err) => match err.downcast_ref::<ApiError>() {
                    Some(ApiError::AuthInvalid(_)) | None => return Err(err),
                    Some(_) => warn!(error = %err, "event socket error, reconnecting"),
                },
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    /// One socket session, from connect to disconnect.
    async fn listen(&mut self, url: &str) -> Result<()> {
        let (mut socket, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ApiError::Transient(e.to_string()))?;
        info!("event socket connected");

        loop {
            let frame = tokio::select! {
                frame = socket.next() => frame,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    if self.stop.is_stopped() {
                        let _ = socket.close(None).await;
                        return Ok(());
                    }
                    continue;
                }
            };

            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(ApiError::Transient(e.to_string()).into()),
                None => return Ok(()),
            };

            match frame {
                WsMessage::Text(raw) => {
                    let envelope: Value = match serde_json::from_str(raw.as_str()) {
                        Ok(v) => v,
                        Err(err) => {
                            debug!(error = %err, "unparseable socket frame");
                            continue;
                        }
                    };

                    // Ack before processing: the source retries unacked
                    // envelopes, and every handler below is idempotent anyway.
                    if let Some(envelope_id) = envelope["envelope_id"].as_str() {
                        let ack = json!({ "envelope_id": envelope_id }).to_string();
                        socket
                            .send(WsMessage::Text(ack.into()))
                            .await
                            .map_err(|e| ApiError::Transient(e.to_string()))?;
                    }

                    match envelope["type"].as_str() {
                        Some("events_api") => {
                            self.handle_event(&envelope["payload"]["event"]).await?
                        }
                        Some("disconnect") => {
                            info!("source requested socket refresh");
                            let _ = socket.close(None).await;
                            return Ok(());
                        }
                        Some("hello") | None | Some(_) => {}
                    }
                }
                WsMessage::Ping(payload) => {
                    socket
                        .send(WsMessage::Pong(payload))
                        .await
                        .map_err(|e| ApiError::Transient(e.to_string()))?;
                }
                WsMessage::Close(_) => return Ok(()),
                _ => {}
            }
        }
    }

    async fn handle_event(&mut self, event: &Value) -> Result<()> {
        match event["type"].as_str() {
            Some("message") => self.handle_message(event).await,
            Some("reaction_added") | Some("reaction_removed") => {
                let channel_id = event["item"]["channel"].as_str().unwrap_or_default();
                let ts = event["item"]["ts"].as_str().unwrap_or_default();
                if !channel_id.is_empty() && !ts.is_empty() {
                    self.refetch_message(channel_id, ts).await?;
                }
                Ok(())
            }
            Some("channel_created") | Some("channel_rename") => {
                if let Some(channel) = api::channel_from_json(&event["channel"]) {
                    self.store.upsert_channel(&channel).await?;
                }
                Ok(())
            }
            Some("team_join") | Some("user_change") => {
                if let Some(user) = api::user_from_json(&event["user"]) {
                    self.known_users.insert(user.id.clone());
                    self.store.upsert_user(&user).await?;
                }
                Ok(())
            }
            Some("member_joined_channel") => {
                if let Some(user_id) = event["user"].as_str() {
                    self.refresh_author(user_id).await?;
                }
                Ok(())
            }
            Some(other) => {
                debug!(event_type = other, "ignoring event");
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn handle_message(&mut self, event: &Value) -> Result<()> {
        let channel_id = event["channel"].as_str().unwrap_or_default();
        if channel_id.is_empty() {
            return Ok(());
        }

        match event["subtype"].as_str() {
            Some("message_changed") => {
                // The replacement body rides in the nested message.
                if let Some(mut message) = api::message_from_json(channel_id, &event["message"]) {
                    message.edited = true;
                    self.store.upsert_message(&message).await?;
                    self.notifier.publish(MessageEvent::from(&message));
                }
                Ok(())
            }
            Some("message_deleted") => {
                if let Some(ts) = event["deleted_ts"].as_str() {
                    self.store.delete_message(channel_id, ts).await?;
                }
                Ok(())
            }
            // Subtyped service messages (joins, topic changes) still carry a
            // ts and text worth storing; handle them like plain messages.
            _ => {
                let Some(message) = api::message_from_json(channel_id, event) else {
                    return Ok(());
                };
                if let Some(user_id) = &message.user_id {
                    self.ensure_author(user_id).await?;
                }
                self.store.upsert_message(&message).await?;
                self.notifier.publish(MessageEvent::from(&message));
                Ok(())
            }
        }
    }

    /// Replace the stored row with the source's current version of a message.
    async fn refetch_message(&self, channel_id: &str, ts: &str) -> Result<()> {
        let fetched = paced(&self.limiter, || self.api.message_at(channel_id, ts)).await;
        match fetched {
            Ok(Some(message)) => self.store.upsert_message(&message).await,
            Ok(None) => {
                debug!(channel_id, ts, "message vanished before refetch");
                Ok(())
            }
            Err(err @ ApiError::AuthInvalid(_)) => Err(err.into()),
            Err(err) => {
                debug!(channel_id, ts, error = %err, "refetch failed");
                Ok(())
            }
        }
    }

    /// Fetch an unseen author's profile so display names are denormalized
    /// correctly on the first write.
    async fn ensure_author(&mut self, user_id: &str) -> Result<()> {
        if self.known_users.contains(user_id) {
            return Ok(());
        }
        if self.store.user(user_id).await?.is_some() {
            self.known_users.insert(user_id.to_string());
            return Ok(());
        }
        self.refresh_author(user_id).await
    }

    /// Unconditionally re-fetch one profile.
    async fn refresh_author(&mut self, user_id: &str) -> Result<()> {
        match paced(&self.limiter, || self.api.user_info(user_id)).await {
            Ok(user) => {
                self.store.upsert_user(&user).await?;
                self.known_users.insert(user_id.to_string());
            }
            Err(err @ ApiError::AuthInvalid(_)) => return Err(err.into()),
            Err(err) => debug!(user_id, error = %err, "profile lookup failed"),
        }
        Ok(())
    }
}
