//! Upstream workspace protocol client.
//!
//! [`ChatApi`] is the seam between the ingestion components and the remote
//! workspace: paginated history and reply listing, channel/user listing,
//! single-message lookup, join, the metadata listings, and socket URL
//! negotiation for push capture. The ingestion code is written against the
//! trait so tests can drive it with a scripted in-memory fake.
//!
//! All upstream failures are classified here, at one boundary, into the
//! [`ApiError`] taxonomy. The callers make retry/skip/fatal decisions from
//! the variant alone and never look at raw protocol errors:
//!
//! | Variant | Meaning | Caller response |
//! |---------|---------|-----------------|
//! | `RateLimited` | request budget exhausted, retry-after attached | retry the same operation after the delay |
//! | `Gone` | channel-scoped permanent (not a member, not found) | skip this unit of work |
//! | `AuthInvalid` | credential rejected | fatal to the capture path |
//! | `Transient` | timeout / connection reset | skip for this run, next run catches up |
//! | `Upstream` | anything else the source reported | treated like `Transient` |

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::limiter::RateLimiter;
use crate::models::{Channel, Message, User};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("channel unavailable: {0}")]
    Gone(String),
    #[error("credential rejected: {0}")]
    AuthInvalid(String),
    #[error("transient network failure: {0}")]
    Transient(String),
    #[error("upstream error: {0}")]
    Upstream(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// One page of a paginated listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }
}

/// Abstracted upstream protocol. One implementation talks to the real
/// workspace; tests substitute a scripted fake.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_channels(&self, cursor: Option<&str>) -> ApiResult<Page<Channel>>;
    async fn list_users(&self, cursor: Option<&str>) -> ApiResult<Page<User>>;

    /// Messages strictly newer than `oldest` (exclusive), one page at a time.
    async fn history(
        &self,
        channel_id: &str,
        oldest: Option<&str>,
        cursor: Option<&str>,
    ) -> ApiResult<Page<Message>>;

    /// Replies in one thread, bounded and paginated like `history`.
    async fn replies(
        &self,
        channel_id: &str,
        thread_ts: &str,
        oldest: Option<&str>,
        cursor: Option<&str>,
    ) -> ApiResult<Page<Message>>;

    /// Look up one message by its exact timestamp.
    async fn message_at(&self, channel_id: &str, ts: &str) -> ApiResult<Option<Message>>;

    async fn user_info(&self, user_id: &str) -> ApiResult<User>;
    async fn join_channel(&self, channel_id: &str) -> ApiResult<()>;

    async fn list_emoji(&self) -> ApiResult<Vec<(String, Value)>>;
    async fn list_usergroups(&self) -> ApiResult<Vec<(String, Value)>>;
    async fn list_files(&self) -> ApiResult<Vec<(String, Value)>>;
    async fn list_stars(&self) -> ApiResult<Vec<(String, Value)>>;
    async fn list_pins(&self, channel_id: &str) -> ApiResult<Vec<(String, Value)>>;
    async fn list_bookmarks(&self, channel_id: &str) -> ApiResult<Vec<(String, Value)>>;

    /// Negotiate a URL for the long-lived event socket (push capture).
    async fn connect_url(&self) -> ApiResult<String>;
}

/// Run one upstream call under the shared pacer, retrying in place when the
/// source pushes back with a rate limit. Every other error variant is
/// returned to the caller untouched.
pub async fn paced<'a, T>(
    limiter: &RateLimiter,
    mut call: impl FnMut() -> BoxFuture<'a, ApiResult<T>>,
) -> ApiResult<T> {
    loop {
        limiter.acquire().await;
        match call().await {
            Err(ApiError::RateLimited { retry_after }) => {
                tracing::warn!(?retry_after, "rate limited upstream, backing off");
                tokio::time::sleep(retry_after).await;
            }
            other => return other,
        }
    }
}

// ============ Workspace client ============

pub struct WorkspaceClient {
    http: reqwest::Client,
    base: String,
    token: String,
    app_token: Option<String>,
}

impl WorkspaceClient {
    pub fn new(base: &str, token: &str, app_token: Option<&str>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            app_token: app_token.map(str::to_string),
        })
    }

    async fn call(&self, method: &str, params: &[(&str, String)]) -> ApiResult<Value> {
        let url = format!("{}/{}", self.base, method);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(params)
            .send()
            .await
            .map_err(classify_transport)?;
        decode_envelope(resp).await
    }

    async fn call_post(
        &self,
        method: &str,
        token: &str,
        params: &[(&str, String)],
    ) -> ApiResult<Value> {
        let url = format!("{}/{}", self.base, method);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .form(params)
            .send()
            .await
            .map_err(classify_transport)?;
        decode_envelope(resp).await
    }

    async fn message_page(
        &self,
        method: &str,
        mut params: Vec<(&str, String)>,
        channel_id: &str,
        oldest: Option<&str>,
        cursor: Option<&str>,
    ) -> ApiResult<Page<Message>> {
        params.push(("channel", channel_id.to_string()));
        params.push(("limit", "200".to_string()));
        if let Some(oldest) = oldest {
            params.push(("oldest", oldest.to_string()));
        }
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        let body = self.call(method, &params).await?;
        let messages = body["messages"]
            .as_array()
            .map(|msgs| {
                msgs.iter()
                    .filter_map(|m| message_from_json(channel_id, m))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Page {
            items: messages,
            next_cursor: next_cursor(&body),
        })
    }

    /// Drain a page-numbered listing (`files.list`, `stars.list`) into a flat
    /// id/payload list.
    async fn paged_items(
        &self,
        method: &str,
        list_key: &str,
        id_key: &str,
    ) -> ApiResult<Vec<(String, Value)>> {
        let mut items = Vec::new();
        let mut page = 1u64;
        loop {
            let body = self
                .call(method, &[("count", "200".to_string()), ("page", page.to_string())])
                .await?;
            if let Some(list) = body[list_key].as_array() {
                for entry in list {
                    if let Some(id) = entry[id_key].as_str().or_else(|| entry["ts"].as_str()) {
                        items.push((id.to_string(), entry.clone()));
                    }
                }
            }
            let total_pages = body["paging"]["pages"].as_u64().unwrap_or(1);
            if page >= total_pages {
                break;
            }
            page += 1;
        }
        Ok(items)
    }
}

#[async_trait]
impl ChatApi for WorkspaceClient {
    async fn list_channels(&self, cursor: Option<&str>) -> ApiResult<Page<Channel>> {
        let mut params = vec![
            (
                "types",
                "public_channel,private_channel,mpim,im".to_string(),
            ),
            ("exclude_archived", "true".to_string()),
            ("limit", "200".to_string()),
        ];
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        let body = self.call("conversations.list", &params).await?;
        let channels = body["channels"]
            .as_array()
            .map(|chs| chs.iter().filter_map(channel_from_json).collect())
            .unwrap_or_default();
        Ok(Page {
            items: channels,
            next_cursor: next_cursor(&body),
        })
    }

    async fn list_users(&self, cursor: Option<&str>) -> ApiResult<Page<User>> {
        let mut params = vec![("limit", "200".to_string())];
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        let body = self.call("users.list", &params).await?;
        let users = body["members"]
            .as_array()
            .map(|members| members.iter().filter_map(user_from_json).collect())
            .unwrap_or_default();
        Ok(Page {
            items: users,
            next_cursor: next_cursor(&body),
        })
    }

    async fn history(
        &self,
        channel_id: &str,
        oldest: Option<&str>,
        cursor: Option<&str>,
    ) -> ApiResult<Page<Message>> {
        self.message_page("conversations.history", Vec::new(), channel_id, oldest, cursor)
            .await
    }

    async fn replies(
        &self,
        channel_id: &str,
        thread_ts: &str,
        oldest: Option<&str>,
        cursor: Option<&str>,
    ) -> ApiResult<Page<Message>> {
        let params = vec![("ts", thread_ts.to_string())];
        self.message_page("conversations.replies", params, channel_id, oldest, cursor)
            .await
    }

    async fn message_at(&self, channel_id: &str, ts: &str) -> ApiResult<Option<Message>> {
        let params = vec![
            ("channel", channel_id.to_string()),
            ("latest", ts.to_string()),
            ("inclusive", "true".to_string()),
            ("limit", "1".to_string()),
        ];
        let body = self.call("conversations.history", &params).await?;
        let found = body["messages"]
            .as_array()
            .and_then(|msgs| msgs.first())
            .and_then(|m| message_from_json(channel_id, m))
            .filter(|m| m.ts == ts);
        Ok(found)
    }

    async fn user_info(&self, user_id: &str) -> ApiResult<User> {
        let body = self
            .call("users.info", &[("user", user_id.to_string())])
            .await?;
        user_from_json(&body["user"])
            .ok_or_else(|| ApiError::Upstream(format!("malformed user payload for {}", user_id)))
    }

    async fn join_channel(&self, channel_id: &str) -> ApiResult<()> {
        self.call_post(
            "conversations.join",
            &self.token,
            &[("channel", channel_id.to_string())],
        )
        .await?;
        Ok(())
    }

    async fn list_emoji(&self) -> ApiResult<Vec<(String, Value)>> {
        let body = self.call("emoji.list", &[]).await?;
        let items = body["emoji"]
            .as_object()
            .map(|map| {
                map.iter()
                    .map(|(name, url)| (name.clone(), url.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(items)
    }

    async fn list_usergroups(&self) -> ApiResult<Vec<(String, Value)>> {
        let body = self.call("usergroups.list", &[]).await?;
        let items = body["usergroups"]
            .as_array()
            .map(|groups| {
                groups
                    .iter()
                    .filter_map(|g| g["id"].as_str().map(|id| (id.to_string(), g.clone())))
                    .collect()
            })
            .unwrap_or_default();
        Ok(items)
    }

    async fn list_files(&self) -> ApiResult<Vec<(String, Value)>> {
        self.paged_items("files.list", "files", "id").await
    }

    async fn list_stars(&self) -> ApiResult<Vec<(String, Value)>> {
        self.paged_items("stars.list", "items", "ts").await
    }

    async fn list_pins(&self, channel_id: &str) -> ApiResult<Vec<(String, Value)>> {
        let body = self
            .call("pins.list", &[("channel", channel_id.to_string())])
            .await?;
        let items = body["items"]
            .as_array()
            .map(|pins| {
                pins.iter()
                    .filter_map(|p| {
                        p["message"]["ts"]
                            .as_str()
                            .or_else(|| p["file"]["id"].as_str())
                            .map(|id| (id.to_string(), p.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(items)
    }

    async fn list_bookmarks(&self, channel_id: &str) -> ApiResult<Vec<(String, Value)>> {
        let body = self
            .call("bookmarks.list", &[("channel_id", channel_id.to_string())])
            .await?;
        let items = body["bookmarks"]
            .as_array()
            .map(|bookmarks| {
                bookmarks
                    .iter()
                    .filter_map(|b| b["id"].as_str().map(|id| (id.to_string(), b.clone())))
                    .collect()
            })
            .unwrap_or_default();
        Ok(items)
    }

    async fn connect_url(&self) -> ApiResult<String> {
        let app_token = self.app_token.as_deref().ok_or_else(|| {
            ApiError::AuthInvalid("no app-level token configured for push capture".to_string())
        })?;
        let body = self.call_post("apps.connections.open", app_token, &[]).await?;
        body["url"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ApiError::Upstream("connection open returned no url".to_string()))
    }
}

// ============ Envelope decoding and classification ============

async fn decode_envelope(resp: reqwest::Response) -> ApiResult<Value> {
    if resp.status().as_u16() == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_AFTER);
        return Err(ApiError::RateLimited { retry_after });
    }
    if resp.status().is_server_error() {
        return Err(ApiError::Transient(format!("HTTP {}", resp.status())));
    }

    let body: Value = resp.json().await.map_err(classify_transport)?;
    if body["ok"].as_bool() == Some(true) {
        return Ok(body);
    }
    let code = body["error"].as_str().unwrap_or("unknown").to_string();
    Err(classify_error_code(&code))
}

/// Fallback when the source rate-limits without advertising a delay.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

fn classify_transport(err: reqwest::Error) -> ApiError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_decode() {
        ApiError::Transient(err.to_string())
    } else {
        ApiError::Upstream(err.to_string())
    }
}

fn classify_error_code(code: &str) -> ApiError {
    match code {
        "ratelimited" => ApiError::RateLimited {
            retry_after: DEFAULT_RETRY_AFTER,
        },
        "not_in_channel" | "channel_not_found" | "thread_not_found" | "is_archived"
        | "method_not_supported_for_channel_type" => ApiError::Gone(code.to_string()),
        "invalid_auth" | "not_authed" | "token_revoked" | "token_expired"
        | "account_inactive" => ApiError::AuthInvalid(code.to_string()),
        other => ApiError::Upstream(other.to_string()),
    }
}

fn next_cursor(body: &Value) -> Option<String> {
    body["response_metadata"]["next_cursor"]
        .as_str()
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

// ============ Payload parsing ============

pub fn channel_from_json(value: &Value) -> Option<Channel> {
    let id = value["id"].as_str()?;
    Some(Channel {
        id: id.to_string(),
        name: value["name"].as_str().map(str::to_string),
        is_private: value["is_private"].as_bool().unwrap_or(false),
        topic: value["topic"]["value"].as_str().unwrap_or("").to_string(),
        purpose: value["purpose"]["value"].as_str().unwrap_or("").to_string(),
        is_im: value["is_im"].as_bool().unwrap_or(false),
        is_mpim: value["is_mpim"].as_bool().unwrap_or(false),
        user_id: value["user"].as_str().map(str::to_string),
        is_member: value["is_member"].as_bool().unwrap_or(false),
    })
}

pub fn user_from_json(value: &Value) -> Option<User> {
    let id = value["id"].as_str()?;
    let profile = &value["profile"];
    Some(User {
        id: id.to_string(),
        name: value["name"].as_str().unwrap_or("").to_string(),
        display_name: profile["display_name"].as_str().unwrap_or("").to_string(),
        real_name: profile["real_name"]
            .as_str()
            .or_else(|| value["real_name"].as_str())
            .unwrap_or("")
            .to_string(),
        is_bot: value["is_bot"].as_bool().unwrap_or(false),
        title: profile["title"].as_str().unwrap_or("").to_string(),
        email: profile["email"].as_str().map(str::to_string),
        tz: value["tz"].as_str().map(str::to_string),
        status_text: profile["status_text"].as_str().unwrap_or("").to_string(),
    })
}

/// Normalize one raw message payload. Returns `None` for entries without a
/// timestamp (which the source never sends for real messages).
pub fn message_from_json(channel_id: &str, value: &Value) -> Option<Message> {
    let ts = value["ts"].as_str()?;
    Some(Message {
        channel_id: channel_id.to_string(),
        ts: ts.to_string(),
        user_id: value["user"]
            .as_str()
            .or_else(|| value["bot_id"].as_str())
            .map(str::to_string),
        text: value["text"].as_str().unwrap_or("").to_string(),
        thread_ts: value["thread_ts"].as_str().map(str::to_string),
        reply_count: value["reply_count"].as_i64().unwrap_or(0),
        reactions_json: value
            .get("reactions")
            .filter(|r| !r.is_null())
            .map(|r| r.to_string()),
        attachments_json: value
            .get("attachments")
            .filter(|a| !a.is_null())
            .map(|a| a.to_string()),
        blocks_json: value
            .get("blocks")
            .filter(|b| !b.is_null())
            .map(|b| b.to_string()),
        permalink: value["permalink"].as_str().map(str::to_string),
        edited: !value["edited"].is_null(),
    })
}
