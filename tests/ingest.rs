//! Ingestion behavior against a scripted upstream: backfill paging, cursor
//! resume, rate-limit retry, failure containment, and poller cold start.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use chat_harness::api::{ApiError, ApiResult, ChatApi, Page};
use chat_harness::config::LimitsConfig;
use chat_harness::db;
use chat_harness::importer::HistoryImporter;
use chat_harness::limiter::RateLimiter;
use chat_harness::migrate::run_migrations;
use chat_harness::models::{Channel, Message, User};
use chat_harness::notify::Notifier;
use chat_harness::poller::Poller;
use chat_harness::stop::StopFlag;
use chat_harness::store::Store;

// ============ Scripted upstream ============

#[derive(Default)]
struct FakeApi {
    channels: Vec<Channel>,
    users: Vec<User>,
    /// Queued history responses per channel, popped per call.
    history: Mutex<HashMap<String, VecDeque<ApiResult<Page<Message>>>>>,
    /// `(channel_id, oldest)` for every history call, in order.
    history_calls: Mutex<Vec<(String, Option<String>)>>,
    history_count: AtomicUsize,
}

impl FakeApi {
    fn queue_history(&self, channel_id: &str, response: ApiResult<Page<Message>>) {
        self.history
            .lock()
            .unwrap()
            .entry(channel_id.to_string())
            .or_default()
            .push_back(response);
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn list_channels(&self, _cursor: Option<&str>) -> ApiResult<Page<Channel>> {
        Ok(Page::last(self.channels.clone()))
    }

    async fn list_users(&self, _cursor: Option<&str>) -> ApiResult<Page<User>> {
        Ok(Page::last(self.users.clone()))
    }

    async fn history(
        &self,
        channel_id: &str,
        oldest: Option<&str>,
        _cursor: Option<&str>,
    ) -> ApiResult<Page<Message>> {
        self.history_count.fetch_add(1, Ordering::SeqCst);
        self.history_calls
            .lock()
            .unwrap()
            .push((channel_id.to_string(), oldest.map(str::to_string)));
        self.history
            .lock()
            .unwrap()
            .get_mut(channel_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(Page::last(Vec::new())))
    }

    async fn replies(
        &self,
        _channel_id: &str,
        _thread_ts: &str,
        _oldest: Option<&str>,
        _cursor: Option<&str>,
    ) -> ApiResult<Page<Message>> {
        Ok(Page::last(Vec::new()))
    }

    async fn message_at(&self, _channel_id: &str, _ts: &str) -> ApiResult<Option<Message>> {
        Ok(None)
    }

    async fn user_info(&self, user_id: &str) -> ApiResult<User> {
        Err(ApiError::Upstream(format!("no such user {}", user_id)))
    }

    async fn join_channel(&self, _channel_id: &str) -> ApiResult<()> {
        Ok(())
    }

    async fn list_emoji(&self) -> ApiResult<Vec<(String, Value)>> {
        Ok(Vec::new())
    }
    async fn list_usergroups(&self) -> ApiResult<Vec<(String, Value)>> {
        Ok(Vec::new())
    }
    async fn list_files(&self) -> ApiResult<Vec<(String, Value)>> {
        Ok(Vec::new())
    }
    async fn list_stars(&self) -> ApiResult<Vec<(String, Value)>> {
        Ok(Vec::new())
    }
    async fn list_pins(&self, _channel_id: &str) -> ApiResult<Vec<(String, Value)>> {
        Ok(Vec::new())
    }
    async fn list_bookmarks(&self, _channel_id: &str) -> ApiResult<Vec<(String, Value)>> {
        Ok(Vec::new())
    }

    async fn connect_url(&self) -> ApiResult<String> {
        Err(ApiError::Upstream("no socket in tests".to_string()))
    }
}

// ============ Helpers ============

fn channel(id: &str) -> Channel {
    Channel {
        id: id.to_string(),
        name: Some(format!("chan-{}", id.to_lowercase())),
        is_member: true,
        ..Default::default()
    }
}

fn page(channel_id: &str, start: usize, len: usize, next: Option<&str>) -> Page<Message> {
    let items = (start..start + len)
        .map(|i| Message {
            channel_id: channel_id.to_string(),
            ts: format!("1700000000.{:06}", i),
            user_id: Some("U1".to_string()),
            text: format!("message {}", i),
            ..Default::default()
        })
        .collect();
    Page {
        items,
        next_cursor: next.map(str::to_string),
    }
}

async fn open_store(dir: &TempDir) -> Store {
    let pool = db::connect(&dir.path().join("test.sqlite")).await.unwrap();
    run_migrations(&pool).await.unwrap();
    Store::new(pool)
}

fn importer(api: Arc<FakeApi>, store: &Store, stop: StopFlag) -> HistoryImporter {
    let limiter = Arc::new(RateLimiter::new(Duration::from_millis(10)));
    HistoryImporter::new(api, store.clone(), limiter, LimitsConfig::default(), stop)
}

// ============ Importer ============

#[tokio::test]
async fn test_backfill_pages_through_history() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let api = Arc::new(FakeApi {
        channels: vec![channel("C1")],
        ..Default::default()
    });
    api.queue_history("C1", Ok(page("C1", 0, 200, Some("p2"))));
    api.queue_history("C1", Ok(page("C1", 200, 200, Some("p3"))));
    api.queue_history("C1", Ok(page("C1", 400, 50, None)));

    let report = importer(api.clone(), &store, StopFlag::new())
        .run()
        .await
        .unwrap();

    assert_eq!(report.channels_backfilled, 1);
    assert_eq!(report.messages_stored, 450);
    assert_eq!(store.message_count().await.unwrap(), 450);
    assert_eq!(
        store.import_cursor("C1").await.unwrap().as_deref(),
        Some("1700000000.000449")
    );
    // Fresh channel: the first history call carries no lower bound.
    let calls = api.history_calls.lock().unwrap();
    assert_eq!(calls[0], ("C1".to_string(), None));
}

#[tokio::test]
async fn test_resumed_channel_fetches_from_cursor() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    store
        .set_import_cursor("C1", "1700000000.000449")
        .await
        .unwrap();

    let api = Arc::new(FakeApi {
        channels: vec![channel("C1")],
        ..Default::default()
    });
    api.queue_history("C1", Ok(page("C1", 450, 3, None)));

    let report = importer(api.clone(), &store, StopFlag::new())
        .run()
        .await
        .unwrap();

    assert_eq!(report.channels_incremental, 1);
    assert_eq!(report.channels_backfilled, 0);
    assert_eq!(report.messages_stored, 3);

    let calls = api.history_calls.lock().unwrap();
    assert_eq!(
        calls[0],
        ("C1".to_string(), Some("1700000000.000449".to_string()))
    );
    drop(calls);
    assert_eq!(
        store.import_cursor("C1").await.unwrap().as_deref(),
        Some("1700000000.000452")
    );
}

#[tokio::test]
async fn test_rate_limited_page_is_retried_in_place() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let api = Arc::new(FakeApi {
        channels: vec![channel("C1")],
        ..Default::default()
    });
    api.queue_history(
        "C1",
        Err(ApiError::RateLimited {
            retry_after: Duration::from_secs(30),
        }),
    );
    api.queue_history("C1", Ok(page("C1", 0, 5, None)));

    let report = importer(api.clone(), &store, StopFlag::new())
        .run()
        .await
        .unwrap();

    assert_eq!(report.messages_stored, 5);
    assert_eq!(report.channels_abandoned, 0);
    assert_eq!(api.history_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_transient_failure_abandons_channel_but_keeps_progress() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let api = Arc::new(FakeApi {
        channels: vec![channel("C1"), channel("C2")],
        ..Default::default()
    });
    api.queue_history("C1", Ok(page("C1", 0, 200, Some("p2"))));
    api.queue_history("C1", Err(ApiError::Transient("connection reset".to_string())));
    api.queue_history("C2", Ok(page("C2", 0, 10, None)));

    let report = importer(api.clone(), &store, StopFlag::new())
        .run()
        .await
        .unwrap();

    // C1 is abandoned for this run, but its first page is durable and the
    // cursor reflects it, so the next run resumes after message 199.
    assert_eq!(report.channels_abandoned, 1);
    assert_eq!(report.messages_stored, 210);
    assert_eq!(
        store.import_cursor("C1").await.unwrap().as_deref(),
        Some("1700000000.000199")
    );
    // The sibling channel completed normally.
    assert_eq!(
        store.import_cursor("C2").await.unwrap().as_deref(),
        Some("1700000000.000009")
    );
}

#[tokio::test]
async fn test_rejected_credential_aborts_the_run() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let api = Arc::new(FakeApi {
        channels: vec![channel("C1")],
        ..Default::default()
    });
    api.queue_history("C1", Err(ApiError::AuthInvalid("token_revoked".to_string())));

    let result = importer(api, &store, StopFlag::new()).run().await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let api = Arc::new(FakeApi {
        channels: vec![channel("C1")],
        ..Default::default()
    });
    // Both runs serve overlapping messages; the store must not duplicate.
    api.queue_history("C1", Ok(page("C1", 0, 50, None)));
    api.queue_history("C1", Ok(page("C1", 25, 50, None)));

    let imp = importer(api, &store, StopFlag::new());
    imp.run().await.unwrap();
    imp.run().await.unwrap();

    assert_eq!(store.message_count().await.unwrap(), 75);
}

// ============ Poller ============

fn poller(api: Arc<FakeApi>, store: &Store, notifier: Notifier, stop: StopFlag) -> Poller {
    let limiter = Arc::new(RateLimiter::new(Duration::from_millis(10)));
    Poller::new(
        api,
        store.clone(),
        limiter,
        notifier,
        LimitsConfig::default(),
        stop,
    )
}

/// Raise the flag partway into the first inter-cycle sleep so exactly one
/// polling cycle runs.
fn stop_after(duration: Duration) -> StopFlag {
    let stop = StopFlag::new();
    let flag = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        flag.stop();
    });
    stop
}

#[tokio::test]
async fn test_cold_start_anchors_at_now_without_fetching() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let api = Arc::new(FakeApi {
        channels: vec![channel("C1")],
        ..Default::default()
    });

    let stop = stop_after(Duration::from_secs(30));
    poller(api.clone(), &store, Notifier::new(), stop)
        .run()
        .await
        .unwrap();

    // Never-polled channel: no history fetched, cursor anchored at now.
    assert_eq!(api.history_count.load(Ordering::SeqCst), 0);
    assert_eq!(store.message_count().await.unwrap(), 0);
    assert!(store.poll_cursor("C1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_poll_stores_and_publishes_new_messages() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    store
        .set_poll_cursor("C1", "1700000000.000100")
        .await
        .unwrap();

    let api = Arc::new(FakeApi {
        channels: vec![channel("C1")],
        ..Default::default()
    });
    api.queue_history("C1", Ok(page("C1", 101, 2, None)));

    let notifier = Notifier::new();
    let mut events = notifier.subscribe();

    let stop = stop_after(Duration::from_secs(30));
    poller(api.clone(), &store, notifier, stop).run().await.unwrap();

    assert_eq!(store.message_count().await.unwrap(), 2);
    assert_eq!(
        store.poll_cursor("C1").await.unwrap().as_deref(),
        Some("1700000000.000102")
    );
    // The poll call was bounded below by the stored cursor.
    let calls = api.history_calls.lock().unwrap();
    assert_eq!(
        calls[0],
        ("C1".to_string(), Some("1700000000.000100".to_string()))
    );
    drop(calls);

    assert_eq!(events.recv().await.unwrap().ts, "1700000000.000101");
    assert_eq!(events.recv().await.unwrap().ts, "1700000000.000102");
}
