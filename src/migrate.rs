use anyhow::Result;
use sqlx::SqlitePool;

/// Create all tables and indexes. Idempotent — safe to run on every start.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            id TEXT PRIMARY KEY,
            name TEXT,
            is_private INTEGER NOT NULL DEFAULT 0,
            topic TEXT NOT NULL DEFAULT '',
            purpose TEXT NOT NULL DEFAULT '',
            is_im INTEGER NOT NULL DEFAULT 0,
            is_mpim INTEGER NOT NULL DEFAULT 0,
            user_id TEXT,
            is_member INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            display_name TEXT NOT NULL DEFAULT '',
            real_name TEXT NOT NULL DEFAULT '',
            is_bot INTEGER NOT NULL DEFAULT 0,
            title TEXT NOT NULL DEFAULT '',
            email TEXT,
            tz TEXT,
            status_text TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Composite natural key: ts is the source's decimal timestamp string,
    // unique within a channel and lexicographically ordered.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            channel_id TEXT NOT NULL,
            ts TEXT NOT NULL,
            user_id TEXT,
            text TEXT NOT NULL,
            thread_ts TEXT,
            reply_count INTEGER NOT NULL DEFAULT 0,
            reactions_json TEXT,
            attachments_json TEXT,
            blocks_json TEXT,
            permalink TEXT,
            edited INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (channel_id, ts)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_cursors (
            channel_id TEXT PRIMARY KEY,
            ts TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS poll_cursors (
            channel_id TEXT PRIMARY KEY,
            ts TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS metadata_cursors (
            channel_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            synced_at INTEGER NOT NULL,
            PRIMARY KEY (channel_id, kind)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Best-effort workspace-scoped metadata (emoji, usergroups, files, stars).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workspace_meta (
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            payload TEXT NOT NULL,
            synced_at INTEGER NOT NULL,
            PRIMARY KEY (kind, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-channel metadata (pins, bookmarks), refreshed behind a TTL gate.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS channel_meta (
            channel_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            payload TEXT NOT NULL,
            PRIMARY KEY (channel_id, kind, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 virtual table over message text with denormalized display names.
    // FTS5 CREATE is not idempotent natively, so we check first.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='messages_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE messages_fts USING fts5(
                channel_id UNINDEXED,
                ts UNINDEXED,
                text,
                author_name,
                channel_name
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(channel_id, thread_ts)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_user ON messages(user_id)")
        .execute(pool)
        .await?;

    Ok(())
}
