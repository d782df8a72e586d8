//! The single source of truth for all persisted state.
//!
//! Every producer — history importer, push listener, poller — mutates through
//! this type, and only this type touches the full-text index. The central
//! invariant: for every live message row there is exactly one index entry
//! whose content matches the row's current text and denormalized display
//! names. All message writes therefore pair the row mutation with the index
//! mutation inside one transaction, and batched page writes share a single
//! transaction so a crash mid-page cannot leave the two disagreeing.
//!
//! Cursor setters clamp to the maximum of the existing and candidate values;
//! a cursor only ever advances, even when a producer observes out-of-order
//! history (late thread replies, overlapping capture paths).
//!
//! Any failure here means the storage medium itself is unavailable, which is
//! fatal to the caller — there is no degraded mode without durable storage.

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::time::Duration;

use crate::models::{Channel, Message, SearchHit, User};

/// Handle to the persisted store. Cheap to clone; constructed once at
/// process start and passed by reference into every component.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

/// Filters applied to full-text search.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub channel_id: Option<String>,
    pub author_id: Option<String>,
    /// Lower timestamp bound in source format.
    pub since_ts: Option<String>,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ============ Channels and users ============

    pub async fn upsert_channel(&self, channel: &Channel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO channels (id, name, is_private, topic, purpose, is_im, is_mpim, user_id, is_member)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                is_private = excluded.is_private,
                topic = excluded.topic,
                purpose = excluded.purpose,
                is_im = excluded.is_im,
                is_mpim = excluded.is_mpim,
                user_id = excluded.user_id,
                is_member = excluded.is_member
            "#,
        )
        .bind(&channel.id)
        .bind(&channel.name)
        .bind(channel.is_private)
        .bind(&channel.topic)
        .bind(&channel.purpose)
        .bind(channel.is_im)
        .bind(channel.is_mpim)
        .bind(&channel.user_id)
        .bind(channel.is_member)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, name, display_name, real_name, is_bot, title, email, tz, status_text)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                display_name = excluded.display_name,
                real_name = excluded.real_name,
                is_bot = excluded.is_bot,
                title = excluded.title,
                email = excluded.email,
                tz = excluded.tz,
                status_text = excluded.status_text
            "#,
        )
        .bind(&user.id)
        .bind(&user.name)
        .bind(&user.display_name)
        .bind(&user.real_name)
        .bind(user.is_bot)
        .bind(&user.title)
        .bind(&user.email)
        .bind(&user.tz)
        .bind(&user.status_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn channels(&self) -> Result<Vec<Channel>> {
        let rows = sqlx::query("SELECT * FROM channels ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(channel_from_row).collect())
    }

    pub async fn channel(&self, id: &str) -> Result<Option<Channel>> {
        let row = sqlx::query("SELECT * FROM channels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(channel_from_row))
    }

    pub async fn user(&self, id: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    // ============ Messages ============

    /// Insert-or-replace a single message and rewrite its index entry, as one
    /// atomic unit.
    pub async fn upsert_message(&self, message: &Message) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_message(&mut tx, message).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Insert-or-replace one page of messages inside a single transaction.
    pub async fn upsert_message_page(&self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for message in messages {
            write_message(&mut tx, message).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Remove a message and its index entry.
    pub async fn delete_message(&self, channel_id: &str, ts: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE channel_id = ? AND ts = ?")
            .bind(channel_id)
            .bind(ts)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM messages_fts WHERE channel_id = ? AND ts = ?")
            .bind(channel_id)
            .bind(ts)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn message(&self, channel_id: &str, ts: &str) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE channel_id = ? AND ts = ?")
            .bind(channel_id)
            .bind(ts)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(message_from_row))
    }

    /// A thread parent and all of its replies, oldest first.
    pub async fn thread(&self, channel_id: &str, thread_ts: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE channel_id = ? AND (ts = ? OR thread_ts = ?)
            ORDER BY ts
            "#,
        )
        .bind(channel_id)
        .bind(thread_ts)
        .bind(thread_ts)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    /// A symmetric window of up to `radius` messages on each side of the
    /// anchor, anchor included, oldest first.
    pub async fn window(&self, channel_id: &str, ts: &str, radius: i64) -> Result<Vec<Message>> {
        let before = sqlx::query(
            "SELECT * FROM messages WHERE channel_id = ? AND ts < ? ORDER BY ts DESC LIMIT ?",
        )
        .bind(channel_id)
        .bind(ts)
        .bind(radius)
        .fetch_all(&self.pool)
        .await?;

        let at_and_after = sqlx::query(
            "SELECT * FROM messages WHERE channel_id = ? AND ts >= ? ORDER BY ts LIMIT ?",
        )
        .bind(channel_id)
        .bind(ts)
        .bind(radius + 1)
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<Message> = before.iter().rev().map(message_from_row).collect();
        messages.extend(at_and_after.iter().map(message_from_row));
        Ok(messages)
    }

    /// Most recent messages, newest first, optionally scoped to one channel.
    pub async fn recent(&self, channel_id: Option<&str>, limit: i64) -> Result<Vec<Message>> {
        let rows = match channel_id {
            Some(id) => {
                sqlx::query("SELECT * FROM messages WHERE channel_id = ? ORDER BY ts DESC LIMIT ?")
                    .bind(id)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM messages ORDER BY ts DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.iter().map(message_from_row).collect())
    }

    pub async fn message_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ============ Full-text search ============

    /// Ranked full-text matches over message text and denormalized names.
    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: i64,
    ) -> Result<Vec<SearchHit>> {
        let mut sql = String::from(
            r#"
            SELECT f.channel_id, f.ts, f.text, f.author_name, f.channel_name, f.rank,
                   snippet(messages_fts, 2, '>>>', '<<<', '...', 32) AS snippet,
                   m.thread_ts
            FROM messages_fts f
            JOIN messages m ON m.channel_id = f.channel_id AND m.ts = f.ts
            WHERE messages_fts MATCH ?
            "#,
        );
        if filters.channel_id.is_some() {
            sql.push_str(" AND f.channel_id = ?");
        }
        if filters.author_id.is_some() {
            sql.push_str(" AND m.user_id = ?");
        }
        if filters.since_ts.is_some() {
            sql.push_str(" AND f.ts >= ?");
        }
        sql.push_str(" ORDER BY rank LIMIT ?");

        let mut q = sqlx::query(&sql).bind(query);
        if let Some(ref channel_id) = filters.channel_id {
            q = q.bind(channel_id);
        }
        if let Some(ref author_id) = filters.author_id {
            q = q.bind(author_id);
        }
        if let Some(ref since_ts) = filters.since_ts {
            q = q.bind(since_ts);
        }
        let rows = q.bind(limit).fetch_all(&self.pool).await?;

        let hits = rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                SearchHit {
                    channel_id: row.get("channel_id"),
                    ts: row.get("ts"),
                    thread_ts: row.get("thread_ts"),
                    text: row.get("text"),
                    author_name: row.get("author_name"),
                    channel_name: row.get("channel_name"),
                    score: -rank, // negate so higher = better
                    snippet: row.get("snippet"),
                }
            })
            .collect();
        Ok(hits)
    }

    // ============ Cursors ============

    pub async fn import_cursor(&self, channel_id: &str) -> Result<Option<String>> {
        let ts: Option<String> =
            sqlx::query_scalar("SELECT ts FROM import_cursors WHERE channel_id = ?")
                .bind(channel_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(ts)
    }

    /// Advance the backfill high-water mark. The stored value only ever
    /// increases; passing an older timestamp is a no-op.
    pub async fn set_import_cursor(&self, channel_id: &str, ts: &str) -> Result<()> {
        set_cursor(&self.pool, "import_cursors", channel_id, ts).await
    }

    pub async fn poll_cursor(&self, channel_id: &str) -> Result<Option<String>> {
        let ts: Option<String> =
            sqlx::query_scalar("SELECT ts FROM poll_cursors WHERE channel_id = ?")
                .bind(channel_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(ts)
    }

    pub async fn set_poll_cursor(&self, channel_id: &str, ts: &str) -> Result<()> {
        set_cursor(&self.pool, "poll_cursors", channel_id, ts).await
    }

    // ============ Metadata TTL gate ============

    /// Whether `kind` for this channel was synced within `ttl`.
    pub async fn is_metadata_fresh(
        &self,
        channel_id: &str,
        kind: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let synced_at: Option<i64> = sqlx::query_scalar(
            "SELECT synced_at FROM metadata_cursors WHERE channel_id = ? AND kind = ?",
        )
        .bind(channel_id)
        .bind(kind)
        .fetch_optional(&self.pool)
        .await?;

        let Some(synced_at) = synced_at else {
            return Ok(false);
        };
        let age = Utc::now().timestamp().saturating_sub(synced_at);
        Ok(age >= 0 && (age as u64) < ttl.as_secs())
    }

    pub async fn touch_metadata(&self, channel_id: &str, kind: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata_cursors (channel_id, kind, synced_at) VALUES (?, ?, ?)
            ON CONFLICT(channel_id, kind) DO UPDATE SET synced_at = excluded.synced_at
            "#,
        )
        .bind(channel_id)
        .bind(kind)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ============ Workspace and channel metadata ============

    /// Replace the stored set for one workspace-scoped metadata kind.
    pub async fn replace_workspace_meta(
        &self,
        kind: &str,
        items: &[(String, serde_json::Value)],
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM workspace_meta WHERE kind = ?")
            .bind(kind)
            .execute(&mut *tx)
            .await?;
        for (id, payload) in items {
            sqlx::query("INSERT INTO workspace_meta (kind, id, payload, synced_at) VALUES (?, ?, ?, ?)")
                .bind(kind)
                .bind(id)
                .bind(payload.to_string())
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Replace the stored set for one per-channel metadata kind.
    pub async fn replace_channel_meta(
        &self,
        channel_id: &str,
        kind: &str,
        items: &[(String, serde_json::Value)],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM channel_meta WHERE channel_id = ? AND kind = ?")
            .bind(channel_id)
            .bind(kind)
            .execute(&mut *tx)
            .await?;
        for (id, payload) in items {
            sqlx::query("INSERT INTO channel_meta (channel_id, kind, id, payload) VALUES (?, ?, ?, ?)")
                .bind(channel_id)
                .bind(kind)
                .bind(id)
                .bind(payload.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Write one message row and its paired index entry inside the caller's
/// transaction. Display names are denormalized into the index at write time
/// so ranked search never needs a join against users/channels.
async fn write_message(tx: &mut Transaction<'_, Sqlite>, message: &Message) -> Result<()> {
    let author_name: Option<String> = match &message.user_id {
        Some(user_id) => {
            sqlx::query_scalar(
                r#"
                SELECT COALESCE(NULLIF(display_name, ''), NULLIF(real_name, ''), name)
                FROM users WHERE id = ?
                "#,
            )
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await?
        }
        None => None,
    };
    let channel_name: Option<String> =
        sqlx::query_scalar("SELECT name FROM channels WHERE id = ?")
            .bind(&message.channel_id)
            .fetch_optional(&mut **tx)
            .await?
            .flatten();

    sqlx::query(
        r#"
        INSERT INTO messages (channel_id, ts, user_id, text, thread_ts, reply_count,
                              reactions_json, attachments_json, blocks_json, permalink, edited)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(channel_id, ts) DO UPDATE SET
            user_id = excluded.user_id,
            text = excluded.text,
            thread_ts = excluded.thread_ts,
            reply_count = excluded.reply_count,
            reactions_json = excluded.reactions_json,
            attachments_json = excluded.attachments_json,
            blocks_json = excluded.blocks_json,
            permalink = excluded.permalink,
            edited = excluded.edited
        "#,
    )
    .bind(&message.channel_id)
    .bind(&message.ts)
    .bind(&message.user_id)
    .bind(&message.text)
    .bind(&message.thread_ts)
    .bind(message.reply_count)
    .bind(&message.reactions_json)
    .bind(&message.attachments_json)
    .bind(&message.blocks_json)
    .bind(&message.permalink)
    .bind(message.edited)
    .execute(&mut **tx)
    .await?;

    // Rewrite, never duplicate: on replace the old index entry goes away in
    // the same transaction that writes the new one.
    sqlx::query("DELETE FROM messages_fts WHERE channel_id = ? AND ts = ?")
        .bind(&message.channel_id)
        .bind(&message.ts)
        .execute(&mut **tx)
        .await?;
    sqlx::query(
        "INSERT INTO messages_fts (channel_id, ts, text, author_name, channel_name) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&message.channel_id)
    .bind(&message.ts)
    .bind(&message.text)
    .bind(author_name.unwrap_or_default())
    .bind(channel_name.unwrap_or_default())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Max-with-existing cursor update. `MAX` on TEXT is lexicographic, which
/// matches timestamp order for the source's fixed-width decimal format.
async fn set_cursor(pool: &SqlitePool, table: &str, channel_id: &str, ts: &str) -> Result<()> {
    let sql = format!(
        r#"
        INSERT INTO {table} (channel_id, ts, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(channel_id) DO UPDATE SET
            ts = MAX({table}.ts, excluded.ts),
            updated_at = excluded.updated_at
        "#
    );
    sqlx::query(&sql)
        .bind(channel_id)
        .bind(ts)
        .bind(Utc::now().timestamp())
        .execute(pool)
        .await?;
    Ok(())
}

fn channel_from_row(row: &SqliteRow) -> Channel {
    Channel {
        id: row.get("id"),
        name: row.get("name"),
        is_private: row.get("is_private"),
        topic: row.get("topic"),
        purpose: row.get("purpose"),
        is_im: row.get("is_im"),
        is_mpim: row.get("is_mpim"),
        user_id: row.get("user_id"),
        is_member: row.get("is_member"),
    }
}

fn user_from_row(row: &SqliteRow) -> User {
    User {
        id: row.get("id"),
        name: row.get("name"),
        display_name: row.get("display_name"),
        real_name: row.get("real_name"),
        is_bot: row.get("is_bot"),
        title: row.get("title"),
        email: row.get("email"),
        tz: row.get("tz"),
        status_text: row.get("status_text"),
    }
}

fn message_from_row(row: &SqliteRow) -> Message {
    Message {
        channel_id: row.get("channel_id"),
        ts: row.get("ts"),
        user_id: row.get("user_id"),
        text: row.get("text"),
        thread_ts: row.get("thread_ts"),
        reply_count: row.get("reply_count"),
        reactions_json: row.get("reactions_json"),
        attachments_json: row.get("attachments_json"),
        blocks_json: row.get("blocks_json"),
        permalink: row.get("permalink"),
        edited: row.get("edited"),
    }
}
