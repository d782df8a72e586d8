//! Read-side retrieval over the store.
//!
//! Deliberately thin: ranking is the index's BM25, and `ask` just widens each
//! distinct hit into its natural context — the whole thread when the hit
//! lives in one, a symmetric window of channel traffic otherwise. No
//! reranking, no synthesis; the output is raw material for whatever reads it.

use anyhow::Result;

use crate::models::{ContextBlock, Message, SearchHit};
use crate::store::{SearchFilters, Store};

pub struct QueryEngine {
    store: Store,
    final_limit: i64,
    context_window: i64,
}

impl QueryEngine {
    pub fn new(store: Store, final_limit: i64, context_window: i64) -> Self {
        Self {
            store,
            final_limit,
            context_window,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Ranked full-text hits, best first.
    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: Option<i64>,
    ) -> Result<Vec<SearchHit>> {
        self.store
            .search(query, filters, limit.unwrap_or(self.final_limit))
            .await
    }

    /// Search, then expand each distinct conversation into a context block.
    ///
    /// Hits that resolve to the same thread collapse into one block, so a
    /// query matching five replies of one discussion returns that discussion
    /// once. Blocks come back in rank order of their best hit.
    pub async fn ask(&self, query: &str, filters: &SearchFilters) -> Result<Vec<ContextBlock>> {
        let hits = self
            .store
            .search(query, filters, self.final_limit)
            .await?;

        let mut blocks = Vec::new();
        let mut covered: Vec<(String, String)> = Vec::new();

        for hit in hits {
            let anchor = hit.thread_ts.clone().unwrap_or_else(|| hit.ts.clone());
            let key = (hit.channel_id.clone(), anchor.clone());
            if covered.contains(&key) {
                continue;
            }
            covered.push(key);

            let block = if hit.thread_ts.is_some() {
                ContextBlock {
                    channel_id: hit.channel_id.clone(),
                    anchor_ts: anchor.clone(),
                    is_thread: true,
                    messages: self.store.thread(&hit.channel_id, &anchor).await?,
                }
            } else {
                ContextBlock {
                    channel_id: hit.channel_id.clone(),
                    anchor_ts: hit.ts.clone(),
                    is_thread: false,
                    messages: self
                        .store
                        .window(&hit.channel_id, &hit.ts, self.context_window)
                        .await?,
                }
            };
            blocks.push(block);
        }
        Ok(blocks)
    }

    /// Latest traffic, newest first.
    pub async fn recent(
        &self,
        channel_id: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<Message>> {
        self.store
            .recent(channel_id, limit.unwrap_or(self.final_limit))
            .await
    }

    /// One thread in full, oldest first.
    pub async fn thread(&self, channel_id: &str, thread_ts: &str) -> Result<Vec<Message>> {
        self.store.thread(channel_id, thread_ts).await
    }

    /// A window of channel traffic around one message, oldest first.
    ///
    /// A negative radius clamps to zero; passed straight through it would
    /// become an unlimited SQL LIMIT.
    pub async fn context(&self, channel_id: &str, ts: &str, radius: Option<i64>) -> Result<Vec<Message>> {
        let radius = radius.unwrap_or(self.context_window).max(0);
        self.store.window(channel_id, ts, radius).await
    }
}
