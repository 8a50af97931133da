/// History pager: backward cursor pagination, search, jump-to-message
///
/// Pages come from the paginated query API, not the live channel, and are
/// spliced into the synchronizer's list without duplicating anything the
/// live tail already holds.
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::model::{Message, PaginationCursor};
use crate::sync::MessageSynchronizer;
use crate::transport::{HistoryBackend, HistoryPage};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

struct PagerInner {
    /// Continuation for the next older page
    next_cursor: Option<PaginationCursor>,
    has_more: bool,
    /// Whether any page has been loaded yet
    loaded_any: bool,
    closed: bool,
}

/// Jump-to-message result: the target plus its surrounding page
#[derive(Debug, Clone)]
pub struct JumpResult {
    pub message: Message,
    pub surrounding: HistoryPage,
}

#[derive(Clone)]
pub struct HistoryPager {
    conversation_id: String,
    config: SyncConfig,
    backend: Arc<dyn HistoryBackend>,
    sync: MessageSynchronizer,
    /// Session start; messages at or after this bound belong to the live tail
    live_floor_ms: i64,
    inner: Arc<RwLock<PagerInner>>,
}

impl HistoryPager {
    pub fn new(
        conversation_id: &str,
        config: SyncConfig,
        backend: Arc<dyn HistoryBackend>,
        sync: MessageSynchronizer,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            config,
            backend,
            sync,
            live_floor_ms: chrono::Utc::now().timestamp_millis(),
            inner: Arc::new(RwLock::new(PagerInner {
                next_cursor: None,
                has_more: true,
                loaded_any: false,
                closed: false,
            })),
        }
    }

    /// Reject further fetches; part of room teardown
    pub async fn close(&self) {
        self.inner.write().await.closed = true;
    }

    /// Fetch the next older page. With an explicit cursor, replays that
    /// page (at-least-once-safe); without one, continues backward from
    /// where the last call left off, starting at the live tail.
    pub async fn load_older(&self, cursor: Option<PaginationCursor>) -> Result<HistoryPage> {
        let effective = {
            let inner = self.inner.read().await;
            if inner.closed {
                return Err(SyncError::Closed("room session closed".to_string()));
            }
            match &cursor {
                Some(c) => Some(c.clone()),
                None => {
                    if inner.loaded_any && !inner.has_more {
                        return Ok(HistoryPage {
                            messages: Vec::new(),
                            next_cursor: None,
                            has_more: false,
                        });
                    }
                    inner.next_cursor.clone()
                }
            }
        };

        let page = self
            .backend
            .history(
                &self.conversation_id,
                effective.as_ref(),
                self.config.page_size,
            )
            .await?;

        // Splice into the live list; the merge deduplicates by id, then
        // client_id, so replayed cursors never double-render
        let inserted = self.sync.merge_history(page.messages.clone()).await;
        debug!(
            conversation = %self.conversation_id,
            fetched = page.messages.len(),
            inserted,
            "loaded history page"
        );

        {
            let mut inner = self.inner.write().await;
            if inner.closed {
                return Err(SyncError::Closed("room session closed".to_string()));
            }
            // Only advance the walk when the caller is walking, not replaying
            if cursor.is_none() {
                inner.next_cursor = page.next_cursor.clone();
                inner.has_more = page.has_more;
                inner.loaded_any = true;
            }
        }

        Ok(page)
    }

    /// Finite, restartable search over historical messages
    pub async fn search(&self, query: &str) -> Result<SearchResults> {
        if self.inner.read().await.closed {
            return Err(SyncError::Closed("room session closed".to_string()));
        }
        let matches = self.backend.search(&self.conversation_id, query).await?;
        Ok(SearchResults {
            conversation_id: self.conversation_id.clone(),
            query: query.to_string(),
            backend: Arc::clone(&self.backend),
            matches,
        })
    }

    /// Jump to a message. If it is already loaded, the surrounding page
    /// comes from the local list. Otherwise the page is fetched directly and
    /// previously loaded history is discarded rather than stitched to it;
    /// gap-filling stays explicit.
    pub async fn jump_to(&self, message_id: &str) -> Result<JumpResult> {
        if self.inner.read().await.closed {
            return Err(SyncError::Closed("room session closed".to_string()));
        }

        if let Some(message) = self.sync.get(message_id).await {
            let all = self.sync.messages().await;
            let pos = all
                .iter()
                .position(|m| m.client_id == message.client_id)
                .unwrap_or(0);
            let half = self.config.page_size / 2;
            let start = pos.saturating_sub(half);
            let end = (pos + half + 1).min(all.len());
            return Ok(JumpResult {
                message,
                surrounding: HistoryPage {
                    messages: all[start..end].to_vec(),
                    next_cursor: None,
                    has_more: start > 0,
                },
            });
        }

        let page = self
            .backend
            .around(&self.conversation_id, message_id, self.config.page_size)
            .await?;
        let message = page
            .messages
            .iter()
            .find(|m| m.matches(message_id))
            .cloned()
            .ok_or_else(|| {
                SyncError::Protocol(format!("jump target missing from fetched page: {}", message_id))
            })?;

        // Drop loaded history so the gap between the jumped-to page and the
        // live tail is visible as absent, not silently bridged
        self.sync.discard_older_than(self.live_floor_ms).await;
        self.sync.merge_history(page.messages.clone()).await;
        {
            let mut inner = self.inner.write().await;
            inner.next_cursor = page.next_cursor.clone();
            inner.has_more = page.has_more;
            inner.loaded_any = true;
        }

        Ok(JumpResult {
            message,
            surrounding: page,
        })
    }
}

/// Materialized, restartable search match list
pub struct SearchResults {
    conversation_id: String,
    query: String,
    backend: Arc<dyn HistoryBackend>,
    matches: Vec<Message>,
}

impl SearchResults {
    pub fn matches(&self) -> &[Message] {
        &self.matches
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.matches.iter()
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Re-run the query against the backend
    pub async fn restart(&mut self) -> Result<()> {
        self.matches = self
            .backend
            .search(&self.conversation_id, &self.query)
            .await?;
        Ok(())
    }
}
