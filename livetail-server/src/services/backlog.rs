//! Backlog fetcher: bounded, newest-first pages of historical records.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::models::{ConversationSummary, LogRecord, PageRequest, TailFilter, TailRecord};
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum BacklogError {
    #[error("backlog query failed: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("backlog source unavailable: {0}")]
    Unavailable(String),
}

/// One page of historical records, newest first, plus the matching total.
#[derive(Debug, Clone, PartialEq)]
pub struct BacklogPage<R> {
    pub records: Vec<R>,
    pub total: u64,
}

impl<R> BacklogPage<R> {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            total: 0,
        }
    }
}

/// Storage collaborator answering filtered, paginated history queries.
#[async_trait]
pub trait BacklogSource<R>: Send + Sync {
    /// Records matching `filter`, newest first, skipping `skip` and returning at
    /// most `limit`. `limit == 0` only counts.
    async fn query(
        &self,
        filter: &TailFilter,
        skip: u64,
        limit: u64,
    ) -> Result<BacklogPage<R>, BacklogError>;
}

/// Point lookup used by change sources whose notifications carry only an id.
#[async_trait]
pub trait RecordLookup<R>: Send + Sync {
    async fn find(&self, id: &str) -> Result<Option<R>, BacklogError>;
}

/// Stateless wrapper turning a page request into one (or, for snapshots, two)
/// source queries.
pub struct BacklogFetcher<R> {
    source: Arc<dyn BacklogSource<R>>,
    max_snapshot_records: u32,
}

impl<R> Clone for BacklogFetcher<R> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            max_snapshot_records: self.max_snapshot_records,
        }
    }
}

impl<R> std::fmt::Debug for BacklogFetcher<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BacklogFetcher")
            .field("max_snapshot_records", &self.max_snapshot_records)
            .finish_non_exhaustive()
    }
}

impl<R: TailRecord> BacklogFetcher<R> {
    pub fn new(source: Arc<dyn BacklogSource<R>>, max_snapshot_records: u32) -> Self {
        Self {
            source,
            max_snapshot_records,
        }
    }

    /// Fetch the page window. In snapshot mode the whole matching set is
    /// requested, bounded by the total counted at call time.
    #[instrument(skip(self), fields(kind = R::KIND.as_str()))]
    pub async fn fetch(
        &self,
        filter: &TailFilter,
        page: PageRequest,
    ) -> Result<BacklogPage<R>, BacklogError> {
        if !page.all {
            return self
                .source
                .query(filter, page.skip(), u64::from(page.limit))
                .await;
        }

        let probe = self.source.query(filter, 0, 0).await?;
        let limit = probe.total.min(u64::from(self.max_snapshot_records));
        debug!(total = probe.total, limit, "fetching backlog snapshot");
        if limit == 0 {
            return Ok(BacklogPage {
                records: Vec::new(),
                total: probe.total,
            });
        }

        let mut snapshot = self.source.query(filter, 0, limit).await?;
        snapshot.records.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(snapshot)
    }
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

/// Appends `WHERE ...` for the session filter: optional scope equality plus an
/// OR of case-insensitive `ILIKE` matches over `search_columns`.
pub(crate) fn push_filter_predicate(
    builder: &mut QueryBuilder<'_, Postgres>,
    filter: &TailFilter,
    search_columns: &[&str],
    scope_column: Option<&str>,
) {
    builder.push(" WHERE TRUE");

    if let (Some(column), Some(scope)) = (scope_column, filter.conversation_id()) {
        builder
            .push(" AND ")
            .push(column)
            .push(" = ")
            .push_bind(scope.to_string());
    }

    if let Some(term) = filter.search() {
        let pattern = escape_like(term);
        builder.push(" AND (");
        let mut alternatives = builder.separated(" OR ");
        for column in search_columns {
            alternatives.push(format!("{column} ILIKE "));
            alternatives.push_bind_unseparated(pattern.clone());
        }
        builder.push(")");
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

#[derive(Debug, sqlx::FromRow)]
struct LogRow {
    id: i64,
    timestamp: DateTime<Utc>,
    level: String,
    message: String,
    meta: Option<Value>,
}

impl From<LogRow> for LogRecord {
    fn from(row: LogRow) -> Self {
        Self {
            id: row.id.to_string(),
            timestamp: row.timestamp,
            level: row.level,
            message: row.message,
            meta: row.meta.unwrap_or(Value::Null),
        }
    }
}

const LOG_COLUMNS: &str = "SELECT id, timestamp, level, message, meta FROM livetail.logs";
const LOG_SEARCH_COLUMNS: &[&str] = &["message", "level", "meta::text"];

/// Application logs stored in `livetail.logs`.
#[derive(Clone, Debug)]
pub struct PgLogStore {
    pool: PgPool,
}

impl PgLogStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BacklogSource<LogRecord> for PgLogStore {
    async fn query(
        &self,
        filter: &TailFilter,
        skip: u64,
        limit: u64,
    ) -> Result<BacklogPage<LogRecord>, BacklogError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM livetail.logs");
        push_filter_predicate(&mut count, filter, LOG_SEARCH_COLUMNS, None);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        if limit == 0 {
            return Ok(BacklogPage {
                records: Vec::new(),
                total: to_u64(total),
            });
        }

        let mut rows = QueryBuilder::<Postgres>::new(LOG_COLUMNS);
        push_filter_predicate(&mut rows, filter, LOG_SEARCH_COLUMNS, None);
        rows.push(" ORDER BY timestamp DESC, id DESC OFFSET ")
            .push_bind(to_i64(skip))
            .push(" LIMIT ")
            .push_bind(to_i64(limit));

        let records = rows
            .build_query_as::<LogRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(LogRecord::from)
            .collect();

        Ok(BacklogPage {
            records,
            total: to_u64(total),
        })
    }
}

#[async_trait]
impl RecordLookup<LogRecord> for PgLogStore {
    async fn find(&self, id: &str) -> Result<Option<LogRecord>, BacklogError> {
        let Ok(id) = id.parse::<i64>() else {
            return Ok(None);
        };
        let row = sqlx::query_as::<_, LogRow>(&format!("{LOG_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(LogRecord::from))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ConversationRow {
    conversation_id: String,
    title: String,
    user_name: String,
    endpoint: Option<String>,
    model: Option<String>,
    message_count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ConversationRow> for ConversationSummary {
    fn from(row: ConversationRow) -> Self {
        Self {
            id: row.conversation_id,
            title: row.title,
            user: row.user_name,
            endpoint: row.endpoint,
            model: row.model,
            message_count: row.message_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const CONVERSATION_COLUMNS: &str = "SELECT conversation_id, title, user_name, endpoint, model, \
     message_count, created_at, updated_at FROM livetail.conversations";
const CONVERSATION_SEARCH_COLUMNS: &[&str] = &[
    "title",
    "user_name",
    "conversation_id",
    "COALESCE(endpoint, '')",
    "COALESCE(model, '')",
];

/// Conversation summaries stored in `livetail.conversations`.
#[derive(Clone, Debug)]
pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BacklogSource<ConversationSummary> for PgConversationStore {
    async fn query(
        &self,
        filter: &TailFilter,
        skip: u64,
        limit: u64,
    ) -> Result<BacklogPage<ConversationSummary>, BacklogError> {
        let mut count =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM livetail.conversations");
        push_filter_predicate(
            &mut count,
            filter,
            CONVERSATION_SEARCH_COLUMNS,
            Some("conversation_id"),
        );
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        if limit == 0 {
            return Ok(BacklogPage {
                records: Vec::new(),
                total: to_u64(total),
            });
        }

        let mut rows = QueryBuilder::<Postgres>::new(CONVERSATION_COLUMNS);
        push_filter_predicate(
            &mut rows,
            filter,
            CONVERSATION_SEARCH_COLUMNS,
            Some("conversation_id"),
        );
        rows.push(" ORDER BY updated_at DESC, conversation_id DESC OFFSET ")
            .push_bind(to_i64(skip))
            .push(" LIMIT ")
            .push_bind(to_i64(limit));

        let records = rows
            .build_query_as::<ConversationRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(ConversationSummary::from)
            .collect();

        Ok(BacklogPage {
            records,
            total: to_u64(total),
        })
    }
}

#[async_trait]
impl RecordLookup<ConversationSummary> for PgConversationStore {
    async fn find(&self, id: &str) -> Result<Option<ConversationSummary>, BacklogError> {
        let row = sqlx::query_as::<_, ConversationRow>(&format!(
            "{CONVERSATION_COLUMNS} WHERE conversation_id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ConversationSummary::from))
    }
}
