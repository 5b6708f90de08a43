//! Typed data-store boundary for BoardPulse.
//!
//! The pipeline and engines never build queries ad hoc: reads go through
//! [`PostingFilter`], writes through the natural-key upsert methods on
//! [`Store`]. `MemoryStore` backs tests and demo runs; `PgStore` is the
//! Postgres implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use boardpulse_core::{
    BoardCategory, Grade, JobBoard, JobKind, JobPosting, JobStatus, PipelineJob,
    PipelineRunResult, RoleFamily, RunStatus, ScoreBreakdown, ScoredBoard, TrendSnapshot,
};

pub const CRATE_NAME: &str = "boardpulse-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Optional filters applied to posting reads, in a fixed documented order:
/// board, role family, company, seen-since, seen-until, disappeared,
/// unnormalized-only.
#[derive(Debug, Clone, Default)]
pub struct PostingFilter {
    pub board_id: Option<Uuid>,
    pub role_family: Option<RoleFamily>,
    pub company: Option<String>,
    pub seen_since: Option<DateTime<Utc>>,
    pub seen_until: Option<DateTime<Utc>>,
    pub disappeared: Option<bool>,
    pub unnormalized_only: bool,
}

impl PostingFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn board(board_id: Uuid) -> Self {
        Self {
            board_id: Some(board_id),
            ..Self::default()
        }
    }

    pub fn with_family(mut self, family: RoleFamily) -> Self {
        self.role_family = Some(family);
        self
    }

    pub fn unnormalized(mut self) -> Self {
        self.unnormalized_only = true;
        self
    }

    fn matches(&self, posting: &JobPosting) -> bool {
        if let Some(board_id) = self.board_id {
            if posting.board_id != board_id {
                return false;
            }
        }
        if let Some(family) = &self.role_family {
            if posting.normalized_title.as_ref() != Some(family) {
                return false;
            }
        }
        if let Some(company) = &self.company {
            if !posting.company.eq_ignore_ascii_case(company) {
                return false;
            }
        }
        if let Some(since) = self.seen_since {
            if posting.last_seen < since {
                return false;
            }
        }
        if let Some(until) = self.seen_until {
            if posting.first_seen > until {
                return false;
            }
        }
        if let Some(disappeared) = self.disappeared {
            if posting.disappeared != disappeared {
                return false;
            }
        }
        if self.unnormalized_only && posting.normalized_title.is_some() {
            return false;
        }
        true
    }
}

/// Row-level access to the tables the pipeline reads and writes.
///
/// Upserts are keyed on natural keys: `(board_id, url)` for postings,
/// `board_id` for scores, `(board_id, capture date)` for snapshots and
/// `run_id` for run results. Implementations are expected to serialize
/// concurrent upserts to the same row.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_board(&self, board: &JobBoard) -> Result<(), StoreError>;
    async fn list_boards(&self) -> Result<Vec<JobBoard>, StoreError>;
    async fn get_board(&self, board_id: Uuid) -> Result<Option<JobBoard>, StoreError>;

    /// Insert or refresh a posting by `(board_id, url)`. A re-sighting keeps
    /// `id`, `first_seen`, `normalized_title` and `repost_count`, moves
    /// `last_seen` forward and clears `disappeared`. Returns the stored row
    /// and whether it was newly created.
    async fn upsert_posting(&self, posting: &JobPosting)
        -> Result<(JobPosting, bool), StoreError>;
    async fn list_postings(&self, filter: &PostingFilter) -> Result<Vec<JobPosting>, StoreError>;
    async fn set_normalized_title(&self, id: Uuid, family: &RoleFamily)
        -> Result<(), StoreError>;
    async fn set_repost_count(&self, id: Uuid, count: u32) -> Result<(), StoreError>;
    async fn set_lifespan_days(&self, id: Uuid, days: i64) -> Result<(), StoreError>;
    async fn set_disappeared(&self, id: Uuid, disappeared: bool) -> Result<(), StoreError>;

    async fn upsert_score(&self, score: &ScoredBoard) -> Result<(), StoreError>;
    async fn list_scores(&self) -> Result<Vec<ScoredBoard>, StoreError>;

    async fn upsert_snapshot(&self, snapshot: &TrendSnapshot) -> Result<(), StoreError>;
    /// Snapshots for one board, ascending by `captured_at`.
    async fn list_snapshots(&self, board_id: Uuid) -> Result<Vec<TrendSnapshot>, StoreError>;

    async fn insert_job(&self, job: &PipelineJob) -> Result<(), StoreError>;
    async fn update_job(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<(), StoreError>;
    async fn list_pending_jobs(&self) -> Result<Vec<PipelineJob>, StoreError>;

    async fn upsert_run(&self, run: &PipelineRunResult) -> Result<(), StoreError>;
    /// Most recent runs first.
    async fn list_runs(&self, limit: usize) -> Result<Vec<PipelineRunResult>, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    boards: HashMap<Uuid, JobBoard>,
    postings: HashMap<Uuid, JobPosting>,
    scores: HashMap<Uuid, ScoredBoard>,
    snapshots: Vec<TrendSnapshot>,
    jobs: HashMap<Uuid, PipelineJob>,
    runs: HashMap<Uuid, PipelineRunResult>,
}

/// In-memory store with the same natural-key semantics as Postgres.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_board(&self, board: &JobBoard) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.boards.insert(board.id, board.clone());
        Ok(())
    }

    async fn list_boards(&self) -> Result<Vec<JobBoard>, StoreError> {
        let inner = self.inner.read().await;
        let mut boards: Vec<_> = inner.boards.values().cloned().collect();
        boards.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(boards)
    }

    async fn get_board(&self, board_id: Uuid) -> Result<Option<JobBoard>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.boards.get(&board_id).cloned())
    }

    async fn upsert_posting(
        &self,
        posting: &JobPosting,
    ) -> Result<(JobPosting, bool), StoreError> {
        let mut inner = self.inner.write().await;
        let existing = inner
            .postings
            .values()
            .find(|p| p.board_id == posting.board_id && p.url == posting.url)
            .cloned();
        match existing {
            Some(mut row) => {
                row.title = posting.title.clone();
                row.company = posting.company.clone();
                row.last_seen = row.last_seen.max(posting.last_seen);
                row.disappeared = false;
                inner.postings.insert(row.id, row.clone());
                Ok((row, false))
            }
            None => {
                inner.postings.insert(posting.id, posting.clone());
                Ok((posting.clone(), true))
            }
        }
    }

    async fn list_postings(&self, filter: &PostingFilter) -> Result<Vec<JobPosting>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<_> = inner
            .postings
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then(a.url.cmp(&b.url)));
        Ok(rows)
    }

    async fn set_normalized_title(
        &self,
        id: Uuid,
        family: &RoleFamily,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let posting = inner
            .postings
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("posting {id}")))?;
        posting.normalized_title = Some(family.clone());
        Ok(())
    }

    async fn set_repost_count(&self, id: Uuid, count: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let posting = inner
            .postings
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("posting {id}")))?;
        posting.repost_count = count;
        Ok(())
    }

    async fn set_lifespan_days(&self, id: Uuid, days: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let posting = inner
            .postings
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("posting {id}")))?;
        posting.lifespan_days = Some(days);
        Ok(())
    }

    async fn set_disappeared(&self, id: Uuid, disappeared: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let posting = inner
            .postings
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("posting {id}")))?;
        posting.disappeared = disappeared;
        Ok(())
    }

    async fn upsert_score(&self, score: &ScoredBoard) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.scores.insert(score.board_id, score.clone());
        Ok(())
    }

    async fn list_scores(&self) -> Result<Vec<ScoredBoard>, StoreError> {
        let inner = self.inner.read().await;
        let mut scores: Vec<_> = inner.scores.values().cloned().collect();
        scores.sort_by(|a, b| b.score.cmp(&a.score));
        Ok(scores)
    }

    async fn upsert_snapshot(&self, snapshot: &TrendSnapshot) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let date = snapshot.captured_at.date_naive();
        if let Some(existing) = inner
            .snapshots
            .iter_mut()
            .find(|s| s.board_id == snapshot.board_id && s.captured_at.date_naive() == date)
        {
            let id = existing.id;
            *existing = snapshot.clone();
            existing.id = id;
        } else {
            inner.snapshots.push(snapshot.clone());
        }
        Ok(())
    }

    async fn list_snapshots(&self, board_id: Uuid) -> Result<Vec<TrendSnapshot>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<_> = inner
            .snapshots
            .iter()
            .filter(|s| s.board_id == board_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.captured_at);
        Ok(rows)
    }

    async fn insert_job(&self, job: &PipelineJob) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        let now = Utc::now();
        job.status = status;
        job.error = error;
        match status {
            JobStatus::Running => job.started_at = Some(now),
            JobStatus::Completed | JobStatus::Failed => job.completed_at = Some(now),
            JobStatus::Pending => {}
        }
        Ok(())
    }

    async fn list_pending_jobs(&self) -> Result<Vec<PipelineJob>, StoreError> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn upsert_run(&self, run: &PipelineRunResult) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<PipelineRunResult>, StoreError> {
        let inner = self.inner.read().await;
        let mut runs: Vec<_> = inner.runs.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }
}

/// Postgres-backed store. Schema lives in the workspace `migrations/` dir.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Corrupt(format!("migration failed: {e}")))?;
        Ok(())
    }

    fn posting_from_row(row: &sqlx::postgres::PgRow) -> Result<JobPosting, StoreError> {
        Ok(JobPosting {
            id: row.try_get("id")?,
            board_id: row.try_get("board_id")?,
            title: row.try_get("title")?,
            normalized_title: row
                .try_get::<Option<String>, _>("normalized_title")?
                .map(RoleFamily::new),
            company: row.try_get("company")?,
            url: row.try_get("url")?,
            first_seen: row.try_get("first_seen")?,
            last_seen: row.try_get("last_seen")?,
            lifespan_days: row.try_get("lifespan_days")?,
            repost_count: row.try_get::<i32, _>("repost_count")? as u32,
            disappeared: row.try_get("disappeared")?,
        })
    }

    fn snapshot_from_row(row: &sqlx::postgres::PgRow) -> Result<TrendSnapshot, StoreError> {
        Ok(TrendSnapshot {
            id: row.try_get("id")?,
            board_id: row.try_get("board_id")?,
            captured_at: row.try_get("captured_at")?,
            overall_score: row.try_get::<i32, _>("overall_score")? as u32,
            lifespan: row.try_get("lifespan")?,
            repost_rate: row.try_get("repost_rate")?,
            employer_score: row.try_get("employer_score")?,
            candidate_score: row.try_get("candidate_score")?,
            posting_count: row.try_get::<i64, _>("posting_count")? as usize,
        })
    }
}

fn category_as_str(category: BoardCategory) -> &'static str {
    match category {
        BoardCategory::General => "general",
        BoardCategory::Tech => "tech",
        BoardCategory::Remote => "remote",
        BoardCategory::Niche => "niche",
    }
}

fn category_from_str(s: &str) -> Result<BoardCategory, StoreError> {
    match s {
        "general" => Ok(BoardCategory::General),
        "tech" => Ok(BoardCategory::Tech),
        "remote" => Ok(BoardCategory::Remote),
        "niche" => Ok(BoardCategory::Niche),
        other => Err(StoreError::Corrupt(format!("board category {other}"))),
    }
}

fn grade_from_str(s: &str) -> Result<Grade, StoreError> {
    match s {
        "A" => Ok(Grade::A),
        "B" => Ok(Grade::B),
        "C" => Ok(Grade::C),
        "D" => Ok(Grade::D),
        "F" => Ok(Grade::F),
        other => Err(StoreError::Corrupt(format!("grade {other}"))),
    }
}

fn job_kind_as_str(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Scrape => "scrape",
        JobKind::Normalize => "normalize",
        JobKind::Repost => "repost",
        JobKind::Lifespan => "lifespan",
        JobKind::Score => "score",
        JobKind::Snapshot => "snapshot",
    }
}

fn job_kind_from_str(s: &str) -> Result<JobKind, StoreError> {
    match s {
        "scrape" => Ok(JobKind::Scrape),
        "normalize" => Ok(JobKind::Normalize),
        "repost" => Ok(JobKind::Repost),
        "lifespan" => Ok(JobKind::Lifespan),
        "score" => Ok(JobKind::Score),
        "snapshot" => Ok(JobKind::Snapshot),
        other => Err(StoreError::Corrupt(format!("job kind {other}"))),
    }
}

fn job_status_as_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
    }
}

fn job_status_from_str(s: &str) -> Result<JobStatus, StoreError> {
    match s {
        "pending" => Ok(JobStatus::Pending),
        "running" => Ok(JobStatus::Running),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        other => Err(StoreError::Corrupt(format!("job status {other}"))),
    }
}

fn run_status_as_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Partial => "partial",
        RunStatus::Failed => "failed",
    }
}

fn run_status_from_str(s: &str) -> Result<RunStatus, StoreError> {
    match s {
        "pending" => Ok(RunStatus::Pending),
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "partial" => Ok(RunStatus::Partial),
        "failed" => Ok(RunStatus::Failed),
        other => Err(StoreError::Corrupt(format!("run status {other}"))),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_board(&self, board: &JobBoard) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_boards (id, name, url, category)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
               SET name = EXCLUDED.name,
                   url = EXCLUDED.url,
                   category = EXCLUDED.category
            "#,
        )
        .bind(board.id)
        .bind(&board.name)
        .bind(&board.url)
        .bind(category_as_str(board.category))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_boards(&self) -> Result<Vec<JobBoard>, StoreError> {
        let rows = sqlx::query("SELECT id, name, url, category FROM job_boards ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        let mut boards = Vec::with_capacity(rows.len());
        for row in rows {
            boards.push(JobBoard {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                url: row.try_get("url")?,
                category: category_from_str(row.try_get::<String, _>("category")?.as_str())?,
            });
        }
        Ok(boards)
    }

    async fn get_board(&self, board_id: Uuid) -> Result<Option<JobBoard>, StoreError> {
        let row = sqlx::query("SELECT id, name, url, category FROM job_boards WHERE id = $1")
            .bind(board_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(JobBoard {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                url: row.try_get("url")?,
                category: category_from_str(row.try_get::<String, _>("category")?.as_str())?,
            })),
            None => Ok(None),
        }
    }

    async fn upsert_posting(
        &self,
        posting: &JobPosting,
    ) -> Result<(JobPosting, bool), StoreError> {
        // xmax = 0 distinguishes a fresh insert from a conflict update.
        let row = sqlx::query(
            r#"
            INSERT INTO job_postings
                (id, board_id, title, normalized_title, company, url,
                 first_seen, last_seen, lifespan_days, repost_count, disappeared)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (board_id, url) DO UPDATE
               SET title = EXCLUDED.title,
                   company = EXCLUDED.company,
                   last_seen = GREATEST(job_postings.last_seen, EXCLUDED.last_seen),
                   disappeared = FALSE
            RETURNING id, board_id, title, normalized_title, company, url,
                      first_seen, last_seen, lifespan_days, repost_count, disappeared,
                      (xmax = 0) AS created
            "#,
        )
        .bind(posting.id)
        .bind(posting.board_id)
        .bind(&posting.title)
        .bind(posting.normalized_title.as_ref().map(|f| f.as_str()))
        .bind(&posting.company)
        .bind(&posting.url)
        .bind(posting.first_seen)
        .bind(posting.last_seen)
        .bind(posting.lifespan_days)
        .bind(posting.repost_count as i32)
        .bind(posting.disappeared)
        .fetch_one(&self.pool)
        .await?;
        let created: bool = row.try_get("created")?;
        Ok((Self::posting_from_row(&row)?, created))
    }

    async fn list_postings(&self, filter: &PostingFilter) -> Result<Vec<JobPosting>, StoreError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT id, board_id, title, normalized_title, company, url, \
             first_seen, last_seen, lifespan_days, repost_count, disappeared \
             FROM job_postings WHERE TRUE",
        );
        if let Some(board_id) = filter.board_id {
            qb.push(" AND board_id = ").push_bind(board_id);
        }
        if let Some(family) = &filter.role_family {
            qb.push(" AND normalized_title = ")
                .push_bind(family.as_str().to_string());
        }
        if let Some(company) = &filter.company {
            qb.push(" AND LOWER(company) = LOWER(")
                .push_bind(company.clone())
                .push(")");
        }
        if let Some(since) = filter.seen_since {
            qb.push(" AND last_seen >= ").push_bind(since);
        }
        if let Some(until) = filter.seen_until {
            qb.push(" AND first_seen <= ").push_bind(until);
        }
        if let Some(disappeared) = filter.disappeared {
            qb.push(" AND disappeared = ").push_bind(disappeared);
        }
        if filter.unnormalized_only {
            qb.push(" AND normalized_title IS NULL");
        }
        qb.push(" ORDER BY first_seen, url");

        let rows = qb.build().fetch_all(&self.pool).await?;
        debug!(count = rows.len(), "fetched postings");
        rows.iter().map(Self::posting_from_row).collect()
    }

    async fn set_normalized_title(
        &self,
        id: Uuid,
        family: &RoleFamily,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE job_postings SET normalized_title = $2 WHERE id = $1")
            .bind(id)
            .bind(family.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("posting {id}")));
        }
        Ok(())
    }

    async fn set_repost_count(&self, id: Uuid, count: u32) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE job_postings SET repost_count = $2 WHERE id = $1")
            .bind(id)
            .bind(count as i32)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("posting {id}")));
        }
        Ok(())
    }

    async fn set_lifespan_days(&self, id: Uuid, days: i64) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE job_postings SET lifespan_days = $2 WHERE id = $1")
            .bind(id)
            .bind(days)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("posting {id}")));
        }
        Ok(())
    }

    async fn set_disappeared(&self, id: Uuid, disappeared: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE job_postings SET disappeared = $2 WHERE id = $1")
            .bind(id)
            .bind(disappeared)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("posting {id}")));
        }
        Ok(())
    }

    async fn upsert_score(&self, score: &ScoredBoard) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO board_scores
                (board_id, score, grade, volume_score, quality_score,
                 response_score, acceptance_score, rank, percentile, computed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (board_id) DO UPDATE
               SET score = EXCLUDED.score,
                   grade = EXCLUDED.grade,
                   volume_score = EXCLUDED.volume_score,
                   quality_score = EXCLUDED.quality_score,
                   response_score = EXCLUDED.response_score,
                   acceptance_score = EXCLUDED.acceptance_score,
                   rank = EXCLUDED.rank,
                   percentile = EXCLUDED.percentile,
                   computed_at = NOW()
            "#,
        )
        .bind(score.board_id)
        .bind(score.score as i32)
        .bind(score.grade.to_string())
        .bind(score.breakdown.volume as i32)
        .bind(score.breakdown.quality as i32)
        .bind(score.breakdown.response as i32)
        .bind(score.breakdown.acceptance as i32)
        .bind(score.rank as i64)
        .bind(score.percentile as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_scores(&self) -> Result<Vec<ScoredBoard>, StoreError> {
        let rows = sqlx::query(
            "SELECT board_id, score, grade, volume_score, quality_score, \
             response_score, acceptance_score, rank, percentile \
             FROM board_scores ORDER BY score DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut scores = Vec::with_capacity(rows.len());
        for row in rows {
            scores.push(ScoredBoard {
                board_id: row.try_get("board_id")?,
                score: row.try_get::<i32, _>("score")? as u32,
                grade: grade_from_str(row.try_get::<String, _>("grade")?.as_str())?,
                breakdown: ScoreBreakdown {
                    volume: row.try_get::<i32, _>("volume_score")? as u32,
                    quality: row.try_get::<i32, _>("quality_score")? as u32,
                    response: row.try_get::<i32, _>("response_score")? as u32,
                    acceptance: row.try_get::<i32, _>("acceptance_score")? as u32,
                },
                rank: row.try_get::<i64, _>("rank")? as usize,
                percentile: row.try_get::<i32, _>("percentile")? as u32,
            });
        }
        Ok(scores)
    }

    async fn upsert_snapshot(&self, snapshot: &TrendSnapshot) -> Result<(), StoreError> {
        let date: NaiveDate = snapshot.captured_at.date_naive();
        sqlx::query(
            r#"
            INSERT INTO trend_snapshots
                (id, board_id, snapshot_date, captured_at, overall_score, lifespan,
                 repost_rate, employer_score, candidate_score, posting_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (board_id, snapshot_date) DO UPDATE
               SET captured_at = EXCLUDED.captured_at,
                   overall_score = EXCLUDED.overall_score,
                   lifespan = EXCLUDED.lifespan,
                   repost_rate = EXCLUDED.repost_rate,
                   employer_score = EXCLUDED.employer_score,
                   candidate_score = EXCLUDED.candidate_score,
                   posting_count = EXCLUDED.posting_count
            "#,
        )
        .bind(snapshot.id)
        .bind(snapshot.board_id)
        .bind(date)
        .bind(snapshot.captured_at)
        .bind(snapshot.overall_score as i32)
        .bind(snapshot.lifespan)
        .bind(snapshot.repost_rate)
        .bind(snapshot.employer_score)
        .bind(snapshot.candidate_score)
        .bind(snapshot.posting_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_snapshots(&self, board_id: Uuid) -> Result<Vec<TrendSnapshot>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, board_id, captured_at, overall_score, lifespan, repost_rate, \
             employer_score, candidate_score, posting_count \
             FROM trend_snapshots WHERE board_id = $1 ORDER BY captured_at",
        )
        .bind(board_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::snapshot_from_row).collect()
    }

    async fn insert_job(&self, job: &PipelineJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_jobs
                (id, kind, board_id, status, error, created_at, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(job.id)
        .bind(job_kind_as_str(job.kind))
        .bind(job.board_id)
        .bind(job_status_as_str(job.status))
        .bind(&job.error)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_job(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_jobs
               SET status = $2,
                   error = $3,
                   started_at = CASE WHEN $2 = 'running' THEN NOW() ELSE started_at END,
                   completed_at = CASE WHEN $2 IN ('completed', 'failed') THEN NOW()
                                       ELSE completed_at END
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(job_status_as_str(status))
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    async fn list_pending_jobs(&self) -> Result<Vec<PipelineJob>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, kind, board_id, status, error, created_at, started_at, completed_at \
             FROM pipeline_jobs WHERE status = 'pending' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            jobs.push(PipelineJob {
                id: row.try_get("id")?,
                kind: job_kind_from_str(row.try_get::<String, _>("kind")?.as_str())?,
                board_id: row.try_get("board_id")?,
                status: job_status_from_str(row.try_get::<String, _>("status")?.as_str())?,
                error: row.try_get("error")?,
                created_at: row.try_get("created_at")?,
                started_at: row.try_get("started_at")?,
                completed_at: row.try_get("completed_at")?,
            });
        }
        Ok(jobs)
    }

    async fn upsert_run(&self, run: &PipelineRunResult) -> Result<(), StoreError> {
        let errors = serde_json::to_value(&run.errors)
            .map_err(|e| StoreError::Corrupt(format!("serializing run errors: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs
                (run_id, status, total_jobs, completed_jobs, failed_jobs,
                 errors, started_at, duration_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (run_id) DO UPDATE
               SET status = EXCLUDED.status,
                   total_jobs = EXCLUDED.total_jobs,
                   completed_jobs = EXCLUDED.completed_jobs,
                   failed_jobs = EXCLUDED.failed_jobs,
                   errors = EXCLUDED.errors,
                   duration_ms = EXCLUDED.duration_ms
            "#,
        )
        .bind(run.run_id)
        .bind(run_status_as_str(run.status))
        .bind(run.total_jobs as i64)
        .bind(run.completed_jobs as i64)
        .bind(run.failed_jobs as i64)
        .bind(errors)
        .bind(run.started_at)
        .bind(run.duration.num_milliseconds())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<PipelineRunResult>, StoreError> {
        let rows = sqlx::query(
            "SELECT run_id, status, total_jobs, completed_jobs, failed_jobs, \
             errors, started_at, duration_ms \
             FROM pipeline_runs ORDER BY started_at DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut runs = Vec::with_capacity(rows.len());
        for row in rows {
            let errors: serde_json::Value = row.try_get("errors")?;
            let errors: Vec<String> = serde_json::from_value(errors)
                .map_err(|e| StoreError::Corrupt(format!("parsing run errors: {e}")))?;
            runs.push(PipelineRunResult {
                run_id: row.try_get("run_id")?,
                status: run_status_from_str(row.try_get::<String, _>("status")?.as_str())?,
                total_jobs: row.try_get::<i64, _>("total_jobs")? as usize,
                completed_jobs: row.try_get::<i64, _>("completed_jobs")? as usize,
                failed_jobs: row.try_get::<i64, _>("failed_jobs")? as usize,
                errors,
                started_at: row.try_get("started_at")?,
                duration: chrono::Duration::milliseconds(row.try_get::<i64, _>("duration_ms")?),
            });
        }
        Ok(runs)
    }
}
