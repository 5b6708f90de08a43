//! Core domain model for BoardPulse.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "boardpulse-core";

/// Canonical role-family tag a raw job title normalizes to.
///
/// The catch-all family for titles no rule matches is [`RoleFamily::UNKNOWN`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleFamily(pub String);

impl RoleFamily {
    pub const UNKNOWN: &'static str = "unknown";

    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == Self::UNKNOWN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoleFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardCategory {
    General,
    Tech,
    Remote,
    Niche,
}

/// A tracked job board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobBoard {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub category: BoardCategory,
}

/// One scraped posting. Upserted on `(board_id, url)`; rows are retained
/// after the posting disappears so historical stats stay intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    pub id: Uuid,
    pub board_id: Uuid,
    pub title: String,
    pub normalized_title: Option<RoleFamily>,
    pub company: String,
    pub url: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub lifespan_days: Option<i64>,
    pub repost_count: u32,
    pub disappeared: bool,
}

impl JobPosting {
    /// Days the posting has been observably live: ceiling of the
    /// `first_seen..last_seen` interval, never less than one day.
    pub fn lifespan_days(&self) -> i64 {
        let span = self.last_seen.signed_duration_since(self.first_seen);
        let days = (span.num_seconds() as f64 / 86_400.0).ceil() as i64;
        days.max(1)
    }

    /// Gap in whole days between this posting vanishing and `next` appearing.
    pub fn gap_days_until(&self, next: &JobPosting) -> i64 {
        next.first_seen
            .signed_duration_since(self.last_seen)
            .num_days()
    }
}

/// Per-family slice of a board's lifespan distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleFamilyLifespan {
    pub family: RoleFamily,
    pub count: usize,
    pub average_lifespan: f64,
}

/// Aggregated lifespan distribution for one board. Recomputed idempotently
/// from posting rows; safe to discard and rebuild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardLifespanStats {
    pub board_id: Uuid,
    pub total_postings: usize,
    pub active_postings: usize,
    pub disappeared_postings: usize,
    pub average_lifespan: f64,
    pub median_lifespan: i64,
    pub min_lifespan: i64,
    pub max_lifespan: i64,
    pub by_role_family: Vec<RoleFamilyLifespan>,
}

impl BoardLifespanStats {
    pub fn empty(board_id: Uuid) -> Self {
        Self {
            board_id,
            total_postings: 0,
            active_postings: 0,
            disappeared_postings: 0,
            average_lifespan: 0.0,
            median_lifespan: 0,
            min_lifespan: 0,
            max_lifespan: 0,
            by_role_family: Vec::new(),
        }
    }
}

/// Letter grade bands over the composite score. Lower bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn from_score(score: u32) -> Self {
        match score {
            s if s >= 85 => Grade::A,
            s if s >= 70 => Grade::B,
            s if s >= 60 => Grade::C,
            s if s >= 50 => Grade::D,
            _ => Grade::F,
        }
    }
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = match self {
            Grade::A => 'A',
            Grade::B => 'B',
            Grade::C => 'C',
            Grade::D => 'D',
            Grade::F => 'F',
        };
        write!(f, "{c}")
    }
}

/// The four normalized sub-scores feeding the composite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub volume: u32,
    pub quality: u32,
    pub response: u32,
    pub acceptance: u32,
}

/// Composite efficiency score for one board. Superseded entirely on each
/// scoring run (upsert by board).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredBoard {
    pub board_id: Uuid,
    pub score: u32,
    pub grade: Grade,
    pub breakdown: ScoreBreakdown,
    pub rank: usize,
    pub percentile: u32,
}

impl ScoredBoard {
    /// Zero-valued fallback emitted when a board's metrics cannot be
    /// computed, so every requested board still appears in ranked output.
    pub fn zeroed(board_id: Uuid) -> Self {
        Self {
            board_id,
            score: 0,
            grade: Grade::F,
            breakdown: ScoreBreakdown {
                volume: 0,
                quality: 0,
                response: 0,
                acceptance: 0,
            },
            rank: 0,
            percentile: 0,
        }
    }
}

/// One immutable point of a board's metric time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSnapshot {
    pub id: Uuid,
    pub board_id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub overall_score: u32,
    pub lifespan: f64,
    pub repost_rate: f64,
    pub employer_score: f64,
    pub candidate_score: f64,
    pub posting_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Scrape,
    Normalize,
    Repost,
    Lifespan,
    Score,
    Snapshot,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobKind::Scrape => "scrape",
            JobKind::Normalize => "normalize",
            JobKind::Repost => "repost",
            JobKind::Lifespan => "lifespan",
            JobKind::Score => "score",
            JobKind::Snapshot => "snapshot",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One per-board sub-step of a pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub board_id: Option<Uuid>,
    pub status: JobStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineJob {
    pub fn new(kind: JobKind, board_id: Option<Uuid>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            board_id,
            status: JobStatus::Pending,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Partial | RunStatus::Failed
        )
    }
}

/// Outcome of one orchestrator invocation. Immutable once the run ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

mod duration_millis {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        value.num_milliseconds().serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::milliseconds(i64::deserialize(de)?))
    }
}

/// Handoff contract from a scrape adapter back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeOutcome {
    pub board_name: String,
    pub jobs_scraped: usize,
    pub new_jobs: usize,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, 12, 0, 0).single().unwrap()
    }

    fn posting(first: u32, last: u32) -> JobPosting {
        JobPosting {
            id: Uuid::new_v4(),
            board_id: Uuid::new_v4(),
            title: "Backend Developer".into(),
            normalized_title: None,
            company: "Acme".into(),
            url: "https://example.com/jobs/1".into(),
            first_seen: day(first),
            last_seen: day(last),
            lifespan_days: None,
            repost_count: 0,
            disappeared: false,
        }
    }

    #[test]
    fn lifespan_is_at_least_one_day() {
        let p = posting(5, 5);
        assert_eq!(p.lifespan_days(), 1);
    }

    #[test]
    fn lifespan_rounds_partial_days_up() {
        let mut p = posting(1, 10);
        p.last_seen = Utc.with_ymd_and_hms(2026, 3, 10, 18, 0, 0).single().unwrap();
        // 9 days and 6 hours rounds up to 10.
        assert_eq!(p.lifespan_days(), 10);
    }

    #[test]
    fn gap_days_between_postings() {
        let a = posting(1, 10);
        let b = posting(25, 30);
        assert_eq!(a.gap_days_until(&b), 15);
    }

    #[test]
    fn grade_bands_are_inclusive_on_lower_bound() {
        assert_eq!(Grade::from_score(85), Grade::A);
        assert_eq!(Grade::from_score(84), Grade::B);
        assert_eq!(Grade::from_score(70), Grade::B);
        assert_eq!(Grade::from_score(69), Grade::C);
        assert_eq!(Grade::from_score(60), Grade::C);
        assert_eq!(Grade::from_score(59), Grade::D);
        assert_eq!(Grade::from_score(50), Grade::D);
        assert_eq!(Grade::from_score(49), Grade::F);
        assert_eq!(Grade::from_score(0), Grade::F);
    }

    #[test]
    fn run_status_terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Partial.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }
}
