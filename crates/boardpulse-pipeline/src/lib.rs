//! Pipeline orchestration: scrape, normalize, detect reposts, recompute
//! lifespans, score, snapshot, in that order, every run.
//!
//! The orchestrator is the only place that knows stage ordering and the
//! failure policy. Engines report per-row outcomes; this module decides
//! whether a run ends completed, partial or failed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use boardpulse_analytics::{
    board_lifespan_stats, bulk_normalize_titles, bulk_update_all_lifespans, AnalyticsError,
    RepostConfig, RepostDetector, TitleNormalizer, DEFAULT_FAMILY_TOP_N,
};
use boardpulse_core::{
    JobKind, JobStatus, PipelineJob, PipelineRunResult, RunStatus, ScoredBoard,
};
use boardpulse_scoring::{
    record_snapshot, score_all_boards, ScoringError, SnapshotInput, SurveyRates,
};
use boardpulse_scrapers::{ingest_board, ScrapeContext, ScraperRegistry};
use boardpulse_store::{Store, StoreError};

pub const CRATE_NAME: &str = "boardpulse-pipeline";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Analytics(#[from] AnalyticsError),
    #[error(transparent)]
    Scoring(#[from] ScoringError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Env-driven pipeline configuration. Every knob has a default so a bare
/// environment still runs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub fixtures_dir: PathBuf,
    pub rules_file: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub pipeline_cron: String,
    pub min_gap_days: i64,
    pub max_gap_days: i64,
    pub similarity_threshold: f64,
    pub family_top_n: usize,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = RepostConfig::default();
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            fixtures_dir: std::env::var("BOARDPULSE_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./fixtures")),
            rules_file: std::env::var("BOARDPULSE_RULES_FILE").ok().map(PathBuf::from),
            scheduler_enabled: std::env::var("BOARDPULSE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            pipeline_cron: std::env::var("BOARDPULSE_PIPELINE_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            min_gap_days: std::env::var("BOARDPULSE_MIN_GAP_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.min_gap_days),
            max_gap_days: std::env::var("BOARDPULSE_MAX_GAP_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_gap_days),
            similarity_threshold: std::env::var("BOARDPULSE_SIMILARITY_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.similarity_threshold),
            family_top_n: std::env::var("BOARDPULSE_FAMILY_TOP_N")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_FAMILY_TOP_N),
        }
    }

    pub fn repost_config(&self) -> RepostConfig {
        RepostConfig {
            min_gap_days: self.min_gap_days,
            max_gap_days: self.max_gap_days,
            similarity_threshold: self.similarity_threshold,
        }
    }
}

/// Aggregate view over the last seven days of runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStats {
    pub period_days: i64,
    pub total_runs: usize,
    pub successful_runs: usize,
    pub partial_runs: usize,
    pub failed_runs: usize,
    pub run_success_rate: f64,
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub job_success_rate: f64,
    pub avg_duration_secs: i64,
}

const STATS_WINDOW_DAYS: i64 = 7;
const STATS_RUN_SCAN_LIMIT: usize = 200;

/// Tracks job counters and error messages across one run.
struct RunLedger {
    run_id: Uuid,
    total_jobs: usize,
    completed_jobs: usize,
    failed_jobs: usize,
    errors: Vec<String>,
}

impl RunLedger {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            total_jobs: 0,
            completed_jobs: 0,
            failed_jobs: 0,
            errors: Vec::new(),
        }
    }

    fn status(&self) -> RunStatus {
        if self.failed_jobs == 0 {
            RunStatus::Completed
        } else if self.failed_jobs == self.total_jobs {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        }
    }
}

pub struct PipelineOrchestrator {
    store: Arc<dyn Store>,
    registry: ScraperRegistry,
    normalizer: TitleNormalizer,
    detector: RepostDetector,
    rates: SurveyRates,
    config: PipelineConfig,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        registry: ScraperRegistry,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let normalizer = match &config.rules_file {
            Some(path) => TitleNormalizer::from_rules_file(path)?,
            None => TitleNormalizer::builtin(),
        };
        let detector = RepostDetector::new(normalizer.clone(), config.repost_config());
        Ok(Self {
            store,
            registry,
            normalizer,
            detector,
            rates: SurveyRates::default(),
            config,
        })
    }

    pub fn with_survey_rates(mut self, rates: SurveyRates) -> Self {
        self.rates = rates;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Settle one sub-step: updates the job row and the run counters from
    /// the outcome. The `Err` side carries the human-readable message that
    /// ends up in the run's error list.
    async fn run_job(
        &self,
        ledger: &mut RunLedger,
        kind: JobKind,
        board_id: Option<Uuid>,
        outcome: Result<(), String>,
        job: &PipelineJob,
    ) {
        ledger.total_jobs += 1;
        let (status, error) = match outcome {
            Ok(()) => {
                ledger.completed_jobs += 1;
                (JobStatus::Completed, None)
            }
            Err(message) => {
                ledger.failed_jobs += 1;
                ledger.errors.push(message.clone());
                (JobStatus::Failed, Some(message))
            }
        };
        if let Err(err) = self.store.update_job(job.id, status, error).await {
            warn!(%err, kind = %kind, board = ?board_id, "failed to settle job row");
        }
    }

    async fn open_job(
        &self,
        kind: JobKind,
        board_id: Option<Uuid>,
    ) -> Result<PipelineJob, StoreError> {
        let job = PipelineJob::new(kind, board_id, Utc::now());
        self.store.insert_job(&job).await?;
        self.store
            .update_job(job.id, JobStatus::Running, None)
            .await?;
        Ok(job)
    }

    /// One full pipeline pass. Never panics or errs: a fatal problem is
    /// reported as a `failed` run with a single top-level error.
    pub async fn run_pipeline(&self) -> PipelineRunResult {
        let run_id = Uuid::new_v4();
        let started = Utc::now();
        let span = info_span!("pipeline_run", %run_id);
        let mut ledger = RunLedger::new(run_id);

        let result = self
            .run_stages(&mut ledger, started)
            .instrument(span)
            .await;

        let run = match result {
            Ok(()) => PipelineRunResult {
                run_id,
                status: ledger.status(),
                total_jobs: ledger.total_jobs,
                completed_jobs: ledger.completed_jobs,
                failed_jobs: ledger.failed_jobs,
                errors: ledger.errors,
                started_at: started,
                duration: Utc::now().signed_duration_since(started),
            },
            Err(err) => PipelineRunResult {
                run_id,
                status: RunStatus::Failed,
                total_jobs: ledger.total_jobs,
                completed_jobs: ledger.completed_jobs,
                failed_jobs: ledger.failed_jobs,
                errors: vec![format!("fatal: {err}")],
                started_at: started,
                duration: Utc::now().signed_duration_since(started),
            },
        };

        if let Err(err) = self.store.upsert_run(&run).await {
            warn!(%err, %run_id, "failed to persist run result");
        }
        info!(
            %run_id,
            status = ?run.status,
            total = run.total_jobs,
            failed = run.failed_jobs,
            "pipeline run finished"
        );
        run
    }

    /// Stage bodies. Only unrecoverable problems (board list unreadable,
    /// scoring unable to touch the store) bubble out as `Err`; per-board
    /// trouble lands in the ledger and the next stage still runs.
    async fn run_stages(
        &self,
        ledger: &mut RunLedger,
        started: chrono::DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let boards = self.store.list_boards().await?;
        let ctx = ScrapeContext {
            run_id: ledger.run_id,
            fetched_at: started,
        };

        // Stage 1: scrape, one job per board.
        for board in &boards {
            let job = self.open_job(JobKind::Scrape, Some(board.id)).await?;
            let outcome = match self.registry.get(&board.name) {
                Some(adapter) => ingest_board(self.store.as_ref(), board, adapter.as_ref(), &ctx)
                    .await
                    .map(|_| ())
                    .map_err(|err| format!("scrape {}: {err}", board.name)),
                None => Err(format!("scrape {}: no adapter registered", board.name)),
            };
            self.run_job(ledger, JobKind::Scrape, Some(board.id), outcome, &job)
                .await;
        }

        // Stage 2: normalize titles.
        let job = self.open_job(JobKind::Normalize, None).await?;
        let outcome = match bulk_normalize_titles(self.store.as_ref(), &self.normalizer).await {
            Ok(o) if o.failed == 0 => Ok(()),
            Ok(o) => Err(format!("normalize: {} postings failed", o.failed)),
            Err(err) => Err(format!("normalize: {err}")),
        };
        self.run_job(ledger, JobKind::Normalize, None, outcome, &job)
            .await;

        // Stage 3: repost detection across all boards.
        let job = self.open_job(JobKind::Repost, None).await?;
        let outcome = match self.detector.bulk_detect_all(self.store.as_ref()).await {
            Ok(o) if o.total_failed == 0 => Ok(()),
            Ok(o) => Err(format!(
                "repost detection: {} board(s) failed: {}",
                o.total_failed,
                o.errors.join("; ")
            )),
            Err(err) => Err(format!("repost detection: {err}")),
        };
        self.run_job(ledger, JobKind::Repost, None, outcome, &job)
            .await;

        // Stage 4: lifespan recompute across all boards.
        let job = self.open_job(JobKind::Lifespan, None).await?;
        let outcome = match bulk_update_all_lifespans(self.store.as_ref()).await {
            Ok(o) if o.failed == 0 => Ok(()),
            Ok(o) => Err(format!("lifespan recompute: {} rows failed", o.failed)),
            Err(err) => Err(format!("lifespan recompute: {err}")),
        };
        self.run_job(ledger, JobKind::Lifespan, None, outcome, &job)
            .await;

        // Stage 5: composite scores.
        let job = self.open_job(JobKind::Score, None).await?;
        let scores = score_all_boards(self.store.as_ref(), &self.rates).await;
        let (outcome, scores) = match scores {
            Ok(scores) => (Ok(()), scores),
            Err(err) => (Err(format!("scoring: {err}")), Vec::new()),
        };
        self.run_job(ledger, JobKind::Score, None, outcome, &job)
            .await;

        // Stage 6: one trend snapshot per board.
        for board in &boards {
            let job = self.open_job(JobKind::Snapshot, Some(board.id)).await?;
            let outcome = self
                .snapshot_board(board.id, &scores, started)
                .await
                .map_err(|err| format!("snapshot {}: {err}", board.name));
            self.run_job(ledger, JobKind::Snapshot, Some(board.id), outcome, &job)
                .await;
        }

        Ok(())
    }

    async fn snapshot_board(
        &self,
        board_id: Uuid,
        scores: &[ScoredBoard],
        captured_at: chrono::DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let stats =
            board_lifespan_stats(self.store.as_ref(), board_id, self.config.family_top_n).await?;
        let reposts = self.detector.repost_stats(self.store.as_ref(), board_id).await?;
        let score = scores
            .iter()
            .find(|s| s.board_id == board_id)
            .cloned()
            .unwrap_or_else(|| ScoredBoard::zeroed(board_id));
        record_snapshot(
            self.store.as_ref(),
            SnapshotInput {
                board_id,
                captured_at,
                overall_score: score.score,
                lifespan: stats.average_lifespan,
                repost_rate: reposts.repost_percentage as f64,
                employer_score: score.breakdown.response as f64,
                candidate_score: score.breakdown.acceptance as f64,
                posting_count: stats.total_postings,
            },
        )
        .await?;
        Ok(())
    }

    /// Jobs waiting to run, oldest first.
    pub async fn get_pending_jobs(&self) -> Result<Vec<PipelineJob>, PipelineError> {
        Ok(self.store.list_pending_jobs().await?)
    }

    /// Most recent runs first.
    pub async fn get_run_history(
        &self,
        limit: usize,
    ) -> Result<Vec<PipelineRunResult>, PipelineError> {
        Ok(self.store.list_runs(limit).await?)
    }

    /// Aggregates over the trailing seven days of runs.
    pub async fn get_pipeline_stats(&self) -> Result<PipelineStats, PipelineError> {
        let cutoff = Utc::now() - Duration::days(STATS_WINDOW_DAYS);
        let runs: Vec<PipelineRunResult> = self
            .store
            .list_runs(STATS_RUN_SCAN_LIMIT)
            .await?
            .into_iter()
            .filter(|r| r.started_at >= cutoff)
            .collect();

        let total_runs = runs.len();
        let successful_runs = runs
            .iter()
            .filter(|r| r.status == RunStatus::Completed)
            .count();
        let partial_runs = runs.iter().filter(|r| r.status == RunStatus::Partial).count();
        let failed_runs = runs.iter().filter(|r| r.status == RunStatus::Failed).count();
        let total_jobs: usize = runs.iter().map(|r| r.total_jobs).sum();
        let completed_jobs: usize = runs.iter().map(|r| r.completed_jobs).sum();
        let failed_jobs: usize = runs.iter().map(|r| r.failed_jobs).sum();
        let avg_duration_secs = if total_runs == 0 {
            0
        } else {
            runs.iter().map(|r| r.duration.num_seconds()).sum::<i64>() / total_runs as i64
        };

        Ok(PipelineStats {
            period_days: STATS_WINDOW_DAYS,
            total_runs,
            successful_runs,
            partial_runs,
            failed_runs,
            run_success_rate: if total_runs == 0 {
                0.0
            } else {
                successful_runs as f64 / total_runs as f64 * 100.0
            },
            total_jobs,
            completed_jobs,
            failed_jobs,
            job_success_rate: if total_jobs == 0 {
                0.0
            } else {
                completed_jobs as f64 / total_jobs as f64 * 100.0
            },
            avg_duration_secs,
        })
    }

    /// Build the cron scheduler when enabled; `None` otherwise. The caller
    /// owns starting and shutting it down.
    pub async fn maybe_build_scheduler(
        self: &Arc<Self>,
    ) -> Result<Option<JobScheduler>, PipelineError> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let orchestrator = Arc::clone(self);
        let cron = self.config.pipeline_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let orchestrator = Arc::clone(&orchestrator);
            Box::pin(async move {
                let run = orchestrator.run_pipeline().await;
                info!(run_id = %run.run_id, status = ?run.status, "scheduled run finished");
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boardpulse_core::{BoardCategory, JobBoard};
    use boardpulse_scrapers::{FixtureAdapter, RawPosting};
    use boardpulse_store::{MemoryStore, PostingFilter};

    fn config() -> PipelineConfig {
        PipelineConfig {
            database_url: None,
            fixtures_dir: PathBuf::from("./fixtures"),
            rules_file: None,
            scheduler_enabled: false,
            pipeline_cron: "0 0 6 * * *".to_string(),
            min_gap_days: 3,
            max_gap_days: 90,
            similarity_threshold: 0.75,
            family_top_n: DEFAULT_FAMILY_TOP_N,
        }
    }

    fn board(name: &str) -> JobBoard {
        JobBoard {
            id: Uuid::new_v4(),
            name: name.to_string(),
            url: format!("https://{}.example.com", name.to_lowercase()),
            category: BoardCategory::Tech,
        }
    }

    fn raw(url: &str, title: &str) -> RawPosting {
        RawPosting {
            title: title.into(),
            company: "Acme".into(),
            url: url.into(),
        }
    }

    async fn seeded_store() -> (Arc<MemoryStore>, JobBoard) {
        let store = Arc::new(MemoryStore::new());
        let b = board("DevJobs");
        store.upsert_board(&b).await.unwrap();
        (store, b)
    }

    #[tokio::test]
    async fn full_run_over_one_board_completes() {
        let (store, b) = seeded_store().await;
        let mut registry = ScraperRegistry::new();
        registry.register(Arc::new(FixtureAdapter::from_postings(
            "DevJobs",
            vec![
                raw("https://d.example/1", "Backend Developer"),
                raw("https://d.example/2", "UX Designer"),
            ],
        )));
        let orchestrator =
            PipelineOrchestrator::new(store.clone(), registry, config()).unwrap();

        let run = orchestrator.run_pipeline().await;
        assert_eq!(run.status, RunStatus::Completed);
        // 1 scrape + normalize + repost + lifespan + score + 1 snapshot.
        assert_eq!(run.total_jobs, 6);
        assert_eq!(run.failed_jobs, 0);
        assert!(run.errors.is_empty());

        let postings = store.list_postings(&PostingFilter::board(b.id)).await.unwrap();
        assert_eq!(postings.len(), 2);
        assert!(postings.iter().all(|p| p.normalized_title.is_some()));
        assert!(postings.iter().all(|p| p.lifespan_days.is_some()));

        let scores = store.list_scores().await.unwrap();
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].rank, 1);

        let snapshots = store.list_snapshots(b.id).await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].posting_count, 2);

        let history = orchestrator.get_run_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].run_id, run.run_id);
    }

    #[tokio::test]
    async fn missing_adapter_downgrades_run_to_partial() {
        let (store, _b) = seeded_store().await;
        let orphan = board("OpsJobs");
        store.upsert_board(&orphan).await.unwrap();

        let mut registry = ScraperRegistry::new();
        registry.register(Arc::new(FixtureAdapter::from_postings(
            "DevJobs",
            vec![raw("https://d.example/1", "Backend Developer")],
        )));
        let orchestrator =
            PipelineOrchestrator::new(store.clone(), registry, config()).unwrap();

        let run = orchestrator.run_pipeline().await;
        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(run.failed_jobs, 1);
        assert_eq!(run.errors.len(), 1);
        assert!(run.errors[0].contains("OpsJobs"));

        // Later stages still ran: both boards got scored and snapshotted.
        assert_eq!(store.list_scores().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn second_run_on_unchanged_data_is_still_clean() {
        let (store, b) = seeded_store().await;
        let mut registry = ScraperRegistry::new();
        registry.register(Arc::new(FixtureAdapter::from_postings(
            "DevJobs",
            vec![raw("https://d.example/1", "Backend Developer")],
        )));
        let orchestrator =
            PipelineOrchestrator::new(store.clone(), registry, config()).unwrap();

        let first = orchestrator.run_pipeline().await;
        let second = orchestrator.run_pipeline().await;
        assert_eq!(first.status, RunStatus::Completed);
        assert_eq!(second.status, RunStatus::Completed);

        // Same-day snapshot was replaced, not appended.
        assert_eq!(store.list_snapshots(b.id).await.unwrap().len(), 1);
        let history = orchestrator.get_run_history(10).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn stats_aggregate_recent_runs() {
        let (store, _b) = seeded_store().await;
        let mut registry = ScraperRegistry::new();
        registry.register(Arc::new(FixtureAdapter::from_postings(
            "DevJobs",
            vec![raw("https://d.example/1", "Backend Developer")],
        )));
        let orchestrator =
            PipelineOrchestrator::new(store.clone(), registry, config()).unwrap();
        orchestrator.run_pipeline().await;

        let stats = orchestrator.get_pipeline_stats().await.unwrap();
        assert_eq!(stats.total_runs, 1);
        assert_eq!(stats.successful_runs, 1);
        assert!((stats.run_success_rate - 100.0).abs() < f64::EPSILON);
        assert_eq!(stats.failed_jobs, 0);
        assert!((stats.job_success_rate - 100.0).abs() < f64::EPSILON);

        assert!(orchestrator.get_pending_jobs().await.unwrap().is_empty());
    }

    #[test]
    fn env_config_has_usable_defaults() {
        let cfg = config();
        let repost = cfg.repost_config();
        assert_eq!(repost.min_gap_days, 3);
        assert_eq!(repost.max_gap_days, 90);
        assert!((repost.similarity_threshold - 0.75).abs() < f64::EPSILON);
    }
}
