//! Board scoring and trend tracking.
//!
//! The scoring side turns raw per-board metrics into one composite 0-100
//! score with a letter grade, then ranks boards against each other. The
//! trend side persists periodic metric snapshots and derives week-over-week
//! deltas and anomaly flags from them.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use boardpulse_core::{Grade, ScoreBreakdown, ScoredBoard, TrendSnapshot};
use boardpulse_store::{PostingFilter, Store, StoreError};

pub const CRATE_NAME: &str = "boardpulse-scoring";

/// Survey default when a board has no employer response data.
pub const DEFAULT_RESPONSE_RATE: f64 = 0.5;
/// Survey default when a board has no candidate acceptance data.
pub const DEFAULT_ACCEPTANCE_RATE: f64 = 0.3;

/// Posting count at which the volume sub-score saturates.
const VOLUME_CEILING: f64 = 150_000.0;
/// Average lifespan (days) at which the quality sub-score saturates.
const QUALITY_CEILING_DAYS: f64 = 60.0;

const WEIGHT_VOLUME: f64 = 0.35;
const WEIGHT_QUALITY: f64 = 0.25;
const WEIGHT_RESPONSE: f64 = 0.20;
const WEIGHT_ACCEPTANCE: f64 = 0.20;

/// Minimum snapshot history before anomaly detection says anything.
pub const ANOMALY_MIN_HISTORY: usize = 7;
const ANOMALY_SIGMA: f64 = 2.0;
const ANOMALY_HIGH_SIGMA: f64 = 3.0;
/// Relative-deviation fallback used when the trailing series is flat.
const ANOMALY_FALLBACK_RATIO: f64 = 0.25;

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Raw inputs to the composite score for one board. Survey rates are
/// optional; absent values fall back to the documented defaults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawBoardMetrics {
    pub board_id: Uuid,
    pub total_postings: usize,
    pub avg_lifespan_days: f64,
    pub response_rate: Option<f64>,
    pub acceptance_rate: Option<f64>,
}

/// Survey-derived rates keyed by board, supplied by an external collector.
#[derive(Debug, Clone, Default)]
pub struct SurveyRates {
    pub response: HashMap<Uuid, f64>,
    pub acceptance: HashMap<Uuid, f64>,
}

/// Pure composite scoring. Sub-scores are each capped at 100 and blended
/// 35% volume, 25% quality, 20% response, 20% acceptance. Rank and
/// percentile stay zero until [`rank_boards`] assigns them.
pub fn calculate_board_score(metrics: &RawBoardMetrics) -> ScoredBoard {
    let volume = (metrics.total_postings as f64 / VOLUME_CEILING * 100.0).min(100.0);
    let quality = (metrics.avg_lifespan_days / QUALITY_CEILING_DAYS * 100.0).min(100.0);
    let response = metrics.response_rate.unwrap_or(DEFAULT_RESPONSE_RATE) * 100.0;
    let acceptance = metrics.acceptance_rate.unwrap_or(DEFAULT_ACCEPTANCE_RATE) * 100.0;

    let composite = volume * WEIGHT_VOLUME
        + quality * WEIGHT_QUALITY
        + response * WEIGHT_RESPONSE
        + acceptance * WEIGHT_ACCEPTANCE;
    let score = composite.round() as u32;

    ScoredBoard {
        board_id: metrics.board_id,
        score,
        grade: Grade::from_score(score),
        breakdown: ScoreBreakdown {
            volume: volume.round() as u32,
            quality: quality.round() as u32,
            response: response.round() as u32,
            acceptance: acceptance.round() as u32,
        },
        rank: 0,
        percentile: 0,
    }
}

/// Sort boards score-descending and assign 1-based ranks. The sort is
/// stable, so tied boards keep their input order. Percentile for the board
/// at 0-based index `i` of `n` is `round((n - i) / n * 100)`.
pub fn rank_boards(mut boards: Vec<ScoredBoard>) -> Vec<ScoredBoard> {
    boards.sort_by(|a, b| b.score.cmp(&a.score));
    let n = boards.len();
    for (i, board) in boards.iter_mut().enumerate() {
        board.rank = i + 1;
        board.percentile = ((n - i) as f64 / n as f64 * 100.0).round() as u32;
    }
    boards
}

/// Gather metrics for one board from its posting rows.
async fn board_metrics(
    store: &dyn Store,
    board_id: Uuid,
    rates: &SurveyRates,
) -> Result<RawBoardMetrics, ScoringError> {
    let postings = store.list_postings(&PostingFilter::board(board_id)).await?;
    let total = postings.len();
    let avg_lifespan = if total == 0 {
        0.0
    } else {
        postings.iter().map(|p| p.lifespan_days() as f64).sum::<f64>() / total as f64
    };
    Ok(RawBoardMetrics {
        board_id,
        total_postings: total,
        avg_lifespan_days: avg_lifespan,
        response_rate: rates.response.get(&board_id).copied(),
        acceptance_rate: rates.acceptance.get(&board_id).copied(),
    })
}

/// Score every board, rank the results and persist them. A board whose
/// metrics cannot be read is scored zero with grade F instead of being
/// dropped, so ranked output always covers every board.
pub async fn score_all_boards(
    store: &dyn Store,
    rates: &SurveyRates,
) -> Result<Vec<ScoredBoard>, ScoringError> {
    let boards = store.list_boards().await?;
    let mut scored = Vec::with_capacity(boards.len());
    for board in &boards {
        match board_metrics(store, board.id, rates).await {
            Ok(metrics) => scored.push(calculate_board_score(&metrics)),
            Err(err) => {
                warn!(board = %board.name, %err, "scoring fell back to zero");
                scored.push(ScoredBoard::zeroed(board.id));
            }
        }
    }
    let ranked = rank_boards(scored);
    for score in &ranked {
        store.upsert_score(score).await?;
    }
    info!(boards = ranked.len(), "scoring pass done");
    Ok(ranked)
}

/// Side-by-side score comparison of two boards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardComparison {
    pub left: ScoredBoard,
    pub right: ScoredBoard,
    /// `left.score - right.score`.
    pub score_delta: i64,
}

/// Read-only pairwise comparison from the persisted scores. `None` when
/// either board has not been scored yet.
pub async fn compare_boards(
    store: &dyn Store,
    left_id: Uuid,
    right_id: Uuid,
) -> Result<Option<BoardComparison>, ScoringError> {
    let scores = store.list_scores().await?;
    let left = scores.iter().find(|s| s.board_id == left_id).cloned();
    let right = scores.iter().find(|s| s.board_id == right_id).cloned();
    match (left, right) {
        (Some(left), Some(right)) => {
            let score_delta = left.score as i64 - right.score as i64;
            Ok(Some(BoardComparison {
                left,
                right,
                score_delta,
            }))
        }
        _ => Ok(None),
    }
}

/// Metric values captured into one snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapshotInput {
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
pub enum TrendDirection {
    Up,
    Down,
    Stable,
}

/// Week-over-week movement of a board's composite score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyComparison {
    pub board_id: Uuid,
    pub this_week_score: u32,
    pub last_week_score: u32,
    pub week_change: i64,
    pub trend: TrendDirection,
    /// Consecutive snapshot steps moving in the same direction, latest first.
    pub trend_duration: usize,
    /// Standard deviation of the full score history.
    pub volatility: f64,
}

impl WeeklyComparison {
    fn stable(board_id: Uuid, score: u32) -> Self {
        Self {
            board_id,
            this_week_score: score,
            last_week_score: score,
            week_change: 0,
            trend: TrendDirection::Stable,
            trend_duration: 1,
            volatility: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Medium,
    High,
}

/// One metric deviating from its trailing history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyAlert {
    pub board_id: Uuid,
    pub metric: String,
    pub current_value: f64,
    pub expected_value: f64,
    /// Multiples of the trailing standard deviation, or the relative
    /// deviation when the trailing series was flat.
    pub deviation: f64,
    pub severity: AnomalySeverity,
    pub captured_at: DateTime<Utc>,
}

/// Append one snapshot for a board. Snapshots are keyed on the capture
/// date, so re-running within the same day replaces that day's row instead
/// of growing the series.
pub async fn record_snapshot(
    store: &dyn Store,
    input: SnapshotInput,
) -> Result<TrendSnapshot, ScoringError> {
    let snapshot = TrendSnapshot {
        id: Uuid::new_v4(),
        board_id: input.board_id,
        captured_at: input.captured_at,
        overall_score: input.overall_score,
        lifespan: input.lifespan,
        repost_rate: input.repost_rate,
        employer_score: input.employer_score,
        candidate_score: input.candidate_score,
        posting_count: input.posting_count,
    };
    store.upsert_snapshot(&snapshot).await?;
    Ok(snapshot)
}

fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Compare the latest snapshot against the most recent one at least seven
/// days older. With fewer than two qualifying snapshots this reports a
/// stable zero-delta result rather than erroring.
pub async fn weekly_comparison(
    store: &dyn Store,
    board_id: Uuid,
) -> Result<WeeklyComparison, ScoringError> {
    let snapshots = store.list_snapshots(board_id).await?;
    let Some(latest) = snapshots.last() else {
        return Ok(WeeklyComparison::stable(board_id, 0));
    };
    let cutoff = latest.captured_at - Duration::days(7);
    let Some(baseline) = snapshots
        .iter()
        .rev()
        .skip(1)
        .find(|s| s.captured_at <= cutoff)
    else {
        return Ok(WeeklyComparison::stable(board_id, latest.overall_score));
    };

    let week_change = latest.overall_score as i64 - baseline.overall_score as i64;
    let trend = match week_change {
        c if c > 1 => TrendDirection::Up,
        c if c < -1 => TrendDirection::Down,
        _ => TrendDirection::Stable,
    };

    let mut trend_duration = 1;
    for pair in snapshots.windows(2).rev() {
        let step = pair[1].overall_score as i64 - pair[0].overall_score as i64;
        let step_dir = match step {
            s if s > 0 => TrendDirection::Up,
            s if s < 0 => TrendDirection::Down,
            _ => TrendDirection::Stable,
        };
        if step_dir == trend && trend != TrendDirection::Stable {
            trend_duration += 1;
        } else {
            break;
        }
    }

    let scores: Vec<f64> = snapshots.iter().map(|s| s.overall_score as f64).collect();
    Ok(WeeklyComparison {
        board_id,
        this_week_score: latest.overall_score,
        last_week_score: baseline.overall_score,
        week_change,
        trend,
        trend_duration,
        volatility: std_dev(&scores),
    })
}

fn check_metric(
    board_id: Uuid,
    metric: &str,
    values: &[f64],
    captured_at: DateTime<Utc>,
    alerts: &mut Vec<AnomalyAlert>,
) {
    let (latest, trailing) = match values.split_last() {
        Some(split) => split,
        None => return,
    };
    let mean = trailing.iter().sum::<f64>() / trailing.len() as f64;
    let sigma = std_dev(trailing);

    if sigma > f64::EPSILON {
        let deviation = (latest - mean).abs() / sigma;
        if deviation > ANOMALY_SIGMA {
            alerts.push(AnomalyAlert {
                board_id,
                metric: metric.to_string(),
                current_value: *latest,
                expected_value: mean,
                deviation,
                severity: if deviation > ANOMALY_HIGH_SIGMA {
                    AnomalySeverity::High
                } else {
                    AnomalySeverity::Medium
                },
                captured_at,
            });
        }
    } else if mean.abs() > f64::EPSILON {
        // Flat history: fall back to a relative-deviation threshold.
        let ratio = (latest - mean).abs() / mean.abs();
        if ratio > ANOMALY_FALLBACK_RATIO {
            alerts.push(AnomalyAlert {
                board_id,
                metric: metric.to_string(),
                current_value: *latest,
                expected_value: mean,
                deviation: ratio,
                severity: if ratio > 2.0 * ANOMALY_FALLBACK_RATIO {
                    AnomalySeverity::High
                } else {
                    AnomalySeverity::Medium
                },
                captured_at,
            });
        }
    }
}

/// Flag metrics whose latest snapshot deviates sharply from trailing
/// history. With fewer than [`ANOMALY_MIN_HISTORY`] snapshots this is a
/// no-op: not enough data beats a false positive.
pub async fn detect_anomalies(
    store: &dyn Store,
    board_id: Uuid,
) -> Result<Vec<AnomalyAlert>, ScoringError> {
    let snapshots = store.list_snapshots(board_id).await?;
    if snapshots.len() < ANOMALY_MIN_HISTORY {
        return Ok(Vec::new());
    }
    let captured_at = snapshots
        .last()
        .map(|s| s.captured_at)
        .unwrap_or_else(Utc::now);

    let mut alerts = Vec::new();
    let scores: Vec<f64> = snapshots.iter().map(|s| s.overall_score as f64).collect();
    check_metric(board_id, "overall_score", &scores, captured_at, &mut alerts);
    let lifespans: Vec<f64> = snapshots.iter().map(|s| s.lifespan).collect();
    check_metric(board_id, "avg_lifespan", &lifespans, captured_at, &mut alerts);
    let repost_rates: Vec<f64> = snapshots.iter().map(|s| s.repost_rate).collect();
    check_metric(board_id, "repost_rate", &repost_rates, captured_at, &mut alerts);
    Ok(alerts)
}
