//! Posting analytics: title normalization, repost detection and lifespan
//! aggregation.
//!
//! Everything here is recomputed from posting rows. The engines tolerate
//! per-row failures and report `{updated, failed}` style outcomes; callers
//! decide what an acceptable failure count is.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use boardpulse_core::{BoardLifespanStats, JobPosting, RoleFamily, RoleFamilyLifespan};
use boardpulse_store::{PostingFilter, Store, StoreError};

pub const CRATE_NAME: &str = "boardpulse-analytics";

/// Family breakdowns are truncated to this many rows for reporting.
pub const DEFAULT_FAMILY_TOP_N: usize = 10;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One normalization rule: a title matching any keyword and no exclude
/// keyword belongs to `family`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleRule {
    pub family: String,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
}

/// Maps raw titles to role families via a priority-ordered rule list.
/// First matching rule wins; ties between rules are broken by declaration
/// order. Unmatched titles map to [`RoleFamily::UNKNOWN`].
#[derive(Debug, Clone)]
pub struct TitleNormalizer {
    rules: Vec<RoleRule>,
}

fn rule(family: &str, keywords: &[&str], exclude_keywords: &[&str]) -> RoleRule {
    RoleRule {
        family: family.to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        exclude_keywords: exclude_keywords.iter().map(|k| k.to_string()).collect(),
    }
}

impl TitleNormalizer {
    /// The built-in rule set covering the common role families.
    pub fn builtin() -> Self {
        let rules = vec![
            rule(
                "software-engineer",
                &[
                    "software engineer", "developer", "programmer", "backend", "frontend",
                    "full stack", "fullstack", "code", "coding", "python", "javascript",
                    "java", "c++", "golang", "rust", "typescript", "node", "react",
                    "angular", "vue", "spring", "rails", "django", "lead engineer",
                    "principal engineer", "software architect", "systems engineer",
                ],
                &["qa", "test", "quality assurance", "manager", "technical writer"],
            ),
            rule(
                "data-scientist",
                &[
                    "data scientist", "machine learning", "ml engineer", "ai engineer",
                    "artificial intelligence", "deep learning", "nlp", "computer vision",
                    "analytics", "data analyst", "big data", "spark", "hadoop",
                    "tensorflow", "pytorch", "statistical", "predictive model",
                ],
                &["sales analyst", "business analyst"],
            ),
            rule(
                "product-manager",
                &[
                    "product manager", "product management", "product owner",
                    "product lead", "product strategy", "associate product manager",
                ],
                &[],
            ),
            rule(
                "designer",
                &[
                    "designer", "ux designer", "ui designer", "ux/ui",
                    "interaction designer", "product designer", "design system",
                    "graphic designer", "visual design", "motion designer",
                    "design lead", "design director", "design manager",
                ],
                &["software", "engineer"],
            ),
            rule(
                "devops-infrastructure",
                &[
                    "devops", "infrastructure", "sre", "site reliability",
                    "cloud engineer", "aws", "azure", "gcp", "kubernetes", "docker",
                    "terraform", "ansible", "platform engineer",
                    "systems administrator", "network engineer",
                ],
                &[],
            ),
            rule(
                "qa-testing",
                &[
                    "qa", "quality assurance", "test engineer", "tester", "automation",
                    "selenium", "cypress", "test automation", "qa engineer",
                    "quality engineer", "manual testing", "test lead",
                ],
                &[],
            ),
            rule(
                "business-analyst",
                &[
                    "business analyst", "business analysis", "requirements analyst",
                    "solutions analyst", "systems analyst",
                ],
                &["data analyst", "sales analyst"],
            ),
            rule(
                "sales",
                &[
                    "sales", "account executive", "account manager", "sales engineer",
                    "sales director", "sales manager", "business development",
                    "enterprise sales",
                ],
                &[],
            ),
            rule(
                "marketing",
                &[
                    "marketing", "product marketing", "growth", "content marketing",
                    "digital marketing", "seo", "sem", "marketing analyst",
                ],
                &[],
            ),
            rule(
                "operations",
                &[
                    "operations", "ops", "recruiting", "recruiter",
                    "talent acquisition", "supply chain",
                ],
                &[],
            ),
            rule(
                "finance",
                &[
                    "finance", "accountant", "accounting", "financial analyst", "cpa",
                    "controller", "cfo", "treasurer",
                ],
                &[],
            ),
            rule(
                "hr",
                &[
                    "human resources", "hr", "people operations", "compensation",
                    "benefits",
                ],
                &[],
            ),
            rule(
                "executive",
                &[
                    "ceo", "coo", "cto", "vp", "vice president", "president",
                    "founder", "executive", "c-level",
                ],
                &[],
            ),
        ];
        Self { rules }
    }

    /// Load a rule list from a YAML file, replacing the built-in set.
    pub fn from_rules_file(path: &Path) -> Result<Self, AnalyticsError> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading rules file {}", path.display()))?;
        let rules: Vec<RoleRule> = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing rules file {}", path.display()))?;
        Ok(Self { rules })
    }

    /// Total function: every title maps to some family.
    pub fn normalize(&self, raw_title: &str) -> RoleFamily {
        let title = raw_title.to_lowercase();
        let title = title.trim();
        for rule in &self.rules {
            let keyword_hit = rule.keywords.iter().any(|k| title.contains(k.as_str()));
            if !keyword_hit {
                continue;
            }
            let excluded = rule
                .exclude_keywords
                .iter()
                .any(|k| title.contains(k.as_str()));
            if excluded {
                continue;
            }
            return RoleFamily::new(rule.family.clone());
        }
        RoleFamily::unknown()
    }

    /// Title similarity in `[0, 1]`. Two titles in the same known family
    /// score a flat 0.9; otherwise normalized edit distance decides.
    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        let fam_a = self.normalize(a);
        let fam_b = self.normalize(b);
        if fam_a == fam_b && !fam_a.is_unknown() {
            return 0.9;
        }
        strsim::normalized_levenshtein(&a.to_lowercase(), &b.to_lowercase())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeOutcome {
    pub updated: usize,
    pub failed: usize,
}

/// Tag every posting that has no role family yet. Per-row failures are
/// counted, not fatal.
pub async fn bulk_normalize_titles(
    store: &dyn Store,
    normalizer: &TitleNormalizer,
) -> Result<NormalizeOutcome, AnalyticsError> {
    let pending = store
        .list_postings(&PostingFilter::all().unnormalized())
        .await?;
    let mut outcome = NormalizeOutcome::default();
    for posting in &pending {
        let family = normalizer.normalize(&posting.title);
        match store.set_normalized_title(posting.id, &family).await {
            Ok(()) => outcome.updated += 1,
            Err(err) => {
                warn!(posting = %posting.id, %err, "failed to store normalized title");
                outcome.failed += 1;
            }
        }
    }
    info!(
        updated = outcome.updated,
        failed = outcome.failed,
        "title normalization pass done"
    );
    Ok(outcome)
}

/// Gap window and confirmation threshold for repost linking.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RepostConfig {
    /// Gaps shorter than this are scrape noise, not a disappearance.
    pub min_gap_days: i64,
    /// Gaps longer than this are an unrelated new listing.
    pub max_gap_days: i64,
    /// Secondary full-title confirmation threshold.
    pub similarity_threshold: f64,
}

impl Default for RepostConfig {
    fn default() -> Self {
        Self {
            min_gap_days: 3,
            max_gap_days: 90,
            similarity_threshold: 0.75,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepostOutcome {
    pub clusters_found: usize,
    pub postings_updated: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkRepostOutcome {
    pub total_detected: usize,
    pub total_updated: usize,
    pub total_failed: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepostSeverity {
    Low,
    Medium,
    High,
}

impl RepostSeverity {
    pub fn from_percentage(pct: u32) -> Self {
        match pct {
            p if p > 30 => RepostSeverity::High,
            p if p >= 10 => RepostSeverity::Medium,
            _ => RepostSeverity::Low,
        }
    }
}

/// Human-readable repost intensity for one board. Not an input to scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepostStats {
    pub board_id: Uuid,
    pub total_postings: usize,
    pub postings_with_reposts: usize,
    pub total_repost_events: usize,
    pub average_reposts_per_posting: f64,
    pub repost_percentage: u32,
    pub average_gap_days: f64,
    pub severity: RepostSeverity,
}

struct RepostCluster {
    postings: Vec<JobPosting>,
    gaps: Vec<i64>,
}

/// Links postings that are the same role reappearing after a visibility
/// gap. Clusters are derived per run, never persisted; the lasting effect
/// is `repost_count` written back onto the most recent cluster member.
pub struct RepostDetector {
    normalizer: TitleNormalizer,
    config: RepostConfig,
}

impl RepostDetector {
    pub fn new(normalizer: TitleNormalizer, config: RepostConfig) -> Self {
        Self { normalizer, config }
    }

    fn group_key(&self, posting: &JobPosting) -> (String, String) {
        let family = match &posting.normalized_title {
            Some(f) => f.as_str().to_string(),
            None => posting.title.to_lowercase(),
        };
        (family, posting.company.to_lowercase())
    }

    fn clusters(&self, postings: Vec<JobPosting>) -> Vec<RepostCluster> {
        let mut groups: HashMap<(String, String), Vec<JobPosting>> = HashMap::new();
        for posting in postings {
            groups.entry(self.group_key(&posting)).or_default().push(posting);
        }

        let mut clusters = Vec::new();
        for (_, mut group) in groups {
            group.sort_by_key(|p| p.first_seen);
            let mut current = RepostCluster {
                postings: Vec::new(),
                gaps: Vec::new(),
            };
            for posting in group {
                let linked = current.postings.last().is_some_and(|prev| {
                    let gap = prev.gap_days_until(&posting);
                    gap >= self.config.min_gap_days
                        && gap <= self.config.max_gap_days
                        && self.normalizer.similarity(&prev.title, &posting.title)
                            >= self.config.similarity_threshold
                });
                if linked {
                    let gap = current.postings.last().map(|p| p.gap_days_until(&posting));
                    if let Some(gap) = gap {
                        current.gaps.push(gap);
                    }
                    current.postings.push(posting);
                } else {
                    if current.postings.len() > 1 {
                        clusters.push(current);
                    }
                    current = RepostCluster {
                        postings: vec![posting],
                        gaps: Vec::new(),
                    };
                }
            }
            if current.postings.len() > 1 {
                clusters.push(current);
            }
        }
        clusters
    }

    /// Detect repost clusters for one board and write `repost_count` onto
    /// the most recent posting of each cluster. The write takes the max of
    /// the existing and computed counts, so re-running over unchanged data
    /// never changes a posting.
    pub async fn detect_reposts(
        &self,
        store: &dyn Store,
        board_id: Uuid,
    ) -> Result<RepostOutcome, AnalyticsError> {
        let postings = store.list_postings(&PostingFilter::board(board_id)).await?;
        let clusters = self.clusters(postings);
        let mut outcome = RepostOutcome {
            clusters_found: clusters.len(),
            postings_updated: 0,
        };
        for cluster in &clusters {
            let Some(latest) = cluster.postings.last() else {
                continue;
            };
            let count = (cluster.postings.len() - 1) as u32;
            let count = count.max(latest.repost_count);
            if count != latest.repost_count {
                store.set_repost_count(latest.id, count).await?;
                outcome.postings_updated += 1;
            }
        }
        debug!(
            board = %board_id,
            clusters = outcome.clusters_found,
            updated = outcome.postings_updated,
            "repost detection done"
        );
        Ok(outcome)
    }

    /// Run detection over every board, continuing past per-board failures.
    /// Errs only when the board list itself cannot be read.
    pub async fn bulk_detect_all(
        &self,
        store: &dyn Store,
    ) -> Result<BulkRepostOutcome, AnalyticsError> {
        let boards = store.list_boards().await?;
        let mut outcome = BulkRepostOutcome::default();
        for board in &boards {
            match self.detect_reposts(store, board.id).await {
                Ok(per_board) => {
                    outcome.total_detected += per_board.clusters_found;
                    outcome.total_updated += per_board.postings_updated;
                }
                Err(err) => {
                    warn!(board = %board.name, %err, "repost detection failed for board");
                    outcome.total_failed += 1;
                    outcome
                        .errors
                        .push(format!("repost detection on {}: {err}", board.name));
                }
            }
        }
        Ok(outcome)
    }

    /// Read-only repost intensity stats for one board.
    pub async fn repost_stats(
        &self,
        store: &dyn Store,
        board_id: Uuid,
    ) -> Result<RepostStats, AnalyticsError> {
        let postings = store.list_postings(&PostingFilter::board(board_id)).await?;
        let total = postings.len();
        let with_reposts = postings.iter().filter(|p| p.repost_count > 0).count();
        let events: usize = postings.iter().map(|p| p.repost_count as usize).sum();
        let clusters = self.clusters(postings);
        let gaps: Vec<i64> = clusters.iter().flat_map(|c| c.gaps.iter().copied()).collect();
        let average_gap_days = if gaps.is_empty() {
            0.0
        } else {
            gaps.iter().sum::<i64>() as f64 / gaps.len() as f64
        };
        let repost_percentage = if total == 0 {
            0
        } else {
            (with_reposts as f64 / total as f64 * 100.0).round() as u32
        };
        Ok(RepostStats {
            board_id,
            total_postings: total,
            postings_with_reposts: with_reposts,
            total_repost_events: events,
            average_reposts_per_posting: if total == 0 {
                0.0
            } else {
                events as f64 / total as f64
            },
            repost_percentage,
            average_gap_days,
            severity: RepostSeverity::from_percentage(repost_percentage),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifespanOutcome {
    pub updated: usize,
    pub failed: usize,
}

/// Recompute and persist `lifespan_days` for every posting on one board.
pub async fn update_board_lifespans(
    store: &dyn Store,
    board_id: Uuid,
) -> Result<LifespanOutcome, AnalyticsError> {
    let postings = store.list_postings(&PostingFilter::board(board_id)).await?;
    let mut outcome = LifespanOutcome::default();
    for posting in &postings {
        match store.set_lifespan_days(posting.id, posting.lifespan_days()).await {
            Ok(()) => outcome.updated += 1,
            Err(err) => {
                warn!(posting = %posting.id, %err, "failed to store lifespan");
                outcome.failed += 1;
            }
        }
    }
    Ok(outcome)
}

/// Recompute lifespans for every tracked posting across all boards,
/// tolerating per-board failures.
pub async fn bulk_update_all_lifespans(
    store: &dyn Store,
) -> Result<LifespanOutcome, AnalyticsError> {
    let boards = store.list_boards().await?;
    let mut total = LifespanOutcome::default();
    for board in &boards {
        match update_board_lifespans(store, board.id).await {
            Ok(outcome) => {
                total.updated += outcome.updated;
                total.failed += outcome.failed;
            }
            Err(err) => {
                warn!(board = %board.name, %err, "lifespan recompute failed for board");
                total.failed += 1;
            }
        }
    }
    Ok(total)
}

/// Aggregate a board's lifespan distribution. A board with zero postings
/// reports all-zero stats.
pub async fn board_lifespan_stats(
    store: &dyn Store,
    board_id: Uuid,
    family_top_n: usize,
) -> Result<BoardLifespanStats, AnalyticsError> {
    let postings = store.list_postings(&PostingFilter::board(board_id)).await?;
    if postings.is_empty() {
        return Ok(BoardLifespanStats::empty(board_id));
    }

    let mut lifespans: Vec<i64> = postings.iter().map(|p| p.lifespan_days()).collect();
    lifespans.sort_unstable();
    let total = lifespans.len();
    let sum: i64 = lifespans.iter().sum();
    // Upper median: middle element at n/2 of the sorted list, no
    // interpolation for even-length lists.
    let median = lifespans[total / 2];

    let mut families: HashMap<RoleFamily, (usize, i64)> = HashMap::new();
    for posting in &postings {
        let family = posting
            .normalized_title
            .clone()
            .unwrap_or_else(RoleFamily::unknown);
        let entry = families.entry(family).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += posting.lifespan_days();
    }
    let mut by_role_family: Vec<RoleFamilyLifespan> = families
        .into_iter()
        .map(|(family, (count, days))| RoleFamilyLifespan {
            family,
            count,
            average_lifespan: days as f64 / count as f64,
        })
        .collect();
    by_role_family.sort_by(|a, b| b.count.cmp(&a.count).then(a.family.cmp(&b.family)));
    by_role_family.truncate(family_top_n);

    Ok(BoardLifespanStats {
        board_id,
        total_postings: total,
        active_postings: postings.iter().filter(|p| !p.disappeared).count(),
        disappeared_postings: postings.iter().filter(|p| p.disappeared).count(),
        average_lifespan: sum as f64 / total as f64,
        median_lifespan: median,
        min_lifespan: lifespans[0],
        max_lifespan: lifespans[total - 1],
        by_role_family,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use boardpulse_core::{
        BoardCategory, JobBoard, JobStatus, PipelineJob, PipelineRunResult, ScoredBoard,
        TrendSnapshot,
    };
    use boardpulse_store::MemoryStore;
    use chrono::{DateTime, TimeZone, Utc};
    use std::io::Write;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
            + chrono::Duration::days(i64::from(d) - 1)
    }

    fn board(name: &str) -> JobBoard {
        JobBoard {
            id: Uuid::new_v4(),
            name: name.to_string(),
            url: format!("https://{}.example.com", name.to_lowercase()),
            category: BoardCategory::Tech,
        }
    }

    fn posting(board_id: Uuid, url: &str, title: &str, first: u32, last: u32) -> JobPosting {
        JobPosting {
            id: Uuid::new_v4(),
            board_id,
            title: title.to_string(),
            normalized_title: None,
            company: "Acme".into(),
            url: url.to_string(),
            first_seen: day(first),
            last_seen: day(last),
            lifespan_days: None,
            repost_count: 0,
            disappeared: false,
        }
    }

    #[test]
    fn normalizer_maps_known_titles() {
        let n = TitleNormalizer::builtin();
        assert_eq!(n.normalize("Senior Backend Developer").as_str(), "software-engineer");
        assert_eq!(n.normalize("Machine Learning Engineer").as_str(), "data-scientist");
        assert_eq!(n.normalize("VP of Engineering").as_str(), "executive");
    }

    #[test]
    fn normalizer_exclude_keywords_defer_to_later_rules() {
        let n = TitleNormalizer::builtin();
        // "QA" blocks the software-engineer rule; the qa-testing rule claims it.
        assert_eq!(n.normalize("QA Automation Developer").as_str(), "qa-testing");
    }

    #[test]
    fn normalizer_is_total() {
        let n = TitleNormalizer::builtin();
        assert!(n.normalize("Chief Vibes Officer of Llamas").is_unknown());
        assert!(n.normalize("").is_unknown());
    }

    #[test]
    fn rules_file_overrides_builtin() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            "- family: shepherd\n  keywords: [\"llama\"]\n  exclude_keywords: [\"alpaca\"]\n"
        )
        .unwrap();
        let n = TitleNormalizer::from_rules_file(file.path()).unwrap();
        assert_eq!(n.normalize("Senior Llama Wrangler").as_str(), "shepherd");
        assert!(n.normalize("Llama and Alpaca Wrangler").is_unknown());
        assert!(n.normalize("Backend Developer").is_unknown());
    }

    #[test]
    fn similarity_same_family_scores_high() {
        let n = TitleNormalizer::builtin();
        let s = n.similarity("Backend Developer", "Senior Backend Developer");
        assert!((s - 0.9).abs() < f64::EPSILON);
        assert!(n.similarity("zzzz", "Backend Developer") < 0.5);
    }

    #[tokio::test]
    async fn bulk_normalize_tags_untagged_postings_only() {
        let store = MemoryStore::new();
        let b = board("DevJobs");
        store.upsert_board(&b).await.unwrap();
        let mut tagged = posting(b.id, "https://d.example/1", "Backend Developer", 1, 5);
        tagged.normalized_title = Some(RoleFamily::new("hand-tagged"));
        store.upsert_posting(&tagged).await.unwrap();
        store
            .upsert_posting(&posting(b.id, "https://d.example/2", "UX Designer", 1, 5))
            .await
            .unwrap();

        let outcome = bulk_normalize_titles(&store, &TitleNormalizer::builtin())
            .await
            .unwrap();
        assert_eq!(outcome, NormalizeOutcome { updated: 1, failed: 0 });

        let rows = store.list_postings(&PostingFilter::board(b.id)).await.unwrap();
        let families: HashMap<_, _> = rows
            .iter()
            .map(|p| (p.url.as_str(), p.normalized_title.clone().unwrap()))
            .collect();
        assert_eq!(families["https://d.example/1"].as_str(), "hand-tagged");
        assert_eq!(families["https://d.example/2"].as_str(), "designer");
    }

    #[tokio::test]
    async fn repost_detection_links_gap_within_window() {
        let store = MemoryStore::new();
        let b = board("DevJobs");
        store.upsert_board(&b).await.unwrap();
        // Visible days 1-10, gone, visible again days 25-30: gap is 15 days.
        store
            .upsert_posting(&posting(b.id, "https://d.example/1", "Backend Developer", 1, 10))
            .await
            .unwrap();
        store
            .upsert_posting(&posting(b.id, "https://d.example/2", "Backend Developer", 25, 30))
            .await
            .unwrap();
        bulk_normalize_titles(&store, &TitleNormalizer::builtin())
            .await
            .unwrap();

        let detector = RepostDetector::new(TitleNormalizer::builtin(), RepostConfig::default());
        let outcome = detector.detect_reposts(&store, b.id).await.unwrap();
        assert_eq!(outcome.clusters_found, 1);
        assert_eq!(outcome.postings_updated, 1);

        let rows = store.list_postings(&PostingFilter::board(b.id)).await.unwrap();
        assert_eq!(rows[0].repost_count, 0, "original posting untouched");
        assert_eq!(rows[1].repost_count, 1, "reappearance carries the count");
    }

    #[tokio::test]
    async fn repost_detection_ignores_short_and_huge_gaps() {
        let store = MemoryStore::new();
        let b = board("DevJobs");
        store.upsert_board(&b).await.unwrap();
        // 1-day gap is scrape noise.
        store
            .upsert_posting(&posting(b.id, "https://d.example/1", "SRE", 1, 10))
            .await
            .unwrap();
        store
            .upsert_posting(&posting(b.id, "https://d.example/2", "SRE", 11, 12))
            .await
            .unwrap();
        bulk_normalize_titles(&store, &TitleNormalizer::builtin())
            .await
            .unwrap();

        let config = RepostConfig {
            max_gap_days: 5,
            ..RepostConfig::default()
        };
        let detector = RepostDetector::new(TitleNormalizer::builtin(), config);
        let outcome = detector.detect_reposts(&store, b.id).await.unwrap();
        assert_eq!(outcome.clusters_found, 0);
    }

    #[tokio::test]
    async fn repost_detection_is_idempotent_on_unchanged_data() {
        let store = MemoryStore::new();
        let b = board("DevJobs");
        store.upsert_board(&b).await.unwrap();
        for (url, first, last) in [
            ("https://d.example/1", 1, 10),
            ("https://d.example/2", 25, 30),
            ("https://d.example/3", 40, 45),
        ] {
            store
                .upsert_posting(&posting(b.id, url, "Backend Developer", first, last))
                .await
                .unwrap();
        }
        bulk_normalize_titles(&store, &TitleNormalizer::builtin())
            .await
            .unwrap();

        let detector = RepostDetector::new(TitleNormalizer::builtin(), RepostConfig::default());
        detector.bulk_detect_all(&store).await.unwrap();
        let before: Vec<u32> = store
            .list_postings(&PostingFilter::board(b.id))
            .await
            .unwrap()
            .iter()
            .map(|p| p.repost_count)
            .collect();

        let second = detector.bulk_detect_all(&store).await.unwrap();
        let after: Vec<u32> = store
            .list_postings(&PostingFilter::board(b.id))
            .await
            .unwrap()
            .iter()
            .map(|p| p.repost_count)
            .collect();
        assert_eq!(before, after);
        assert_eq!(second.total_updated, 0);
        assert_eq!(before, vec![0, 0, 2]);
    }

    /// Store wrapper whose posting reads fail for one poisoned board.
    struct FlakyStore {
        inner: MemoryStore,
        poisoned: Uuid,
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn upsert_board(&self, b: &JobBoard) -> Result<(), StoreError> {
            self.inner.upsert_board(b).await
        }
        async fn list_boards(&self) -> Result<Vec<JobBoard>, StoreError> {
            self.inner.list_boards().await
        }
        async fn get_board(&self, id: Uuid) -> Result<Option<JobBoard>, StoreError> {
            self.inner.get_board(id).await
        }
        async fn upsert_posting(
            &self,
            p: &JobPosting,
        ) -> Result<(JobPosting, bool), StoreError> {
            self.inner.upsert_posting(p).await
        }
        async fn list_postings(
            &self,
            filter: &PostingFilter,
        ) -> Result<Vec<JobPosting>, StoreError> {
            if filter.board_id == Some(self.poisoned) {
                return Err(StoreError::NotFound("poisoned board".into()));
            }
            self.inner.list_postings(filter).await
        }
        async fn set_normalized_title(
            &self,
            id: Uuid,
            f: &RoleFamily,
        ) -> Result<(), StoreError> {
            self.inner.set_normalized_title(id, f).await
        }
        async fn set_repost_count(&self, id: Uuid, c: u32) -> Result<(), StoreError> {
            self.inner.set_repost_count(id, c).await
        }
        async fn set_lifespan_days(&self, id: Uuid, d: i64) -> Result<(), StoreError> {
            self.inner.set_lifespan_days(id, d).await
        }
        async fn set_disappeared(&self, id: Uuid, v: bool) -> Result<(), StoreError> {
            self.inner.set_disappeared(id, v).await
        }
        async fn upsert_score(&self, s: &ScoredBoard) -> Result<(), StoreError> {
            self.inner.upsert_score(s).await
        }
        async fn list_scores(&self) -> Result<Vec<ScoredBoard>, StoreError> {
            self.inner.list_scores().await
        }
        async fn upsert_snapshot(&self, s: &TrendSnapshot) -> Result<(), StoreError> {
            self.inner.upsert_snapshot(s).await
        }
        async fn list_snapshots(&self, id: Uuid) -> Result<Vec<TrendSnapshot>, StoreError> {
            self.inner.list_snapshots(id).await
        }
        async fn insert_job(&self, j: &PipelineJob) -> Result<(), StoreError> {
            self.inner.insert_job(j).await
        }
        async fn update_job(
            &self,
            id: Uuid,
            s: JobStatus,
            e: Option<String>,
        ) -> Result<(), StoreError> {
            self.inner.update_job(id, s, e).await
        }
        async fn list_pending_jobs(&self) -> Result<Vec<PipelineJob>, StoreError> {
            self.inner.list_pending_jobs().await
        }
        async fn upsert_run(&self, r: &PipelineRunResult) -> Result<(), StoreError> {
            self.inner.upsert_run(r).await
        }
        async fn list_runs(&self, limit: usize) -> Result<Vec<PipelineRunResult>, StoreError> {
            self.inner.list_runs(limit).await
        }
    }

    #[tokio::test]
    async fn bulk_detect_continues_past_a_failing_board() {
        let inner = MemoryStore::new();
        let good = board("DevJobs");
        let bad = board("OpsJobs");
        inner.upsert_board(&good).await.unwrap();
        inner.upsert_board(&bad).await.unwrap();
        inner
            .upsert_posting(&posting(good.id, "https://d.example/1", "Backend Developer", 1, 10))
            .await
            .unwrap();
        inner
            .upsert_posting(&posting(good.id, "https://d.example/2", "Backend Developer", 25, 30))
            .await
            .unwrap();
        bulk_normalize_titles(&inner, &TitleNormalizer::builtin())
            .await
            .unwrap();
        let store = FlakyStore {
            inner,
            poisoned: bad.id,
        };

        let detector = RepostDetector::new(TitleNormalizer::builtin(), RepostConfig::default());
        let outcome = detector.bulk_detect_all(&store).await.unwrap();
        assert_eq!(outcome.total_failed, 1);
        assert_eq!(outcome.total_detected, 1);
        assert_eq!(outcome.total_updated, 1);
        assert_eq!(outcome.errors.len(), 1);
    }

    #[tokio::test]
    async fn repost_stats_classifies_severity() {
        let store = MemoryStore::new();
        let b = board("DevJobs");
        store.upsert_board(&b).await.unwrap();
        store
            .upsert_posting(&posting(b.id, "https://d.example/1", "Backend Developer", 1, 10))
            .await
            .unwrap();
        store
            .upsert_posting(&posting(b.id, "https://d.example/2", "Backend Developer", 25, 30))
            .await
            .unwrap();
        bulk_normalize_titles(&store, &TitleNormalizer::builtin())
            .await
            .unwrap();
        let detector = RepostDetector::new(TitleNormalizer::builtin(), RepostConfig::default());
        detector.detect_reposts(&store, b.id).await.unwrap();

        let stats = detector.repost_stats(&store, b.id).await.unwrap();
        assert_eq!(stats.total_postings, 2);
        assert_eq!(stats.postings_with_reposts, 1);
        assert_eq!(stats.total_repost_events, 1);
        assert_eq!(stats.repost_percentage, 50);
        assert_eq!(stats.severity, RepostSeverity::High);
        assert!((stats.average_gap_days - 15.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn lifespan_stats_pin_upper_median() {
        let store = MemoryStore::new();
        let b = board("DevJobs");
        store.upsert_board(&b).await.unwrap();
        // Lifespans 2, 4, 6, 8 days: upper median picks 6, not 5.
        for (i, (first, last)) in [(1, 3), (1, 5), (1, 7), (1, 9)].iter().enumerate() {
            store
                .upsert_posting(&posting(
                    b.id,
                    &format!("https://d.example/{i}"),
                    "Backend Developer",
                    *first,
                    *last,
                ))
                .await
                .unwrap();
        }

        let stats = board_lifespan_stats(&store, b.id, DEFAULT_FAMILY_TOP_N)
            .await
            .unwrap();
        assert_eq!(stats.total_postings, 4);
        assert_eq!(stats.median_lifespan, 6);
        assert_eq!(stats.min_lifespan, 2);
        assert_eq!(stats.max_lifespan, 8);
        assert!((stats.average_lifespan - 5.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn lifespan_stats_empty_board_is_all_zero() {
        let store = MemoryStore::new();
        let b = board("GhostJobs");
        store.upsert_board(&b).await.unwrap();
        let stats = board_lifespan_stats(&store, b.id, DEFAULT_FAMILY_TOP_N)
            .await
            .unwrap();
        assert_eq!(stats, BoardLifespanStats::empty(b.id));
    }

    #[tokio::test]
    async fn lifespan_family_breakdown_counts_sum_to_total() {
        let store = MemoryStore::new();
        let b = board("DevJobs");
        store.upsert_board(&b).await.unwrap();
        let titles = [
            "Backend Developer",
            "Frontend Developer",
            "UX Designer",
            "Chief Vibes Officer of Llamas",
        ];
        for (i, title) in titles.iter().enumerate() {
            store
                .upsert_posting(&posting(b.id, &format!("https://d.example/{i}"), title, 1, 5))
                .await
                .unwrap();
        }
        bulk_normalize_titles(&store, &TitleNormalizer::builtin())
            .await
            .unwrap();

        let stats = board_lifespan_stats(&store, b.id, DEFAULT_FAMILY_TOP_N)
            .await
            .unwrap();
        let family_sum: usize = stats.by_role_family.iter().map(|f| f.count).sum();
        assert_eq!(family_sum, stats.total_postings);
        assert_eq!(stats.by_role_family[0].family.as_str(), "software-engineer");
        assert_eq!(stats.by_role_family[0].count, 2);
    }

    #[tokio::test]
    async fn bulk_lifespan_update_persists_computed_days() {
        let store = MemoryStore::new();
        let b = board("DevJobs");
        store.upsert_board(&b).await.unwrap();
        store
            .upsert_posting(&posting(b.id, "https://d.example/1", "Backend Developer", 1, 8))
            .await
            .unwrap();

        let outcome = bulk_update_all_lifespans(&store).await.unwrap();
        assert_eq!(outcome, LifespanOutcome { updated: 1, failed: 0 });
        let rows = store.list_postings(&PostingFilter::board(b.id)).await.unwrap();
        assert_eq!(rows[0].lifespan_days, Some(7));
    }
}
