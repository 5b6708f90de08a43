//! Scrape adapter contracts + the fixture-backed adapter used in demo runs.
//!
//! Adapters produce [`RawPosting`]s; `ingest_board` owns the upsert and
//! disappearance bookkeeping so every adapter stays a pure source of rows.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use boardpulse_core::{JobBoard, JobPosting, ScrapeOutcome};
use boardpulse_store::{PostingFilter, Store, StoreError};

pub const CRATE_NAME: &str = "boardpulse-scrapers";

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("no adapter registered for board {0}")]
    NoAdapter(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Per-run context handed to every adapter invocation.
#[derive(Debug, Clone, Copy)]
pub struct ScrapeContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// One listing as an adapter sees it, before it becomes a stored posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPosting {
    pub title: String,
    pub company: String,
    pub url: String,
}

/// A source of current listings for one board.
#[async_trait]
pub trait ScrapeAdapter: Send + Sync {
    fn board_name(&self) -> &str;

    async fn scrape(&self, ctx: &ScrapeContext) -> Result<Vec<RawPosting>, ScrapeError>;
}

/// Adapter that replays a captured JSON listing file. Used for demo runs
/// and as the deterministic source in tests.
pub struct FixtureAdapter {
    board_name: String,
    path: PathBuf,
}

impl FixtureAdapter {
    pub fn new(board_name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            board_name: board_name.into(),
            path: path.into(),
        }
    }

    /// Adapter over an in-memory listing, bypassing the filesystem.
    pub fn from_postings(board_name: impl Into<String>, postings: Vec<RawPosting>) -> InlineAdapter {
        InlineAdapter {
            board_name: board_name.into(),
            postings,
        }
    }

    fn load(&self) -> Result<Vec<RawPosting>, ScrapeError> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("reading fixture {}", self.path.display()))?;
        let postings: Vec<RawPosting> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing fixture {}", self.path.display()))?;
        Ok(postings)
    }
}

#[async_trait]
impl ScrapeAdapter for FixtureAdapter {
    fn board_name(&self) -> &str {
        &self.board_name
    }

    async fn scrape(&self, _ctx: &ScrapeContext) -> Result<Vec<RawPosting>, ScrapeError> {
        self.load()
    }
}

/// Fixed listing adapter for tests and seeded demos.
pub struct InlineAdapter {
    board_name: String,
    postings: Vec<RawPosting>,
}

#[async_trait]
impl ScrapeAdapter for InlineAdapter {
    fn board_name(&self) -> &str {
        &self.board_name
    }

    async fn scrape(&self, _ctx: &ScrapeContext) -> Result<Vec<RawPosting>, ScrapeError> {
        Ok(self.postings.clone())
    }
}

/// Name-keyed adapter lookup the orchestrator scrapes through.
#[derive(Default)]
pub struct ScraperRegistry {
    adapters: HashMap<String, Arc<dyn ScrapeAdapter>>,
}

impl ScraperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ScrapeAdapter>) {
        self.adapters
            .insert(adapter.board_name().to_string(), adapter);
    }

    pub fn get(&self, board_name: &str) -> Option<Arc<dyn ScrapeAdapter>> {
        self.adapters.get(board_name).cloned()
    }

    pub fn board_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    /// Load a `FixtureAdapter` per `<board>.json` file in `dir`.
    pub fn from_fixture_dir(dir: &Path) -> Result<Self, ScrapeError> {
        let mut registry = Self::new();
        let entries = fs::read_dir(dir)
            .with_context(|| format!("reading fixture dir {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            registry.register(Arc::new(FixtureAdapter::new(stem, &path)));
        }
        Ok(registry)
    }
}

/// Scrape one board and reconcile the store against the current listing:
/// every raw posting is upserted on `(board_id, url)`, and previously live
/// postings absent from the listing are marked disappeared.
pub async fn ingest_board(
    store: &dyn Store,
    board: &JobBoard,
    adapter: &dyn ScrapeAdapter,
    ctx: &ScrapeContext,
) -> Result<ScrapeOutcome, ScrapeError> {
    let started = Utc::now();
    let raw = adapter.scrape(ctx).await?;
    let mut seen_urls = HashSet::with_capacity(raw.len());
    let mut new_jobs = 0usize;

    for listing in &raw {
        seen_urls.insert(listing.url.clone());
        let candidate = JobPosting {
            id: Uuid::new_v4(),
            board_id: board.id,
            title: listing.title.clone(),
            normalized_title: None,
            company: listing.company.clone(),
            url: listing.url.clone(),
            first_seen: ctx.fetched_at,
            last_seen: ctx.fetched_at,
            lifespan_days: None,
            repost_count: 0,
            disappeared: false,
        };
        let (_, created) = store.upsert_posting(&candidate).await?;
        if created {
            new_jobs += 1;
        }
    }

    let mut live = PostingFilter::board(board.id);
    live.disappeared = Some(false);
    let mut vanished = 0usize;
    for posting in store.list_postings(&live).await? {
        if !seen_urls.contains(&posting.url) {
            store.set_disappeared(posting.id, true).await?;
            vanished += 1;
        }
    }
    if vanished > 0 {
        warn!(board = %board.name, vanished, "postings no longer listed");
    }

    let outcome = ScrapeOutcome {
        board_name: board.name.clone(),
        jobs_scraped: raw.len(),
        new_jobs,
        duration: Utc::now().signed_duration_since(started),
        errors: Vec::new(),
    };
    info!(
        board = %board.name,
        scraped = outcome.jobs_scraped,
        new = outcome.new_jobs,
        "scrape complete"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use boardpulse_core::BoardCategory;
    use boardpulse_store::MemoryStore;
    use chrono::TimeZone;
    use std::io::Write;

    fn ctx(day: u32) -> ScrapeContext {
        ScrapeContext {
            run_id: Uuid::new_v4(),
            fetched_at: Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).single().unwrap(),
        }
    }

    fn board() -> JobBoard {
        JobBoard {
            id: Uuid::new_v4(),
            name: "DevJobs".into(),
            url: "https://devjobs.example.com".into(),
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

    #[tokio::test]
    async fn ingest_upserts_and_flags_vanished_postings() {
        let store = MemoryStore::new();
        let b = board();
        store.upsert_board(&b).await.unwrap();

        let day1 = FixtureAdapter::from_postings(
            "DevJobs",
            vec![raw("https://d.example/1", "Backend Developer"),
                 raw("https://d.example/2", "Data Analyst")],
        );
        let outcome = ingest_board(&store, &b, &day1, &ctx(1)).await.unwrap();
        assert_eq!(outcome.jobs_scraped, 2);
        assert_eq!(outcome.new_jobs, 2);

        // Second sweep: /1 still listed, /2 gone, /3 new.
        let day2 = FixtureAdapter::from_postings(
            "DevJobs",
            vec![raw("https://d.example/1", "Backend Developer"),
                 raw("https://d.example/3", "SRE")],
        );
        let outcome = ingest_board(&store, &b, &day2, &ctx(2)).await.unwrap();
        assert_eq!(outcome.jobs_scraped, 2);
        assert_eq!(outcome.new_jobs, 1);

        let all = store.list_postings(&PostingFilter::board(b.id)).await.unwrap();
        assert_eq!(all.len(), 3);
        let by_url: HashMap<_, _> = all.iter().map(|p| (p.url.as_str(), p)).collect();
        assert!(!by_url["https://d.example/1"].disappeared);
        assert!(by_url["https://d.example/2"].disappeared);
        assert_eq!(by_url["https://d.example/1"].last_seen, ctx(2).fetched_at);
        assert_eq!(by_url["https://d.example/1"].first_seen, ctx(1).fetched_at);
    }

    #[tokio::test]
    async fn fixture_adapter_reads_json_listing() {
        let mut file = tempfile::Builder::new()
            .suffix(".json")
            .tempfile()
            .unwrap();
        write!(
            file,
            r#"[{{"title":"Backend Developer","company":"Acme","url":"https://d.example/1"}}]"#
        )
        .unwrap();

        let adapter = FixtureAdapter::new("DevJobs", file.path());
        let postings = adapter.scrape(&ctx(1)).await.unwrap();
        assert_eq!(postings.len(), 1);
        assert_eq!(postings[0].title, "Backend Developer");
    }

    #[tokio::test]
    async fn registry_builds_from_fixture_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("DevJobs.json"),
            r#"[{"title":"SRE","company":"Acme","url":"https://d.example/9"}]"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = ScraperRegistry::from_fixture_dir(dir.path()).unwrap();
        assert_eq!(registry.board_names(), vec!["DevJobs".to_string()]);
        let adapter = registry.get("DevJobs").unwrap();
        let postings = adapter.scrape(&ctx(1)).await.unwrap();
        assert_eq!(postings[0].url, "https://d.example/9");
    }
}
