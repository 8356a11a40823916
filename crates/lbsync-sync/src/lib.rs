//! Update pipeline: paginated fetch, incremental run resync, verifier lookup
//! and static reference refresh.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lbsync_core::{record_id, GameConfig, LeaderboardConfig, SourceRef};
use lbsync_storage::{
    cooldown, load_leaderboard_config, FetchError, HttpClientConfig, HttpFetcher, JsonSource,
    SnapshotStore,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lbsync-sync";

/// Page size for paginated run fetches.
pub const PAGE_SIZE: usize = 200;

/// Candidates below this snap straight to a full refetch.
pub const FULL_REFETCH_BELOW: usize = 100;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub config_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("LBSYNC_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let config_path = std::env::var("LBSYNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| workspace_root.join("leaderboard.yaml"));
        Self {
            workspace_root,
            config_path,
            user_agent: std::env::var("LBSYNC_USER_AGENT")
                .unwrap_or_else(|_| "lbsync/0.1".to_string()),
            http_timeout_secs: std::env::var("LBSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

/// Split a page envelope into its `data` records and its `rel == "next"` link.
///
/// A page without a `data` array (such as the empty object of a 404) has no
/// records and no next link. Probes rely on this; [`Paginator`] rejects such pages.
pub fn split_page(page: JsonValue) -> (Vec<JsonValue>, Option<String>) {
    let JsonValue::Object(mut map) = page else {
        return (Vec::new(), None);
    };
    let next = map
        .get("pagination")
        .and_then(|p| p.get("links"))
        .and_then(JsonValue::as_array)
        .and_then(|links| {
            links
                .iter()
                .find(|link| link.get("rel").and_then(JsonValue::as_str) == Some("next"))
        })
        .and_then(|link| link.get("uri"))
        .and_then(JsonValue::as_str)
        .map(ToString::to_string);
    match map.remove("data") {
        Some(JsonValue::Array(records)) => (records, next),
        _ => (Vec::new(), None),
    }
}

/// Follows `next` links from a starting URL and concatenates every page's records.
///
/// Every page must carry a `data` array. A page without one (a 404 mid-chain
/// included) fails the whole collection so no truncated list escapes.
pub struct Paginator<'a, S: JsonSource + ?Sized> {
    source: &'a S,
}

impl<'a, S: JsonSource + ?Sized> Paginator<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self { source }
    }

    pub async fn collect(&self, start_url: &str) -> Result<Vec<JsonValue>, FetchError> {
        let mut records = Vec::new();
        let mut next = Some(start_url.to_string());
        while let Some(url) = next {
            info!(url = %url, fetched = records.len(), "fetching page");
            let page = self.source.get_json(&url).await?;
            if !page.get("data").is_some_and(JsonValue::is_array) {
                warn!(url = %url, fetched = records.len(), "page without data; aborting");
                return Err(FetchError::MissingData { url });
            }
            let (data, link) = split_page(page);
            records.extend(data);
            next = link;
            if next.is_some() {
                cooldown().await;
            }
        }
        Ok(records)
    }
}

/// Runs collection of one game, ordered by submission time ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunsEndpoint {
    api_base: String,
    game_id: String,
}

impl RunsEndpoint {
    pub fn new(api_base: impl Into<String>, game_id: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            game_id: game_id.into(),
        }
    }

    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    pub fn url(&self, offset: usize, max: usize) -> String {
        format!(
            "{}/runs?game={}&offset={offset}&max={max}&orderby=submitted&direction=asc&embed=players",
            self.api_base, self.game_id
        )
    }
}

/// Next resume candidate after a failed probe: 80% of `n`, or 0 once below 100.
pub fn shrink_offset(n: usize) -> usize {
    let next = n / 5 * 4 + n % 5 * 4 / 5;
    if next < FULL_REFETCH_BELOW {
        0
    } else {
        next
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub runs: Vec<JsonValue>,
    /// Every resume offset tried, in order; the last one is where fetching resumed.
    pub candidates: Vec<usize>,
    pub resume_offset: usize,
    pub fetched: usize,
}

impl SyncOutcome {
    pub fn failed_probes(&self) -> usize {
        self.candidates.len().saturating_sub(1)
    }
}

/// Resyncs a stored run list against the remote ordering with as few calls as possible.
pub struct SyncEngine<'a, S: JsonSource + ?Sized> {
    source: &'a S,
    endpoint: RunsEndpoint,
}

impl<'a, S: JsonSource + ?Sized> SyncEngine<'a, S> {
    pub fn new(source: &'a S, endpoint: RunsEndpoint) -> Self {
        Self { source, endpoint }
    }

    /// Find the largest still-valid prefix of `stored`, keep it, and append
    /// everything the remote has after it.
    pub async fn sync(&self, mut stored: Vec<JsonValue>) -> Result<SyncOutcome, FetchError> {
        let mut candidates = Vec::new();
        let mut offset = stored.len();
        loop {
            candidates.push(offset);
            if offset == 0 {
                break;
            }
            if self.probe_matches(offset - 1, &stored[offset - 1]).await? {
                break;
            }
            offset = shrink_offset(offset);
        }

        stored.truncate(offset);
        info!(game = self.endpoint.game_id(), offset, "resuming run fetch");
        let fresh = Paginator::new(self.source)
            .collect(&self.endpoint.url(offset, PAGE_SIZE))
            .await?;
        let fetched = fresh.len();
        stored.extend(fresh);

        Ok(SyncOutcome {
            runs: stored,
            candidates,
            resume_offset: offset,
            fetched,
        })
    }

    async fn probe_matches(&self, offset: usize, expected: &JsonValue) -> Result<bool, FetchError> {
        info!(game = self.endpoint.game_id(), offset, "probing run");
        let page = self.source.get_json(&self.endpoint.url(offset, 1)).await?;
        cooldown().await;

        let (data, _) = split_page(page);
        let remote = data.first().and_then(record_id);
        let matches = remote.is_some() && remote == record_id(expected);
        if !matches {
            info!(
                game = self.endpoint.game_id(),
                offset,
                remote = remote.unwrap_or("<none>"),
                stored = record_id(expected).unwrap_or("<none>"),
                "stored prefix diverged"
            );
        }
        Ok(matches)
    }
}

/// Examiners that never appear as an identified run player, sorted by id.
pub fn missing_verifiers<'a>(snapshots: impl IntoIterator<Item = &'a [JsonValue]>) -> Vec<String> {
    let mut examiners = BTreeSet::new();
    let mut players = BTreeSet::new();
    for run in snapshots.into_iter().flatten() {
        if let Some(examiner) = run
            .get("status")
            .and_then(|s| s.get("examiner"))
            .and_then(JsonValue::as_str)
        {
            examiners.insert(examiner.to_string());
        }
        let embedded = run.get("players").map(|p| p.get("data").unwrap_or(p));
        for player in embedded.and_then(JsonValue::as_array).into_iter().flatten() {
            if let Some(id) = record_id(player) {
                players.insert(id.to_string());
            }
        }
    }
    examiners.difference(&players).cloned().collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct GameSyncReport {
    pub game_id: String,
    pub runs_file: String,
    pub stored_before: usize,
    pub resume_offset: usize,
    pub failed_probes: usize,
    pub fetched: usize,
    pub total: usize,
    pub snapshot_hash: String,
    pub unchanged: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub games: Vec<GameSyncReport>,
    pub verifiers_missing: usize,
    pub verifiers_fetched: usize,
    pub users_file: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StaticRefreshSummary {
    pub files_written: Vec<String>,
    pub files_skipped: Vec<String>,
    pub categories: usize,
}

pub struct UpdatePipeline<S: JsonSource> {
    config: LeaderboardConfig,
    store: SnapshotStore,
    source: S,
}

impl UpdatePipeline<HttpFetcher> {
    pub async fn from_sync_config(sync: &SyncConfig) -> Result<Self> {
        let config = load_leaderboard_config(&sync.config_path).await?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(sync.http_timeout_secs),
            user_agent: Some(sync.user_agent.clone()),
        })?;
        Ok(Self::new(
            config,
            SnapshotStore::new(sync.workspace_root.clone()),
            http,
        ))
    }
}

impl<S: JsonSource> UpdatePipeline<S> {
    pub fn new(config: LeaderboardConfig, store: SnapshotStore, source: S) -> Self {
        Self {
            config,
            store,
            source,
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    /// Resync every configured game's runs snapshot, then fetch verifiers
    /// that are not themselves run players.
    pub async fn update_all_runs(&self) -> Result<UpdateSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let mut games = Vec::with_capacity(self.config.games.len());
        let mut snapshots = Vec::with_capacity(self.config.games.len());
        for game in &self.config.games {
            let (report, runs) = self
                .sync_game(game)
                .instrument(info_span!("sync_game", %run_id, game = %game.id))
                .await?;
            games.push(report);
            snapshots.push(runs);
            cooldown().await;
        }

        let missing = missing_verifiers(snapshots.iter().map(Vec::as_slice));
        info!(count = missing.len(), "fetching verifiers without runs");
        let users = self.fetch_users(&missing).await?;
        self.store
            .write(&self.config.users_file, &users)
            .await
            .with_context(|| format!("writing {}", self.config.users_file))?;

        Ok(UpdateSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            games,
            verifiers_missing: missing.len(),
            verifiers_fetched: users.len(),
            users_file: self.config.users_file.clone(),
        })
    }

    async fn sync_game(&self, game: &GameConfig) -> Result<(GameSyncReport, Vec<JsonValue>)> {
        let stored: Vec<JsonValue> = self.store.read_or_default(&game.runs_file).await;
        let stored_before = stored.len();
        info!(file = %game.runs_file, stored = stored_before, "syncing runs");

        let engine = SyncEngine::new(
            &self.source,
            RunsEndpoint::new(self.config.api_base.clone(), game.id.clone()),
        );
        let outcome = engine
            .sync(stored)
            .await
            .with_context(|| format!("syncing runs for game {}", game.id))?;

        let written = self
            .store
            .write(&game.runs_file, &outcome.runs)
            .await
            .with_context(|| format!("writing {}", game.runs_file))?;
        info!(
            file = %game.runs_file,
            total = outcome.runs.len(),
            fetched = outcome.fetched,
            resume_offset = outcome.resume_offset,
            unchanged = written.unchanged,
            "runs snapshot written"
        );

        let report = GameSyncReport {
            game_id: game.id.clone(),
            runs_file: game.runs_file.clone(),
            stored_before,
            resume_offset: outcome.resume_offset,
            failed_probes: outcome.failed_probes(),
            fetched: outcome.fetched,
            total: outcome.runs.len(),
            snapshot_hash: written.content_hash,
            unchanged: written.unchanged,
        };
        Ok((report, outcome.runs))
    }

    async fn fetch_users(&self, ids: &[String]) -> Result<BTreeMap<String, JsonValue>> {
        let mut users = BTreeMap::new();
        for id in ids {
            let url = self.api_url(&format!("users/{id}"));
            info!(user = %id, "fetching verifier");
            let mut response = self
                .source
                .get_json(&url)
                .await
                .with_context(|| format!("fetching verifier {id}"))?;
            if let Some(data) = response.as_object_mut().and_then(|m| m.remove("data")) {
                users.insert(id.clone(), data);
            }
            cooldown().await;
        }
        Ok(users)
    }

    /// Refresh platforms, regions, per-game levels and per-category variable listings.
    pub async fn refresh_static(&self) -> Result<StaticRefreshSummary> {
        let mut targets = vec![
            (self.config.platforms_file.clone(), "platforms?max=200".to_string()),
            (self.config.regions_file.clone(), "regions?max=200".to_string()),
        ];
        for game in &self.config.games {
            targets.push((game.levels_file.clone(), format!("games/{}/levels", game.id)));
        }

        let mut files_written = Vec::new();
        let mut files_skipped = Vec::new();
        for (file, path) in targets {
            let url = self.api_url(&path);
            info!(file = %file, url = %url, "refreshing static snapshot");
            let response = self
                .source
                .get_json(&url)
                .await
                .with_context(|| format!("fetching {url}"))?;
            if response.get("data").is_some() {
                self.store
                    .write(&file, &response)
                    .await
                    .with_context(|| format!("writing {file}"))?;
                files_written.push(file);
            } else {
                warn!(file = %file, url = %url, "no data returned; keeping previous snapshot");
                files_skipped.push(file);
            }
            cooldown().await;
        }

        let category_ids: Vec<SourceRef> = self
            .store
            .read(&self.config.category_ids_file)
            .await
            .context("reading category id listing")?;
        let mut listings = BTreeMap::new();
        for category in &category_ids {
            let url = self.api_url(&format!("categories/{}/variables", category.id));
            info!(category = %category.id, "fetching category variables");
            let mut response = self
                .source
                .get_json(&url)
                .await
                .with_context(|| format!("fetching {url}"))?;
            if let Some(data) = response.as_object_mut().and_then(|m| m.remove("data")) {
                listings.insert(category.id.clone(), data);
            }
            cooldown().await;
        }
        self.store
            .write(&self.config.category_variables_file, &listings)
            .await
            .with_context(|| format!("writing {}", self.config.category_variables_file))?;
        files_written.push(self.config.category_variables_file.clone());

        Ok(StaticRefreshSummary {
            files_written,
            files_skipped,
            categories: listings.len(),
        })
    }
}
