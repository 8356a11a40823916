//! Relational build: SQLite bulk loader and the snapshot → database pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lbsync_core::{
    CategoryVariablesSnapshot, DataEnvelope, LeaderboardConfig, SourceGame, SourceLevel,
    SourcePlatform, SourceRegion, SourceRun, Table, TableRow, UsersSnapshot,
};
use lbsync_storage::{load_leaderboard_config, SnapshotStore};
use lbsync_transform as transform;
use lbsync_transform::EntityDeduplicator;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lbsync-build";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("table {0} does not exist")]
    UnknownTable(String),
    #[error("row {index} for {table} does not match its columns (missing: {missing:?}, extra: {extra:?})")]
    ColumnMismatch {
        table: String,
        index: usize,
        missing: Vec<String>,
        extra: Vec<String>,
    },
    #[error("row {index} for {table} does not serialize to an object")]
    NotAnObject { table: String, index: usize },
    #[error("serializing row {index} for {table}: {source}")]
    Serialize {
        table: String,
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Parameterized insert covering exactly `columns`, in order.
pub fn insert_statement(table: &str, columns: &[String]) -> String {
    let names = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let params = vec!["?"; columns.len()].join(", ");
    format!("INSERT INTO {} ({names}) VALUES ({params})", quote_ident(table))
}

/// Serialize `row` and return its values in column order, rejecting any key drift.
fn row_values<R: Serialize>(
    table: &str,
    index: usize,
    row: &R,
    columns: &[String],
) -> Result<Vec<JsonValue>, LoadError> {
    let value = serde_json::to_value(row).map_err(|source| LoadError::Serialize {
        table: table.to_string(),
        index,
        source,
    })?;
    let JsonValue::Object(mut map) = value else {
        return Err(LoadError::NotAnObject {
            table: table.to_string(),
            index,
        });
    };

    let expected: BTreeSet<&str> = columns.iter().map(String::as_str).collect();
    let actual: BTreeSet<&str> = map.keys().map(String::as_str).collect();
    if expected != actual {
        return Err(LoadError::ColumnMismatch {
            table: table.to_string(),
            index,
            missing: expected.difference(&actual).map(|s| s.to_string()).collect(),
            extra: actual.difference(&expected).map(|s| s.to_string()).collect(),
        });
    }

    Ok(columns
        .iter()
        .map(|c| map.remove(c).unwrap_or(JsonValue::Null))
        .collect())
}

fn bind_json<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: JsonValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        JsonValue::Null => query.bind(None::<String>),
        JsonValue::Bool(b) => query.bind(i64::from(b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        JsonValue::String(s) => query.bind(s),
        other => query.bind(other.to_string()),
    }
}

/// Inserts typed rows into tables whose columns are discovered at runtime.
#[derive(Debug, Clone)]
pub struct BulkLoader {
    pool: SqlitePool,
}

impl BulkLoader {
    /// Open (creating if needed) a database file. One connection: the build is sequential.
    pub async fn open(path: &Path) -> Result<Self, LoadError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, LoadError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run a multi-statement SQL script verbatim.
    pub async fn execute_script(&self, sql: &str) -> Result<(), LoadError> {
        sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn table_columns(&self, table: &str) -> Result<Vec<String>, LoadError> {
        let rows = sqlx::query("SELECT name FROM pragma_table_info(?) ORDER BY cid")
            .bind(table)
            .fetch_all(&self.pool)
            .await?;
        let columns = rows
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<Result<Vec<_>, _>>()?;
        if columns.is_empty() {
            return Err(LoadError::UnknownTable(table.to_string()));
        }
        Ok(columns)
    }

    pub async fn insert_rows<R: TableRow>(&self, rows: &[R]) -> Result<u64, LoadError> {
        self.insert_into(R::TABLE.as_str(), rows).await
    }

    /// Insert all `rows` in one transaction; any failure rolls the whole batch back.
    pub async fn insert_into<R: Serialize>(&self, table: &str, rows: &[R]) -> Result<u64, LoadError> {
        let columns = self.table_columns(table).await?;
        let sql = insert_statement(table, &columns);

        let mut tx = self.pool.begin().await?;
        for (index, row) in rows.iter().enumerate() {
            let values = row_values(table, index, row, &columns)?;
            let query = values.into_iter().fold(sqlx::query(&sql), bind_json);
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    pub async fn count_rows(&self, table: &str) -> Result<u64, LoadError> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let n: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(n.max(0) as u64)
    }

    /// Compare a table's row count to `expected`; a mismatch is only logged.
    pub async fn check_table(&self, table: &str, expected: u64) -> Result<Option<u64>, LoadError> {
        let actual = self.count_rows(table).await?;
        if actual == expected {
            return Ok(None);
        }
        warn!(table, expected, actual, "table size incorrect");
        Ok(Some(actual))
    }
}

#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub workspace_root: PathBuf,
    pub config_path: PathBuf,
}

impl BuildConfig {
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
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountMismatch {
    pub table: String,
    pub expected: u64,
    pub actual: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rows: BTreeMap<String, u64>,
    pub players: usize,
    pub player_links: usize,
    pub count_mismatches: Vec<CountMismatch>,
}

#[derive(Debug, Default)]
struct RowCounts(BTreeMap<Table, u64>);

impl RowCounts {
    fn add(&mut self, table: Table, n: u64) {
        *self.0.entry(table).or_default() += n;
    }

    fn into_named(self) -> BTreeMap<String, u64> {
        self.0
            .into_iter()
            .map(|(table, n)| (table.as_str().to_string(), n))
            .collect()
    }
}

pub struct BuildPipeline {
    config: LeaderboardConfig,
    store: SnapshotStore,
    loader: BulkLoader,
}

impl BuildPipeline {
    pub async fn open(build: &BuildConfig) -> Result<Self> {
        let config = load_leaderboard_config(&build.config_path).await?;
        let db_path = build.workspace_root.join(&config.database.path);
        let loader = BulkLoader::open(&db_path)
            .await
            .with_context(|| format!("opening database {}", db_path.display()))?;
        Ok(Self::new(
            config,
            SnapshotStore::new(build.workspace_root.clone()),
            loader,
        ))
    }

    pub fn new(config: LeaderboardConfig, store: SnapshotStore, loader: BulkLoader) -> Self {
        Self {
            config,
            store,
            loader,
        }
    }

    pub fn loader(&self) -> &BulkLoader {
        &self.loader
    }

    async fn insert<R: TableRow>(&self, rows: &[R], counts: &mut RowCounts) -> Result<()> {
        let n = self
            .loader
            .insert_rows(rows)
            .await
            .with_context(|| format!("inserting into {}", R::TABLE))?;
        counts.add(R::TABLE, n);
        Ok(())
    }

    async fn run_script(&self, file: &str) -> Result<()> {
        let sql = self.store.read_text(file).await?;
        self.loader
            .execute_script(&sql)
            .await
            .with_context(|| format!("executing {file}"))
    }

    /// Build the whole database from the snapshot set.
    pub async fn run(&self) -> Result<BuildSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let mut counts = RowCounts::default();

        info!(script = %self.config.database.schema_sql, "setting up database");
        self.run_script(&self.config.database.schema_sql).await?;

        let mut dedup = EntityDeduplicator::new();
        for game in &self.config.games {
            self.load_runs(&game.runs_file, &mut dedup, &mut counts)
                .instrument(info_span!("load_runs", %run_id, file = %game.runs_file))
                .await?;
        }
        self.load_verifiers(&mut dedup).await?;

        let (players, player_links) = (dedup.player_count(), dedup.link_count());
        let (player_rows, link_rows) = dedup.into_rows();
        info!(players, player_links, "inserting deduplicated players");
        self.insert(&player_rows, &mut counts).await?;
        self.insert(&link_rows, &mut counts).await?;

        self.load_games(&mut counts).await?;
        self.load_category_variables(&mut counts).await?;
        self.load_lookups(&mut counts).await?;

        info!(script = %self.config.database.post_sql, "post processing");
        self.run_script(&self.config.database.post_sql).await?;

        let count_mismatches = self.check_counts().await;

        Ok(BuildSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            rows: counts.into_named(),
            players,
            player_links,
            count_mismatches,
        })
    }

    async fn load_runs(
        &self,
        file: &str,
        dedup: &mut EntityDeduplicator,
        counts: &mut RowCounts,
    ) -> Result<()> {
        let runs: Vec<SourceRun> = self.store.read(file).await?;
        info!(runs = runs.len(), "loading runs");

        let run_rows: Vec<_> = runs.iter().map(transform::run_row).collect();
        self.insert(&run_rows, counts).await?;
        let players: Vec<_> = runs.iter().flat_map(transform::run_player_rows).collect();
        self.insert(&players, counts).await?;
        let values: Vec<_> = runs.iter().flat_map(transform::run_value_rows).collect();
        self.insert(&values, counts).await?;
        let videos: Vec<_> = runs.iter().flat_map(transform::run_video_rows).collect();
        self.insert(&videos, counts).await?;

        for run in &runs {
            dedup.observe_run(run);
        }
        Ok(())
    }

    async fn load_verifiers(&self, dedup: &mut EntityDeduplicator) -> Result<()> {
        let users: UsersSnapshot = self.store.read(&self.config.users_file).await?;
        info!(users = users.len(), "adding verifiers");
        for user in users.values().flatten() {
            dedup.observe(user);
        }
        Ok(())
    }

    async fn load_games(&self, counts: &mut RowCounts) -> Result<()> {
        let games: DataEnvelope<Vec<SourceGame>> = self.store.read(&self.config.games_file).await?;
        info!(games = games.data.len(), "loading categories, variables and values");
        for game in &games.data {
            let categories: Vec<_> = game
                .categories
                .items()
                .iter()
                .map(|cat| transform::category_row(cat, &game.id))
                .collect();
            self.insert(&categories, counts).await?;

            let variables = game.variables.items();
            let variable_rows: Vec<_> = variables.iter().map(transform::variable_row).collect();
            self.insert(&variable_rows, counts).await?;
            let vals: Vec<_> = variables.iter().flat_map(transform::val_rows).collect();
            self.insert(&vals, counts).await?;
        }
        Ok(())
    }

    async fn load_category_variables(&self, counts: &mut RowCounts) -> Result<()> {
        let listings: CategoryVariablesSnapshot = self
            .store
            .read(&self.config.category_variables_file)
            .await?;
        info!(categories = listings.len(), "loading cat_vars");
        for (cid, variables) in &listings {
            self.insert(&transform::cat_var_rows(cid, variables), counts)
                .await?;
        }
        Ok(())
    }

    async fn load_lookups(&self, counts: &mut RowCounts) -> Result<()> {
        for game in &self.config.games {
            let levels: DataEnvelope<Vec<SourceLevel>> = self.store.read(&game.levels_file).await?;
            let rows: Vec<_> = levels.data.iter().map(transform::level_row).collect();
            self.insert(&rows, counts).await?;
        }

        let regions: DataEnvelope<Vec<SourceRegion>> =
            self.store.read(&self.config.regions_file).await?;
        let rows: Vec<_> = regions.data.iter().map(transform::region_row).collect();
        self.insert(&rows, counts).await?;

        let platforms: DataEnvelope<Vec<SourcePlatform>> =
            self.store.read(&self.config.platforms_file).await?;
        let rows: Vec<_> = platforms.data.iter().map(transform::platform_row).collect();
        self.insert(&rows, counts).await?;
        Ok(())
    }

    async fn check_counts(&self) -> Vec<CountMismatch> {
        let mut mismatches = Vec::new();
        for (table, &expected) in &self.config.database.expected_counts {
            match self.loader.check_table(table, expected).await {
                Ok(None) => {}
                Ok(Some(actual)) => mismatches.push(CountMismatch {
                    table: table.clone(),
                    expected,
                    actual: Some(actual),
                }),
                Err(err) => {
                    warn!(table = %table, error = %err, "table size check failed");
                    mismatches.push(CountMismatch {
                        table: table.clone(),
                        expected,
                        actual: None,
                    });
                }
            }
        }
        mismatches
    }
}
