//! Core domain model for lbsync: remote record shapes, relational row shapes
//! and the workspace config shape.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "lbsync-core";

pub const DEFAULT_API_BASE: &str = "https://www.speedrun.com/api/v1";

/// Identity of a raw remote record, if it carries a string `id`.
pub fn record_id(record: &JsonValue) -> Option<&str> {
    record.get("id").and_then(JsonValue::as_str)
}

/// `{ "data": ... }` envelope used by every API response and static snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEnvelope<T> {
    pub data: T,
}

/// A collection embedded in a record, either bare or wrapped in `{ "data": [...] }`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Embedded<T> {
    List(Vec<T>),
    Wrapped { data: Vec<T> },
}

impl<T> Embedded<T> {
    pub fn items(&self) -> &[T] {
        match self {
            Self::List(items) => items,
            Self::Wrapped { data } => data,
        }
    }
}

impl<T> Default for Embedded<T> {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

/// Bare `{ "id": ... }` reference; extra fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceRef {
    pub id: String,
}

/// Run record as returned by `/runs?embed=players`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceRun {
    pub id: String,
    pub game: Option<String>,
    pub category: Option<String>,
    pub level: Option<String>,
    pub date: Option<String>,
    pub submitted: Option<String>,
    pub comment: Option<String>,
    pub system: Option<SourceSystem>,
    pub status: Option<SourceStatus>,
    pub times: Option<SourceTimes>,
    pub players: Option<Embedded<Option<SourcePlayer>>>,
    pub values: Option<BTreeMap<String, String>>,
    pub videos: Option<SourceVideos>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SourceSystem {
    pub platform: Option<String>,
    pub region: Option<String>,
    pub emulated: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SourceStatus {
    pub status: Option<String>,
    pub examiner: Option<String>,
    #[serde(rename = "verify-date", alias = "verify_date")]
    pub verify_date: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SourceTimes {
    pub primary: Option<String>,
    pub primary_t: Option<f64>,
    pub realtime: Option<String>,
    pub realtime_t: Option<f64>,
    pub realtime_noloads: Option<String>,
    pub realtime_noloads_t: Option<f64>,
    pub ingame: Option<String>,
    pub ingame_t: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SourceVideos {
    pub links: Option<Vec<Option<SourceLink>>>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SourceLink {
    pub uri: Option<String>,
}

/// User record, either embedded in a run or fetched from `/users/{id}`.
/// Guests carry no `id`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SourcePlayer {
    pub id: Option<String>,
    pub names: Option<SourceNames>,
    pub pronouns: Option<String>,
    pub role: Option<String>,
    pub weblink: Option<String>,
    pub signup: Option<String>,
    pub location: Option<SourceLocation>,
    #[serde(rename = "name-style")]
    pub name_style: Option<SourceNameStyle>,
    pub youtube: Option<SourceLink>,
    pub twitch: Option<SourceLink>,
    pub hitbox: Option<SourceLink>,
    pub speedrunslive: Option<SourceLink>,
    pub twitter: Option<SourceLink>,
}

impl SourcePlayer {
    /// Player id, treating an empty string as absent.
    pub fn identity(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn social_link(&self, platform: SocialPlatform) -> Option<&SourceLink> {
        match platform {
            SocialPlatform::Youtube => self.youtube.as_ref(),
            SocialPlatform::Twitch => self.twitch.as_ref(),
            SocialPlatform::Hitbox => self.hitbox.as_ref(),
            SocialPlatform::Speedrunslive => self.speedrunslive.as_ref(),
            SocialPlatform::Twitter => self.twitter.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SourceNames {
    pub international: Option<String>,
    pub japanese: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SourceLocation {
    pub country: Option<SourcePlace>,
    pub region: Option<SourcePlace>,
}

impl SourceLocation {
    pub fn place(&self, kind: PlaceKind) -> Option<&SourcePlace> {
        match kind {
            PlaceKind::Country => self.country.as_ref(),
            PlaceKind::Region => self.region.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceKind {
    Country,
    Region,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SourcePlace {
    pub code: Option<String>,
    pub names: Option<SourceNames>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SourceNameStyle {
    pub style: Option<String>,
    #[serde(rename = "color-from")]
    pub color_from: Option<SourceColor>,
    #[serde(rename = "color-to")]
    pub color_to: Option<SourceColor>,
    pub color: Option<SourceColor>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SourceColor {
    pub light: Option<String>,
    pub dark: Option<String>,
}

/// Game record from the static games file, with embedded categories and variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceGame {
    pub id: String,
    #[serde(default)]
    pub categories: Embedded<SourceCategory>,
    #[serde(default)]
    pub variables: Embedded<SourceVariable>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceCategory {
    pub id: String,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub miscellaneous: Option<bool>,
    pub rules: Option<String>,
    pub weblink: Option<String>,
    pub players: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceVariable {
    pub id: String,
    pub name: Option<String>,
    pub category: Option<String>,
    pub scope: Option<SourceScope>,
    pub mandatory: Option<bool>,
    #[serde(rename = "user-defined")]
    pub user_defined: Option<bool>,
    pub obsoletes: Option<bool>,
    #[serde(rename = "is-subcategory")]
    pub is_subcategory: Option<bool>,
    pub values: Option<SourceVariableValues>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SourceScope {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SourceVariableValues {
    pub default: Option<String>,
    #[serde(default)]
    pub values: BTreeMap<String, SourceValue>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SourceValue {
    pub label: Option<String>,
    pub rules: Option<String>,
    pub flags: Option<SourceValueFlags>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SourceValueFlags {
    pub miscellaneous: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceLevel {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceRegion {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourcePlatform {
    pub id: String,
    pub name: Option<String>,
    pub released: Option<i64>,
}

/// Verifier-users snapshot: user id → user record.
pub type UsersSnapshot = BTreeMap<String, Option<SourcePlayer>>;

/// Category-variables snapshot: category id → variables listed for it.
pub type CategoryVariablesSnapshot = BTreeMap<String, Vec<SourceRef>>;

/// Target tables of the build pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Runs,
    RunPlayers,
    RunValues,
    RunVideos,
    Players,
    PlayerLinks,
    Categories,
    Variables,
    Vals,
    CatVars,
    Levels,
    Regions,
    Platforms,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Runs => "runs",
            Table::RunPlayers => "run_players",
            Table::RunValues => "run_values",
            Table::RunVideos => "run_videos",
            Table::Players => "players",
            Table::PlayerLinks => "player_links",
            Table::Categories => "categories",
            Table::Variables => "variables",
            Table::Vals => "vals",
            Table::CatVars => "cat_vars",
            Table::Levels => "levels",
            Table::Regions => "regions",
            Table::Platforms => "platforms",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A flat row bound to exactly one target table.
pub trait TableRow: Serialize {
    const TABLE: Table;
}

/// Social platforms a player profile may link to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocialPlatform {
    Youtube,
    Twitch,
    Hitbox,
    Speedrunslive,
    Twitter,
}

impl SocialPlatform {
    pub const ALL: [SocialPlatform; 5] = [
        SocialPlatform::Youtube,
        SocialPlatform::Twitch,
        SocialPlatform::Hitbox,
        SocialPlatform::Speedrunslive,
        SocialPlatform::Twitter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SocialPlatform::Youtube => "youtube",
            SocialPlatform::Twitch => "twitch",
            SocialPlatform::Hitbox => "hitbox",
            SocialPlatform::Speedrunslive => "speedrunslive",
            SocialPlatform::Twitter => "twitter",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRow {
    pub id: String,
    pub game: Option<String>,
    pub category: Option<String>,
    pub level: Option<String>,
    pub date: Option<String>,
    pub submitted: Option<String>,
    pub comment: Option<String>,
    pub platform: Option<String>,
    pub region: Option<String>,
    pub emulated: i64,
    pub examiner: Option<String>,
    pub verify_date: Option<String>,
    pub reason: Option<String>,
    pub status: Option<String>,
    pub primary_t: Option<f64>,
    pub primary_: Option<String>,
    pub realtime: Option<String>,
    pub realtime_t: Option<f64>,
    pub realtime_noloads: Option<String>,
    pub realtime_noloads_t: Option<f64>,
    pub ingame: Option<String>,
    pub ingame_t: Option<f64>,
    pub video_text: String,
}

impl TableRow for RunRow {
    const TABLE: Table = Table::Runs;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunPlayerRow {
    pub rid: String,
    pub pid: String,
}

impl TableRow for RunPlayerRow {
    const TABLE: Table = Table::RunPlayers;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunValueRow {
    pub rid: String,
    pub kid: String,
    pub vid: String,
}

impl TableRow for RunValueRow {
    const TABLE: Table = Table::RunValues;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunVideoRow {
    pub rid: String,
    pub uri: String,
}

impl TableRow for RunVideoRow {
    const TABLE: Table = Table::RunVideos;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerRow {
    pub id: String,
    pub namei: Option<String>,
    pub namej: Option<String>,
    pub pronouns: Option<String>,
    pub role: Option<String>,
    pub weblink: Option<String>,
    pub signup: Option<String>,
    pub loc_code: Option<String>,
    pub loc_namei: Option<String>,
    pub loc_namej: Option<String>,
    pub reg_code: Option<String>,
    pub reg_namei: Option<String>,
    pub reg_namej: Option<String>,
    pub style: Option<String>,
    pub color_light: Option<String>,
    pub color_dark: Option<String>,
    pub color_from_light: Option<String>,
    pub color_from_dark: Option<String>,
    pub color_to_light: Option<String>,
    pub color_to_dark: Option<String>,
}

impl TableRow for PlayerRow {
    const TABLE: Table = Table::Players;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerLinkRow {
    pub pid: String,
    pub name: SocialPlatform,
    pub uri: Option<String>,
}

impl TableRow for PlayerLinkRow {
    const TABLE: Table = Table::PlayerLinks;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryRow {
    pub id: String,
    pub game: String,
    pub category: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub miscellaneous: i64,
    pub rules: Option<String>,
    pub weblink: Option<String>,
    pub players: Option<String>,
}

impl TableRow for CategoryRow {
    const TABLE: Table = Table::Categories;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableRow {
    pub id: String,
    pub variable: Option<String>,
    pub category: Option<String>,
    pub default_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub level: Option<String>,
    pub mandatory: i64,
    pub user_defined: i64,
    pub obsoletes: i64,
    pub is_subcategory: i64,
}

impl TableRow for VariableRow {
    const TABLE: Table = Table::Variables;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValRow {
    pub vid: String,
    pub id: String,
    pub label: Option<String>,
    pub rules: Option<String>,
    pub miscellaneous: Option<i64>,
}

impl TableRow for ValRow {
    const TABLE: Table = Table::Vals;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatVarRow {
    pub cid: String,
    pub vid: String,
}

impl TableRow for CatVarRow {
    const TABLE: Table = Table::CatVars;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelRow {
    pub lid: String,
    pub level: Option<String>,
}

impl TableRow for LevelRow {
    const TABLE: Table = Table::Levels;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionRow {
    pub id: String,
    pub region: Option<String>,
}

impl TableRow for RegionRow {
    const TABLE: Table = Table::Regions;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformRow {
    pub id: String,
    pub platform: Option<String>,
    pub released: Option<i64>,
}

impl TableRow for PlatformRow {
    const TABLE: Table = Table::Platforms;
}

/// Contents of `leaderboard.yaml`. File paths are relative to the workspace root.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LeaderboardConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    pub games_file: String,
    pub users_file: String,
    pub category_ids_file: String,
    pub category_variables_file: String,
    pub platforms_file: String,
    pub regions_file: String,
    pub games: Vec<GameConfig>,
    pub database: DatabaseConfig,
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GameConfig {
    pub id: String,
    pub runs_file: String,
    pub levels_file: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    pub schema_sql: String,
    pub post_sql: String,
    /// Optional post-load row counts keyed by table name; diagnostic only.
    #[serde(default)]
    pub expected_counts: BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn embedded_accepts_bare_and_wrapped_lists() {
        let bare: Embedded<SourceRef> = serde_json::from_value(json!([{ "id": "a" }])).unwrap();
        let wrapped: Embedded<SourceRef> =
            serde_json::from_value(json!({ "data": [{ "id": "a" }, { "id": "b" }] })).unwrap();
        assert_eq!(bare.items().len(), 1);
        assert_eq!(wrapped.items()[1].id, "b");
    }

    #[test]
    fn run_with_guest_player_and_missing_status_fields_parses() {
        let run: SourceRun = serde_json::from_value(json!({
            "id": "r1",
            "status": { "status": "verified", "examiner": "x9" },
            "players": { "data": [
                { "rel": "guest", "name": "someone" },
                { "rel": "user", "id": "p1" },
                null
            ] }
        }))
        .unwrap();
        let status = run.status.unwrap();
        assert_eq!(status.verify_date, None);
        assert_eq!(status.examiner.as_deref(), Some("x9"));
        let players = run.players.unwrap();
        assert_eq!(players.items().len(), 3);
        assert_eq!(players.items()[0].as_ref().and_then(|p| p.identity()), None);
        assert_eq!(players.items()[1].as_ref().and_then(|p| p.identity()), Some("p1"));
    }

    #[test]
    fn config_parses_with_default_api_base() {
        let yaml = r#"
games_file: botw.json
users_file: botw_users.json
category_ids_file: catids.db.json
category_variables_file: botw_cat_vars.json
platforms_file: platforms.json
regions_file: regions.json
games:
  - id: 76rqjqd8
    runs_file: botw_nor.json
    levels_file: botw_levels.json
database:
  path: botw.db
  schema_sql: src2.sql
  post_sql: src2_post.sql
  expected_counts:
    regions: 6
"#;
        let config: LeaderboardConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert_eq!(config.games[0].runs_file, "botw_nor.json");
        assert_eq!(config.database.expected_counts.get("regions"), Some(&6));
    }
}
