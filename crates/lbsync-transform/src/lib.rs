//! Pure transforms from remote record shapes into relational rows, plus the
//! last-write-wins deduplicator for players and their social links.

use indexmap::IndexMap;
use lbsync_core::{
    CatVarRow, CategoryRow, LevelRow, PlaceKind, PlatformRow, PlayerLinkRow, PlayerRow, RegionRow,
    RunPlayerRow, RunRow, RunValueRow, RunVideoRow, SocialPlatform, SourceCategory, SourceLevel,
    SourceLocation, SourceNameStyle, SourcePlatform, SourcePlayer, SourceRef, SourceRegion,
    SourceRun, SourceVariable, ValRow, VariableRow,
};

pub const CRATE_NAME: &str = "lbsync-transform";

const GRADIENT_STYLE: &str = "gradient";

pub fn bool_to_int(value: Option<bool>) -> i64 {
    i64::from(value.unwrap_or(false))
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|s| !s.is_empty()).cloned()
}

pub fn run_row(run: &SourceRun) -> RunRow {
    let system = run.system.clone().unwrap_or_default();
    let status = run.status.clone().unwrap_or_default();
    let times = run.times.clone().unwrap_or_default();

    RunRow {
        id: run.id.clone(),
        game: run.game.clone(),
        category: run.category.clone(),
        level: run.level.clone(),
        date: run.date.clone(),
        submitted: run.submitted.clone(),
        comment: run.comment.clone(),
        platform: system.platform,
        region: system.region,
        emulated: bool_to_int(system.emulated),
        examiner: status.examiner,
        verify_date: non_empty(status.verify_date.as_ref()),
        reason: non_empty(status.reason.as_ref()),
        status: status.status,
        primary_t: times.primary_t,
        primary_: times.primary,
        realtime: times.realtime,
        realtime_t: times.realtime_t,
        realtime_noloads: times.realtime_noloads,
        realtime_noloads_t: times.realtime_noloads_t,
        ingame: times.ingame,
        ingame_t: times.ingame_t,
        video_text: String::new(),
    }
}

/// Embedded players of a run that carry a concrete identity; guests are skipped.
pub fn identified_players(run: &SourceRun) -> impl Iterator<Item = &SourcePlayer> {
    run.players
        .iter()
        .flat_map(|players| players.items())
        .filter_map(Option::as_ref)
        .filter(|p| p.identity().is_some())
}

pub fn run_player_rows(run: &SourceRun) -> Vec<RunPlayerRow> {
    identified_players(run)
        .filter_map(SourcePlayer::identity)
        .map(|pid| RunPlayerRow {
            rid: run.id.clone(),
            pid: pid.to_string(),
        })
        .collect()
}

pub fn run_value_rows(run: &SourceRun) -> Vec<RunValueRow> {
    run.values
        .iter()
        .flatten()
        .map(|(kid, vid)| RunValueRow {
            rid: run.id.clone(),
            kid: kid.clone(),
            vid: vid.clone(),
        })
        .collect()
}

pub fn run_video_rows(run: &SourceRun) -> Vec<RunVideoRow> {
    run.videos
        .as_ref()
        .and_then(|videos| videos.links.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|link| link.as_ref().and_then(|l| non_empty(l.uri.as_ref())))
        .map(|uri| RunVideoRow {
            rid: run.id.clone(),
            uri,
        })
        .collect()
}

/// `(code, international name, japanese name)` of a location part.
pub type LocationColumns = (Option<String>, Option<String>, Option<String>);

pub fn location(loc: Option<&SourceLocation>, kind: PlaceKind) -> LocationColumns {
    let Some(place) = loc.and_then(|l| l.place(kind)) else {
        return (None, None, None);
    };
    let code = non_empty(place.code.as_ref());
    match &place.names {
        Some(names) => (code, names.international.clone(), names.japanese.clone()),
        None => (code, None, None),
    }
}

/// The seven name-style columns of a player row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StyleColumns {
    pub style: Option<String>,
    pub color_from_light: Option<String>,
    pub color_from_dark: Option<String>,
    pub color_to_light: Option<String>,
    pub color_to_dark: Option<String>,
    pub color_light: Option<String>,
    pub color_dark: Option<String>,
}

/// Gradient styles fill the from/to pairs, every other kind fills the solid pair.
/// A gradient missing a color object leaves that pair null.
pub fn name_style(ns: Option<&SourceNameStyle>) -> StyleColumns {
    let Some(ns) = ns else {
        return StyleColumns::default();
    };
    if ns.style.as_deref() == Some(GRADIENT_STYLE) {
        let from = ns.color_from.clone().unwrap_or_default();
        let to = ns.color_to.clone().unwrap_or_default();
        return StyleColumns {
            style: ns.style.clone(),
            color_from_light: from.light,
            color_from_dark: from.dark,
            color_to_light: to.light,
            color_to_dark: to.dark,
            ..StyleColumns::default()
        };
    }
    let solid = ns.color.clone().unwrap_or_default();
    StyleColumns {
        style: ns.style.clone(),
        color_light: solid.light,
        color_dark: solid.dark,
        ..StyleColumns::default()
    }
}

pub fn player_row(p: &SourcePlayer) -> Option<PlayerRow> {
    let id = p.identity()?.to_string();
    let style = name_style(p.name_style.as_ref());
    let (namei, namej) = match &p.names {
        Some(names) => (names.international.clone(), names.japanese.clone()),
        None => (None, None),
    };
    let (loc_code, loc_namei, loc_namej) = location(p.location.as_ref(), PlaceKind::Country);
    let (reg_code, reg_namei, reg_namej) = location(p.location.as_ref(), PlaceKind::Region);

    Some(PlayerRow {
        id,
        namei,
        namej,
        pronouns: p.pronouns.clone(),
        role: p.role.clone(),
        weblink: p.weblink.clone(),
        signup: p.signup.clone(),
        loc_code,
        loc_namei,
        loc_namej,
        reg_code,
        reg_namei,
        reg_namej,
        style: style.style,
        color_light: style.color_light,
        color_dark: style.color_dark,
        color_from_light: style.color_from_light,
        color_from_dark: style.color_from_dark,
        color_to_light: style.color_to_light,
        color_to_dark: style.color_to_dark,
    })
}

pub fn player_link_rows(p: &SourcePlayer) -> Vec<PlayerLinkRow> {
    let Some(pid) = p.identity() else {
        return Vec::new();
    };
    SocialPlatform::ALL
        .into_iter()
        .filter_map(|platform| {
            p.social_link(platform).map(|link| PlayerLinkRow {
                pid: pid.to_string(),
                name: platform,
                uri: link.uri.clone(),
            })
        })
        .collect()
}

pub fn category_row(cat: &SourceCategory, game_id: &str) -> CategoryRow {
    CategoryRow {
        id: cat.id.clone(),
        game: game_id.to_string(),
        category: cat.name.clone(),
        kind: cat.kind.clone(),
        miscellaneous: bool_to_int(cat.miscellaneous),
        rules: cat.rules.clone(),
        weblink: cat.weblink.clone(),
        players: cat.players.as_ref().map(|v| v.to_string()),
    }
}

pub fn variable_row(v: &SourceVariable) -> VariableRow {
    let scope = v.scope.clone().unwrap_or_default();
    VariableRow {
        id: v.id.clone(),
        variable: v.name.clone(),
        category: v.category.clone(),
        default_id: v.values.as_ref().and_then(|vals| vals.default.clone()),
        kind: scope.kind,
        level: scope.level,
        mandatory: bool_to_int(v.mandatory),
        user_defined: bool_to_int(v.user_defined),
        obsoletes: bool_to_int(v.obsoletes),
        is_subcategory: bool_to_int(v.is_subcategory),
    }
}

pub fn val_rows(v: &SourceVariable) -> Vec<ValRow> {
    v.values
        .iter()
        .flat_map(|vals| vals.values.iter())
        .map(|(id, value)| ValRow {
            vid: v.id.clone(),
            id: id.clone(),
            label: value.label.clone(),
            rules: value.rules.clone(),
            miscellaneous: value
                .flags
                .as_ref()
                .map(|flags| bool_to_int(flags.miscellaneous)),
        })
        .collect()
}

pub fn cat_var_rows(cid: &str, variables: &[SourceRef]) -> Vec<CatVarRow> {
    variables
        .iter()
        .map(|v| CatVarRow {
            cid: cid.to_string(),
            vid: v.id.clone(),
        })
        .collect()
}

pub fn level_row(level: &SourceLevel) -> LevelRow {
    LevelRow {
        lid: level.id.clone(),
        level: level.name.clone(),
    }
}

pub fn region_row(region: &SourceRegion) -> RegionRow {
    RegionRow {
        id: region.id.clone(),
        region: region.name.clone(),
    }
}

pub fn platform_row(platform: &SourcePlatform) -> PlatformRow {
    PlatformRow {
        id: platform.id.clone(),
        platform: platform.name.clone(),
        released: platform.released,
    }
}

/// Collects players and player links across snapshots, keyed by natural identity.
///
/// A later observation of the same key replaces the earlier row entirely.
/// Each write is stamped with a sequence number and [`into_rows`] sorts by it
/// once, so output order is order of last write.
///
/// [`into_rows`]: EntityDeduplicator::into_rows
#[derive(Debug, Default)]
pub struct EntityDeduplicator {
    seq: u64,
    players: IndexMap<String, (u64, PlayerRow)>,
    links: IndexMap<(String, SocialPlatform), (u64, PlayerLinkRow)>,
}

impl EntityDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Record a player and its links. Players without an identity are ignored.
    pub fn observe(&mut self, player: &SourcePlayer) {
        let Some(row) = player_row(player) else {
            return;
        };
        let seq = self.next_seq();
        self.players.insert(row.id.clone(), (seq, row));

        for link in player_link_rows(player) {
            let seq = self.next_seq();
            self.links.insert((link.pid.clone(), link.name), (seq, link));
        }
    }

    pub fn observe_run(&mut self, run: &SourceRun) {
        for player in identified_players(run) {
            self.observe(player);
        }
    }

    pub fn contains_player(&self, id: &str) -> bool {
        self.players.contains_key(id)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn into_rows(mut self) -> (Vec<PlayerRow>, Vec<PlayerLinkRow>) {
        self.players.sort_unstable_by(|_, (a, _), _, (b, _)| a.cmp(b));
        self.links.sort_unstable_by(|_, (a, _), _, (b, _)| a.cmp(b));
        (
            self.players.into_values().map(|(_, row)| row).collect(),
            self.links.into_values().map(|(_, row)| row).collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use serde_json::{json, Value as JsonValue};
    use std::collections::BTreeSet;

    fn run_fixture() -> SourceRun {
        serde_json::from_value(json!({
            "id": "run1",
            "game": "g1",
            "category": "c1",
            "level": null,
            "date": "2023-04-01",
            "submitted": "2023-04-02T10:00:00Z",
            "comment": "gg",
            "system": { "platform": "p1", "region": null, "emulated": true },
            "status": { "status": "verified", "examiner": "ex1" },
            "times": {
                "primary": "PT30M", "primary_t": 1800,
                "realtime": "PT30M", "realtime_t": 1800,
                "realtime_noloads": null, "realtime_noloads_t": 0,
                "ingame": null, "ingame_t": 0
            },
            "players": { "data": [
                { "rel": "user", "id": "pl1", "names": { "international": "Link" } },
                { "rel": "guest", "name": "Zelda" }
            ] },
            "values": { "var1": "val1", "var2": "val2" },
            "videos": { "links": [ { "uri": "https://youtu.be/x" }, { "rel": "video" } ] }
        }))
        .expect("run fixture")
    }

    fn player_fixture(style: JsonValue) -> SourcePlayer {
        serde_json::from_value(json!({
            "id": "pl1",
            "names": { "international": "Link", "japanese": "リンク" },
            "pronouns": "he/him",
            "role": "user",
            "weblink": "https://www.speedrun.com/user/Link",
            "signup": "2019-01-01T00:00:00Z",
            "location": {
                "country": { "code": "jp", "names": { "international": "Japan", "japanese": "日本" } },
                "region": { "code": "jp/13" }
            },
            "name-style": style,
            "twitch": { "uri": "https://twitch.tv/link" },
            "youtube": null,
            "twitter": { "uri": "https://twitter.com/link" }
        }))
        .expect("player fixture")
    }

    fn keys<T: Serialize>(row: &T) -> BTreeSet<String> {
        match serde_json::to_value(row).expect("row serializes") {
            JsonValue::Object(map) => map.keys().cloned().collect(),
            other => panic!("row is not an object: {other}"),
        }
    }

    fn columns(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn run_without_verify_date_or_reason_maps_to_nulls() {
        let row = run_row(&run_fixture());
        assert_eq!(row.verify_date, None);
        assert_eq!(row.reason, None);
        assert_eq!(row.id, "run1");
        assert_eq!(row.platform.as_deref(), Some("p1"));
        assert_eq!(row.emulated, 1);
        assert_eq!(row.examiner.as_deref(), Some("ex1"));
        assert_eq!(row.status.as_deref(), Some("verified"));
        assert_eq!(row.primary_t, Some(1800.0));
        assert_eq!(row.primary_.as_deref(), Some("PT30M"));
        assert_eq!(row.video_text, "");
    }

    #[test]
    fn run_with_no_nested_objects_still_maps() {
        let run: SourceRun = serde_json::from_value(json!({ "id": "bare" })).unwrap();
        let row = run_row(&run);
        assert_eq!(row.emulated, 0);
        assert_eq!(row.platform, None);
        assert_eq!(row.primary_t, None);
        assert!(run_player_rows(&run).is_empty());
        assert!(run_value_rows(&run).is_empty());
        assert!(run_video_rows(&run).is_empty());
    }

    #[test]
    fn join_rows_skip_guests_and_linkless_videos() {
        let run = run_fixture();
        let players = run_player_rows(&run);
        assert_eq!(players, vec![RunPlayerRow { rid: "run1".into(), pid: "pl1".into() }]);

        let values = run_value_rows(&run);
        assert_eq!(values.len(), 2);
        assert!(values.iter().any(|v| v.kid == "var2" && v.vid == "val2"));

        let videos = run_video_rows(&run);
        assert_eq!(videos, vec![RunVideoRow { rid: "run1".into(), uri: "https://youtu.be/x".into() }]);
    }

    #[test]
    fn gradient_style_fills_only_gradient_columns() {
        let p = player_fixture(json!({
            "style": "gradient",
            "color-from": { "light": "#111", "dark": "#222" },
            "color-to": { "light": "#333", "dark": "#444" }
        }));
        let row = player_row(&p).unwrap();
        assert_eq!(row.style.as_deref(), Some("gradient"));
        assert_eq!(row.color_from_light.as_deref(), Some("#111"));
        assert_eq!(row.color_from_dark.as_deref(), Some("#222"));
        assert_eq!(row.color_to_light.as_deref(), Some("#333"));
        assert_eq!(row.color_to_dark.as_deref(), Some("#444"));
        assert_eq!(row.color_light, None);
        assert_eq!(row.color_dark, None);
    }

    #[test]
    fn solid_style_fills_only_solid_columns() {
        let p = player_fixture(json!({
            "style": "solid",
            "color": { "light": "#aaa", "dark": "#bbb" }
        }));
        let row = player_row(&p).unwrap();
        assert_eq!(row.style.as_deref(), Some("solid"));
        assert_eq!(row.color_light.as_deref(), Some("#aaa"));
        assert_eq!(row.color_dark.as_deref(), Some("#bbb"));
        assert_eq!(row.color_from_light, None);
        assert_eq!(row.color_from_dark, None);
        assert_eq!(row.color_to_light, None);
        assert_eq!(row.color_to_dark, None);
    }

    #[test]
    fn missing_style_leaves_all_style_columns_null() {
        assert_eq!(name_style(None), StyleColumns::default());
        let row = player_row(&player_fixture(JsonValue::Null)).unwrap();
        assert_eq!(row.style, None);
        assert_eq!(row.color_light, None);
        assert_eq!(row.color_from_dark, None);
    }

    #[test]
    fn gradient_without_colors_keeps_solid_columns_null() {
        let ns: SourceNameStyle = serde_json::from_value(json!({ "style": "gradient" })).unwrap();
        let cols = name_style(Some(&ns));
        assert_eq!(cols.style.as_deref(), Some("gradient"));
        assert_eq!(cols.color_from_light, None);
        assert_eq!(cols.color_light, None);
    }

    #[test]
    fn location_parts() {
        let p = player_fixture(JsonValue::Null);
        assert_eq!(
            location(p.location.as_ref(), PlaceKind::Country),
            (Some("jp".into()), Some("Japan".into()), Some("日本".into()))
        );
        assert_eq!(
            location(p.location.as_ref(), PlaceKind::Region),
            (Some("jp/13".into()), None, None)
        );
        assert_eq!(location(None, PlaceKind::Country), (None, None, None));
    }

    #[test]
    fn links_come_only_from_present_platforms() {
        let links = player_link_rows(&player_fixture(JsonValue::Null));
        let names: Vec<_> = links.iter().map(|l| l.name).collect();
        assert_eq!(names, vec![SocialPlatform::Twitch, SocialPlatform::Twitter]);
        assert!(links.iter().all(|l| l.pid == "pl1"));
    }

    #[test]
    fn guests_produce_no_player_rows() {
        let guest: SourcePlayer = serde_json::from_value(json!({ "rel": "guest", "name": "x" })).unwrap();
        assert!(player_row(&guest).is_none());
        assert!(player_link_rows(&guest).is_empty());
    }

    #[test]
    fn variable_flags_and_value_miscellaneous() {
        let v: SourceVariable = serde_json::from_value(json!({
            "id": "var1",
            "name": "Version",
            "category": "c1",
            "scope": { "type": "full-game" },
            "mandatory": true,
            "user-defined": false,
            "obsoletes": true,
            "is-subcategory": true,
            "values": {
                "default": "a",
                "values": {
                    "a": { "label": "1.0", "rules": null, "flags": { "miscellaneous": true } },
                    "b": { "label": "1.1", "flags": {} },
                    "c": { "label": "1.2" }
                }
            }
        }))
        .unwrap();
        let row = variable_row(&v);
        assert_eq!(row.default_id.as_deref(), Some("a"));
        assert_eq!(row.kind.as_deref(), Some("full-game"));
        assert_eq!(row.level, None);
        assert_eq!(
            (row.mandatory, row.user_defined, row.obsoletes, row.is_subcategory),
            (1, 0, 1, 1)
        );

        let vals = val_rows(&v);
        let misc: Vec<_> = vals.iter().map(|r| (r.id.as_str(), r.miscellaneous)).collect();
        assert_eq!(misc, vec![("a", Some(1)), ("b", Some(0)), ("c", None)]);
    }

    #[test]
    fn category_players_blob_is_serialized_json() {
        let cat: SourceCategory = serde_json::from_value(json!({
            "id": "c1",
            "name": "Any%",
            "type": "per-game",
            "players": { "type": "up-to", "value": 1 }
        }))
        .unwrap();
        let row = category_row(&cat, "g1");
        assert_eq!(row.game, "g1");
        assert_eq!(row.miscellaneous, 0);
        let blob: JsonValue = serde_json::from_str(row.players.as_deref().unwrap()).unwrap();
        assert_eq!(blob, json!({ "type": "up-to", "value": 1 }));
    }

    #[test]
    fn row_shapes_match_table_columns() {
        let run = run_fixture();
        assert_eq!(
            keys(&run_row(&run)),
            columns(&[
                "id", "game", "category", "level", "date", "submitted", "comment", "platform",
                "region", "emulated", "examiner", "verify_date", "reason", "status", "primary_t",
                "primary_", "realtime", "realtime_t", "realtime_noloads", "realtime_noloads_t",
                "ingame", "ingame_t", "video_text",
            ])
        );
        assert_eq!(keys(&run_player_rows(&run)[0]), columns(&["rid", "pid"]));
        assert_eq!(keys(&run_value_rows(&run)[0]), columns(&["rid", "kid", "vid"]));
        assert_eq!(keys(&run_video_rows(&run)[0]), columns(&["rid", "uri"]));

        let player = player_fixture(json!({ "style": "solid", "color": { "light": "#a" } }));
        assert_eq!(
            keys(&player_row(&player).unwrap()),
            columns(&[
                "id", "namei", "namej", "pronouns", "role", "weblink", "signup", "loc_code",
                "loc_namei", "loc_namej", "reg_code", "reg_namei", "reg_namej", "style",
                "color_light", "color_dark", "color_from_light", "color_from_dark",
                "color_to_light", "color_to_dark",
            ])
        );
        assert_eq!(keys(&player_link_rows(&player)[0]), columns(&["pid", "name", "uri"]));
    }

    #[test]
    fn dedup_is_idempotent() {
        let player = player_fixture(JsonValue::Null);

        let mut once = EntityDeduplicator::new();
        once.observe(&player);
        let mut twice = EntityDeduplicator::new();
        twice.observe(&player);
        twice.observe(&player);

        assert_eq!(twice.player_count(), 1);
        assert_eq!(once.into_rows(), twice.into_rows());
    }

    #[test]
    fn dedup_is_last_write_wins_per_key() {
        let first = player_fixture(JsonValue::Null);
        let mut second = first.clone();
        second.pronouns = Some("they/them".into());
        second.twitch = Some(lbsync_core::SourceLink {
            uri: Some("https://twitch.tv/link2".into()),
        });
        let other: SourcePlayer = serde_json::from_value(json!({ "id": "pl2" })).unwrap();

        let mut dedup = EntityDeduplicator::new();
        dedup.observe(&first);
        dedup.observe(&other);
        dedup.observe(&second);
        assert!(dedup.contains_player("pl1"));
        assert_eq!(dedup.link_count(), 2);

        let (players, links) = dedup.into_rows();
        let ids: Vec<_> = players.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["pl2", "pl1"]);
        assert_eq!(players[1].pronouns.as_deref(), Some("they/them"));
        let twitch = links
            .iter()
            .find(|l| l.name == SocialPlatform::Twitch)
            .unwrap();
        assert_eq!(twitch.uri.as_deref(), Some("https://twitch.tv/link2"));
    }

    #[test]
    fn dedup_output_follows_last_write_across_many_observations() {
        let player = |id: &str, yt: bool| -> SourcePlayer {
            let mut value = json!({ "id": id });
            if yt {
                value["youtube"] = json!({ "uri": format!("https://yt/{id}") });
            }
            serde_json::from_value(value).unwrap()
        };

        let mut dedup = EntityDeduplicator::new();
        for round in 0..50 {
            for id in ["a", "b", "c", "d"] {
                dedup.observe(&player(id, round % 2 == 0));
            }
        }
        dedup.observe(&player("b", false));
        dedup.observe(&player("a", true));

        assert_eq!(dedup.player_count(), 4);
        let (players, links) = dedup.into_rows();
        let ids: Vec<_> = players.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d", "b", "a"]);
        let link_owners: Vec<_> = links.iter().map(|l| l.pid.as_str()).collect();
        assert_eq!(link_owners, vec!["b", "c", "d", "a"]);
    }
}
