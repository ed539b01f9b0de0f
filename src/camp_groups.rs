//! Camp-group organization and the optimistic move protocol.
//!
//! Grouping is pure: members are bucketed by their `CampGroup` flexi field,
//! leaders are excluded, groups sort numerically with "Unassigned" last.
//! Moves are optimistic: the view updates immediately via an overlay of
//! in-flight and recently completed moves, and the remote write confirms or
//! reverts. The engine never talks to the UI directly; a `Notifier` and a
//! `CampGroupWriter` are injected by the host.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::key_router::KeyRouter;
use crate::model::{as_i64, scout_id_of, section_id_of};
use crate::stores::StoreName;
use crate::time::now_ms;
use crate::{AppError, AppResult};

/// Person types that never appear in camp groups.
pub const EXCLUDED_PERSON_TYPES: &[&str] = &["Leaders", "Young Leaders"];

/// Field carrying the group assignment on a joined member row.
pub const CAMP_GROUP_FIELD: &str = "CampGroup";

static RE_LEGACY_FLEXI_STRUCTURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^flexi_structure_(.+)_offline$").expect("valid regex"));
static RE_LEGACY_FLEXI_DATA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^flexi_data_([^_]+)_([^_]+)_([^_]+)_offline$").expect("valid regex")
});

pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// The external write that persists a group assignment upstream.
pub trait CampGroupWriter: Send + Sync {
    fn write_camp_group(&self, request: CampGroupWriteRequest) -> BoxFuture<'static, AppResult<()>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct CampGroupWriteRequest {
    pub member: Value,
    pub section_id: i64,
    pub term_id: Option<String>,
    pub section_type: Option<String>,
    pub from_group: Option<String>,
    pub to_group: Option<String>,
    pub camp_group_field_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MoveData {
    pub move_id: String,
    pub scoutid: i64,
    pub from_group: Option<String>,
    pub to_group: Option<String>,
    pub started_at: i64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The remote write confirmed; the move id is retained for a short
    /// window in the completed overlay.
    Applied(String),
    /// Drop onto the member's current group.
    DuplicateDrop,
    /// No flexi record carries a `CampGroup` field for this section; the
    /// notifier got a message and nothing was written.
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct CampGroup {
    /// `None` is the "Unassigned" bucket.
    pub group_number: Option<i64>,
    pub name: String,
    pub members: Vec<Value>,
}

fn group_number_of(member: &Value) -> Option<i64> {
    match member.get(CAMP_GROUP_FIELD) {
        Some(Value::Number(_)) => member.get(CAMP_GROUP_FIELD).and_then(as_i64),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn display_name(member: &Value) -> String {
    let field = |name: &str| {
        member
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    format!("{} {}", field("firstname"), field("lastname"))
        .trim()
        .to_string()
}

fn is_leader(member: &Value) -> bool {
    member
        .get("person_type")
        .and_then(Value::as_str)
        .map(|t| EXCLUDED_PERSON_TYPES.contains(&t))
        .unwrap_or(false)
}

/// Buckets joined member rows into camp groups. Leaders and Young Leaders
/// are left out entirely; groups sort numerically with "Unassigned" last;
/// members within a group sort by display name.
pub fn organize_camp_groups(members: &[Value]) -> Vec<CampGroup> {
    let mut buckets: HashMap<Option<i64>, Vec<Value>> = HashMap::new();
    for member in members {
        if is_leader(member) {
            continue;
        }
        buckets
            .entry(group_number_of(member))
            .or_default()
            .push(member.clone());
    }

    let mut groups: Vec<CampGroup> = buckets
        .into_iter()
        .map(|(group_number, mut members)| {
            members.sort_by_key(|m| display_name(m).to_lowercase());
            let name = match group_number {
                Some(n) => format!("Group {n}"),
                None => "Unassigned".to_string(),
            };
            CampGroup {
                group_number,
                name,
                members,
            }
        })
        .collect();
    // None sorts last: Unassigned trails the numbered groups.
    groups.sort_by_key(|g| match g.group_number {
        Some(n) => (0, n),
        None => (1, 0),
    });
    groups
}

/// Folds the in-flight and recently completed moves onto the base rows.
/// Pending moves win over completed ones; the newest move per scout wins.
pub fn apply_move_overlays(
    members: &[Value],
    pending: &HashMap<String, MoveData>,
    recent: &HashMap<String, MoveData>,
) -> Vec<Value> {
    let newest_for = |scoutid: i64, moves: &HashMap<String, MoveData>| -> Option<MoveData> {
        moves
            .values()
            .filter(|m| m.scoutid == scoutid)
            .max_by_key(|m| m.started_at)
            .cloned()
    };

    members
        .iter()
        .map(|member| {
            let Some(scoutid) = member.get("scoutid").and_then(as_i64) else {
                return member.clone();
            };
            let overlay = newest_for(scoutid, pending).or_else(|| newest_for(scoutid, recent));
            let Some(overlay) = overlay else {
                return member.clone();
            };
            let mut patched = member.as_object().cloned().unwrap_or_default();
            match &overlay.to_group {
                Some(group) => patched.insert(CAMP_GROUP_FIELD.into(), json!(group)),
                None => patched.insert(CAMP_GROUP_FIELD.into(), Value::Null),
            };
            Value::Object(patched)
        })
        .collect()
}

/// Where the `CampGroup` assignment lives for a section: the flexi record
/// and the field id inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlexiContext {
    pub record_id: String,
    pub term_id: Option<String>,
    pub camp_group_field_id: String,
}

/// Walks a flexi structure blob looking for the field definition named
/// `CampGroup`. Structures vary in shape, and the field list is sometimes a
/// JSON-encoded string under `config`, so the walk is recursive and the
/// embedded string gets one parse attempt.
fn find_camp_group_field(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            let named = map
                .get("name")
                .and_then(Value::as_str)
                .map(|n| n == CAMP_GROUP_FIELD)
                .unwrap_or(false);
            if named {
                for id_field in ["id", "field_id", "fieldid"] {
                    match map.get(id_field) {
                        Some(Value::String(id)) => return Some(id.clone()),
                        Some(Value::Number(n)) => return Some(n.to_string()),
                        _ => {}
                    }
                }
            }
            if let Some(Value::String(config)) = map.get("config") {
                if let Ok(parsed) = serde_json::from_str::<Value>(config) {
                    if let Some(id) = find_camp_group_field(&parsed) {
                        return Some(id);
                    }
                }
            }
            map.values().find_map(find_camp_group_field)
        }
        Value::Array(items) => items.iter().find_map(find_camp_group_field),
        _ => None,
    }
}

/// Locates the flexi record holding the `CampGroup` field for a section.
///
/// Structures in the object store are preferred; when none match, the
/// legacy keyspace is scanned for `<prefix>_flexi_structure_*_offline` and
/// `<prefix>_flexi_data_*_{sectionId}_*_offline` entries. Returns `None`
/// when no structure anywhere defines the field.
pub async fn resolve_flexi_context(
    router: &KeyRouter,
    section_id: i64,
) -> AppResult<Option<FlexiContext>> {
    let mut record_id: Option<String> = None;
    let mut field_id: Option<String> = None;

    for row in router
        .object_store()
        .get_all(StoreName::FlexiStructure)
        .await?
    {
        let data = row.get("data").unwrap_or(&Value::Null);
        if let Some(id) = find_camp_group_field(data) {
            field_id = Some(id);
            record_id = row
                .get("recordId")
                .and_then(Value::as_str)
                .map(str::to_string);
            break;
        }
    }

    if field_id.is_none() {
        let structure_prefix = format!("{}_", router.prefix());
        for key in router.legacy().keys() {
            let Some(suffix) = key.strip_prefix(&structure_prefix) else {
                continue;
            };
            let Some(caps) = RE_LEGACY_FLEXI_STRUCTURE.captures(suffix) else {
                continue;
            };
            let Some(blob) = router.legacy().get_json(&key) else {
                continue;
            };
            if let Some(id) = find_camp_group_field(&blob) {
                field_id = Some(id);
                record_id = Some(caps[1].to_string());
                break;
            }
        }
    }

    let (Some(field_id), Some(record_id)) = (field_id, record_id) else {
        return Ok(None);
    };

    // Term comes from a matching data blob; absence is tolerated.
    let mut term_id: Option<String> = None;
    for row in router.object_store().get_all(StoreName::FlexiData).await? {
        let matches_record = row.get("recordId").and_then(Value::as_str) == Some(&record_id);
        let matches_section = row
            .get("sectionId")
            .and_then(Value::as_str)
            .map(|s| s == section_id.to_string())
            .unwrap_or(false);
        if matches_record && matches_section {
            term_id = row
                .get("termId")
                .and_then(Value::as_str)
                .map(str::to_string);
            break;
        }
    }
    if term_id.is_none() {
        let data_prefix = format!("{}_", router.prefix());
        for key in router.legacy().keys() {
            let Some(suffix) = key.strip_prefix(&data_prefix) else {
                continue;
            };
            let Some(caps) = RE_LEGACY_FLEXI_DATA.captures(suffix) else {
                continue;
            };
            if &caps[1] == record_id.as_str() && caps[2] == section_id.to_string() {
                term_id = Some(caps[3].to_string());
                break;
            }
        }
    }

    Ok(Some(FlexiContext {
        record_id,
        term_id,
        camp_group_field_id: field_id,
    }))
}

#[derive(Default)]
struct MoveState {
    pending: HashMap<String, MoveData>,
    recent: HashMap<String, MoveData>,
}

pub struct CampGroupEngine {
    router: Arc<KeyRouter>,
    writer: Arc<dyn CampGroupWriter>,
    notifier: Arc<dyn Notifier>,
    retention: Duration,
    state: Arc<Mutex<MoveState>>,
}

impl CampGroupEngine {
    pub fn new(
        router: Arc<KeyRouter>,
        writer: Arc<dyn CampGroupWriter>,
        notifier: Arc<dyn Notifier>,
        retention_ms: u64,
    ) -> Self {
        Self {
            router,
            writer,
            notifier,
            retention: Duration::from_millis(retention_ms),
            state: Arc::new(Mutex::new(MoveState::default())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MoveState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pending_moves(&self) -> Vec<MoveData> {
        self.lock().pending.values().cloned().collect()
    }

    pub fn recently_completed_moves(&self) -> Vec<MoveData> {
        self.lock().recent.values().cloned().collect()
    }

    /// The grouping the UI should show right now: base rows with both move
    /// overlays applied, bucketed into groups.
    pub fn grouped_view(&self, base_members: &[Value]) -> Vec<CampGroup> {
        let state = self.lock();
        let overlaid = apply_move_overlays(base_members, &state.pending, &state.recent);
        organize_camp_groups(&overlaid)
    }

    fn new_move_id(scoutid: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(scoutid.to_le_bytes());
        hasher.update(now_ms().to_le_bytes());
        let digest = hasher.finalize();
        let mut id = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            id.push_str(&format!("{byte:02x}"));
        }
        id
    }

    fn schedule_expiry(&self, move_id: String) {
        let state = Arc::clone(&self.state);
        let retention = self.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            state.recent.remove(&move_id);
        });
    }

    /// Moves a member between camp groups.
    ///
    /// The optimistic entry goes into `pending_moves` before the remote
    /// write starts, so a `grouped_view` taken mid-flight already shows the
    /// new group. A confirmed move lingers in `recently_completed_moves`
    /// for the retention window; a rejected one is removed immediately and
    /// the failure text goes to the notifier.
    pub async fn move_member(
        &self,
        member: &Value,
        from_group: Option<&str>,
        to_group: Option<&str>,
    ) -> AppResult<MoveOutcome> {
        if from_group == to_group {
            return Ok(MoveOutcome::DuplicateDrop);
        }
        let scoutid = scout_id_of(member)?;

        let move_id = Self::new_move_id(scoutid);
        let data = MoveData {
            move_id: move_id.clone(),
            scoutid,
            from_group: from_group.map(str::to_string),
            to_group: to_group.map(str::to_string),
            started_at: now_ms(),
        };
        self.lock().pending.insert(move_id.clone(), data);

        let abandon = |message: &str| {
            self.lock().pending.remove(&move_id);
            self.notifier.notify(message);
        };

        let Some(section_id) = section_id_of(member) else {
            abandon("No camp group record found for this section.");
            return Ok(MoveOutcome::Abandoned);
        };
        // Missing flexi structure is the one failure that stays graceful:
        // the notifier speaks and the caller gets a clean outcome.
        let context = match resolve_flexi_context(&self.router, section_id).await {
            Ok(Some(context)) => context,
            Ok(None) | Err(_) => {
                abandon("No camp group record found for this section.");
                return Ok(MoveOutcome::Abandoned);
            }
        };

        let request = CampGroupWriteRequest {
            member: member.clone(),
            section_id,
            term_id: context.term_id,
            section_type: member
                .get("section")
                .or_else(|| member.get("sectiontype"))
                .and_then(Value::as_str)
                .map(str::to_string),
            from_group: from_group.map(str::to_string),
            to_group: to_group.map(str::to_string),
            camp_group_field_id: context.camp_group_field_id,
        };

        match self.writer.write_camp_group(request).await {
            Ok(()) => {
                let mut state = self.lock();
                if let Some(data) = state.pending.remove(&move_id) {
                    state.recent.insert(move_id.clone(), data);
                }
                drop(state);
                self.schedule_expiry(move_id.clone());
                tracing::info!(
                    target = "vikingbase",
                    event = "camp_group_move_applied",
                    move_id = %move_id,
                    scoutid,
                    to_group = to_group.unwrap_or("unassigned")
                );
                Ok(MoveOutcome::Applied(move_id))
            }
            Err(err) => {
                self.lock().pending.remove(&move_id);
                let message = format!("Failed to move member: {}", err.message());
                self.notifier.notify(&message);
                tracing::warn!(
                    target = "vikingbase",
                    event = "camp_group_move_rejected",
                    move_id = %move_id,
                    scoutid,
                    error = %err
                );
                Err(AppError::new(AppError::REMOTE_WRITE_FAILED, message).with_cause(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::legacy_kv::LegacyKv;
    use crate::object_store::ObjectStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn member(scoutid: i64, name: &str, group: Option<&str>, person_type: &str) -> Value {
        let mut row = json!({
            "scoutid": scoutid,
            "firstname": name,
            "lastname": "Scout",
            "sectionid": 7,
            "person_type": person_type,
        });
        if let Some(group) = group {
            row["CampGroup"] = json!(group);
        }
        row
    }

    #[test]
    fn grouping_excludes_leaders_and_orders_groups() {
        let members = vec![
            member(1, "Zoe", Some("3"), "Young People"),
            member(2, "Amy", Some("3"), "Young People"),
            member(3, "Ben", Some("10"), "Young People"),
            member(4, "Cal", None, "Young People"),
            member(5, "Lea", Some("1"), "Leaders"),
            member(6, "Yve", Some("2"), "Young Leaders"),
        ];
        let groups = organize_camp_groups(&members);
        let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["Group 3", "Group 10", "Unassigned"]);

        // Members sort by display name within the group.
        let group3: Vec<i64> = groups[0]
            .members
            .iter()
            .map(|m| m["scoutid"].as_i64().unwrap())
            .collect();
        assert_eq!(group3, vec![2, 1]);
        assert!(groups
            .iter()
            .all(|g| g.members.iter().all(|m| !is_leader(m))));
    }

    #[test]
    fn overlay_pending_wins_over_recent() {
        let members = vec![member(1, "Amy", Some("3"), "Young People")];
        let mut pending = HashMap::new();
        pending.insert(
            "p".to_string(),
            MoveData {
                move_id: "p".into(),
                scoutid: 1,
                from_group: Some("3".into()),
                to_group: Some("5".into()),
                started_at: 10,
            },
        );
        let mut recent = HashMap::new();
        recent.insert(
            "r".to_string(),
            MoveData {
                move_id: "r".into(),
                scoutid: 1,
                from_group: Some("3".into()),
                to_group: Some("4".into()),
                started_at: 20,
            },
        );

        let overlaid = apply_move_overlays(&members, &pending, &recent);
        assert_eq!(overlaid[0]["CampGroup"], "5");

        let settled = apply_move_overlays(&members, &HashMap::new(), &recent);
        assert_eq!(settled[0]["CampGroup"], "4");
    }

    #[test]
    fn camp_group_field_found_in_nested_and_stringified_config() {
        let plain = json!({"structure": [{"name": "CampGroup", "id": "f_1"}]});
        assert_eq!(find_camp_group_field(&plain).as_deref(), Some("f_1"));

        let stringified = json!({
            "config": "[{\"id\": \"f_2\", \"name\": \"CampGroup\"}]"
        });
        assert_eq!(find_camp_group_field(&stringified).as_deref(), Some("f_2"));

        let absent = json!({"structure": [{"name": "Patrol", "id": "f_3"}]});
        assert_eq!(find_camp_group_field(&absent), None);
    }

    struct StubWriter {
        fail_with: Option<String>,
        calls: AtomicUsize,
    }

    impl CampGroupWriter for StubWriter {
        fn write_camp_group(
            &self,
            _request: CampGroupWriteRequest,
        ) -> BoxFuture<'static, AppResult<()>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail_with.clone();
            Box::pin(async move {
                match fail {
                    Some(reason) => Err(AppError::new(AppError::REMOTE_WRITE_FAILED, reason)),
                    None => Ok(()),
                }
            })
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<String>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }

    async fn engine_with(
        fail_with: Option<String>,
        retention_ms: u64,
    ) -> (CampGroupEngine, Arc<RecordingNotifier>) {
        let legacy = Arc::new(LegacyKv::in_memory(1024 * 1024));
        legacy
            .set_json(
                "viking_flexi_structure_42_offline",
                &json!({"structure": [{"name": "CampGroup", "id": "f_1"}]}),
            )
            .unwrap();
        legacy.set_item("viking_flexi_data_42_7_t9_offline", "{}").unwrap();
        let store = ObjectStore::open_in_memory().await.unwrap();
        let router = Arc::new(KeyRouter::new(store, legacy, "viking"));
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = CampGroupEngine::new(
            router,
            Arc::new(StubWriter {
                fail_with,
                calls: AtomicUsize::new(0),
            }),
            notifier.clone(),
            retention_ms,
        );
        (engine, notifier)
    }

    #[tokio::test]
    async fn successful_move_updates_view_then_retires() {
        let (engine, _) = engine_with(None, 30).await;
        let base = vec![member(1, "Amy", Some("3"), "Young People")];

        let outcome = engine
            .move_member(&base[0], Some("3"), Some("5"))
            .await
            .unwrap();
        assert!(matches!(outcome, MoveOutcome::Applied(_)));

        // Confirmed move is held in the completed overlay and still shows
        // the member in the new group.
        assert!(engine.pending_moves().is_empty());
        assert_eq!(engine.recently_completed_moves().len(), 1);
        let groups = engine.grouped_view(&base);
        assert_eq!(groups[0].name, "Group 5");

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(engine.recently_completed_moves().is_empty());
        // Base data is authoritative again after retention.
        let groups = engine.grouped_view(&base);
        assert_eq!(groups[0].name, "Group 3");
    }

    #[tokio::test]
    async fn rejected_move_reverts_and_notifies() {
        let (engine, notifier) = engine_with(Some("section is closed".into()), 5_000).await;
        let base = vec![member(1, "Amy", Some("3"), "Young People")];

        let err = engine
            .move_member(&base[0], Some("3"), Some("5"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), AppError::REMOTE_WRITE_FAILED);

        assert!(engine.pending_moves().is_empty());
        assert!(engine.recently_completed_moves().is_empty());
        let groups = engine.grouped_view(&base);
        assert_eq!(groups[0].name, "Group 3");
        assert_eq!(
            notifier.messages.lock().unwrap().as_slice(),
            ["Failed to move member: section is closed"]
        );
    }

    #[tokio::test]
    async fn duplicate_drop_is_a_no_op() {
        let (engine, notifier) = engine_with(None, 5_000).await;
        let base = member(1, "Amy", Some("3"), "Young People");
        let outcome = engine.move_member(&base, Some("3"), Some("3")).await.unwrap();
        assert_eq!(outcome, MoveOutcome::DuplicateDrop);
        assert!(engine.pending_moves().is_empty());
        assert!(notifier.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_structure_abandons_gracefully() {
        let legacy = Arc::new(LegacyKv::in_memory(1024 * 1024));
        let store = ObjectStore::open_in_memory().await.unwrap();
        let router = Arc::new(KeyRouter::new(store, legacy, "viking"));
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = CampGroupEngine::new(
            router,
            Arc::new(StubWriter {
                fail_with: None,
                calls: AtomicUsize::new(0),
            }),
            notifier.clone(),
            5_000,
        );

        let base = member(1, "Amy", Some("3"), "Young People");
        let outcome = engine.move_member(&base, Some("3"), Some("5")).await.unwrap();
        assert_eq!(outcome, MoveOutcome::Abandoned);
        assert!(engine.pending_moves().is_empty());
        assert_eq!(
            notifier.messages.lock().unwrap().as_slice(),
            ["No camp group record found for this section."]
        );
    }

    #[tokio::test]
    async fn flexi_context_resolves_from_legacy_fallback() {
        let (engine, _) = engine_with(None, 5_000).await;
        let context = resolve_flexi_context(&engine.router, 7).await.unwrap().unwrap();
        assert_eq!(context.record_id, "42");
        assert_eq!(context.camp_group_field_id, "f_1");
        assert_eq!(context.term_id.as_deref(), Some("t9"));
    }
}
