//! Phased migration of legacy flat-store entries into the object store.
//!
//! Each phase covers a fixed slice of the legacy keyspace. A run scans the
//! legacy store, validates every candidate, writes the survivors through
//! the router, records one log row per migrated key, and verifies by
//! reading back. The log rows carry the original raw value, which is what
//! makes rollback exact: the legacy store gets back the same bytes it held
//! before the migration.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::key_router::{Backing, CacheEntryType, KeyRouter, Target};
use crate::model::as_i64;
use crate::object_store::IndexQuery;
use crate::stores::{Key, StoreName};
use crate::time::now_ms;
use crate::validation::{is_object, is_plausible_timestamp_ms};
use crate::{AppError, AppResult};

use crate::migrate::DATABASE_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    CacheSync,
    Configuration,
    Flexi,
    Events,
    Members,
}

impl MigrationPhase {
    pub const ALL: &'static [MigrationPhase] = &[
        MigrationPhase::CacheSync,
        MigrationPhase::Configuration,
        MigrationPhase::Flexi,
        MigrationPhase::Events,
        MigrationPhase::Members,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MigrationPhase::CacheSync => "cache_sync",
            MigrationPhase::Configuration => "configuration",
            MigrationPhase::Flexi => "flexi",
            MigrationPhase::Events => "events",
            MigrationPhase::Members => "members",
        }
    }

    /// Object stores a phase writes into, used for the integrity counts.
    fn stores(self) -> &'static [StoreName] {
        match self {
            MigrationPhase::CacheSync => &[StoreName::CacheData],
            MigrationPhase::Configuration => &[
                StoreName::Sections,
                StoreName::StartupData,
                StoreName::Terms,
                StoreName::CurrentActiveTerms,
            ],
            MigrationPhase::Flexi => &[
                StoreName::FlexiLists,
                StoreName::FlexiStructure,
                StoreName::FlexiData,
            ],
            MigrationPhase::Events => &[
                StoreName::Events,
                StoreName::Attendance,
                StoreName::SharedAttendance,
            ],
            MigrationPhase::Members => &[StoreName::Members],
        }
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which phase owns a routed target.
fn phase_of(target: &Target) -> MigrationPhase {
    match target {
        Target::CacheEntry(_) => MigrationPhase::CacheSync,
        Target::Sections
        | Target::StartupData
        | Target::Terms
        | Target::CurrentActiveTerms => MigrationPhase::Configuration,
        Target::FlexiLists { .. } | Target::FlexiStructure { .. } | Target::FlexiData { .. } => {
            MigrationPhase::Flexi
        }
        Target::Events { .. } | Target::Attendance { .. } | Target::SharedAttendance { .. } => {
            MigrationPhase::Events
        }
        Target::MembersBlob => MigrationPhase::Members,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    PartialFailure,
    RolledBack,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::PartialFailure => "partial_failure",
            PhaseStatus::RolledBack => "rolled_back",
        }
    }

    fn parse(raw: &str) -> PhaseStatus {
        match raw {
            "in_progress" => PhaseStatus::InProgress,
            "completed" => PhaseStatus::Completed,
            "failed" => PhaseStatus::Failed,
            "partial_failure" => PhaseStatus::PartialFailure,
            "rolled_back" => PhaseStatus::RolledBack,
            _ => PhaseStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStep {
    Scanning,
    Validating,
    Migrating,
    Verifying,
    Complete,
}

pub type ProgressFn = Box<dyn Fn(ProgressStep, u8) + Send + Sync>;

#[derive(Default)]
pub struct MigrationOptions {
    /// Scan, validate and report without writing anything.
    pub dry_run: bool,
    /// Downgrade validation failures to skips instead of aborting the run.
    /// Structurally unusable values (null, unparseable JSON) are still never
    /// written anywhere.
    pub skip_validation: bool,
    pub progress: Option<ProgressFn>,
}

impl MigrationOptions {
    fn report(&self, step: ProgressStep, percent: u8) {
        if let Some(progress) = &self.progress {
            progress(step, percent);
        }
    }
}

/// Per-store row counts next to the legacy remnant count, so a host can
/// eyeball whether a phase actually moved its data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub object_counts: BTreeMap<String, u64>,
    pub legacy_remaining: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub success: bool,
    pub migration_id: String,
    pub phase: MigrationPhase,
    pub dry_run: bool,
    pub total_items: usize,
    pub migrated_items: usize,
    pub skipped_items: usize,
    pub errors: Vec<String>,
    pub verification_errors: Vec<String>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
    pub integrity: IntegrityReport,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct RollbackReport {
    pub restored_items: usize,
    pub failed_items: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct CleanupReport {
    pub removed_keys: usize,
    pub skipped_keys: usize,
    pub errors: Vec<String>,
}

struct ScannedItem {
    key: String,
    target: Target,
    raw: String,
    value: Value,
}

enum Verdict {
    Valid,
    Warning(String),
    Invalid(String),
}

fn new_migration_id(phase: MigrationPhase) -> String {
    let mut hasher = Sha256::new();
    hasher.update(phase.as_str().as_bytes());
    hasher.update(now_ms().to_le_bytes());
    let digest = hasher.finalize();
    let mut id = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

/// Enumerates legacy keys belonging to a phase. Keys the router cannot map
/// to an object-store target never migrate and are not scanned.
fn scan_phase(router: &KeyRouter, phase: MigrationPhase) -> Vec<ScannedItem> {
    let mut items = Vec::new();
    for key in router.legacy().keys() {
        let Backing::Object(target) = router.route(&key) else {
            continue;
        };
        if phase_of(&target) != phase {
            continue;
        }
        let Some(raw) = router.legacy().get_item(&key) else {
            continue;
        };
        let value = match serde_json::from_str::<Value>(&raw) {
            Ok(value) => value,
            // Cache entries were written as bare strings by old clients;
            // everything else must parse.
            Err(_) if matches!(target, Target::CacheEntry(_)) => Value::String(raw.clone()),
            Err(_) => Value::Null,
        };
        items.push(ScannedItem {
            key,
            target,
            raw,
            value,
        });
    }
    items
}

fn rows_missing_field(rows: &[Value], field: &str, alias: Option<&str>) -> usize {
    rows.iter()
        .filter(|row| {
            let has = row.get(field).map(|v| !v.is_null()).unwrap_or(false);
            let has_alias = alias
                .and_then(|a| row.get(a))
                .map(|v| !v.is_null())
                .unwrap_or(false);
            !(has || has_alias)
        })
        .count()
}

fn timestamp_of(value: &Value) -> Option<i64> {
    match value {
        Value::Number(_) => as_i64(value),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn validate_item(item: &ScannedItem) -> Verdict {
    let value = &item.value;
    if value.is_null() {
        return Verdict::Invalid("value is null or unparseable".into());
    }
    match &item.target {
        Target::CacheEntry(CacheEntryType::Sync) | Target::CacheEntry(CacheEntryType::Cache) => {
            match timestamp_of(value) {
                Some(ts) if is_plausible_timestamp_ms(ts) => Verdict::Valid,
                Some(ts) => Verdict::Warning(format!("implausible timestamp {ts}")),
                None => Verdict::Invalid("cache entry is not a timestamp".into()),
            }
        }
        Target::CacheEntry(_) => {
            if is_object(value) {
                Verdict::Valid
            } else {
                Verdict::Invalid("cache entry is not an object".into())
            }
        }
        Target::Sections => match value.as_array() {
            Some(rows) if rows.is_empty() => Verdict::Warning("empty sections blob".into()),
            Some(rows) => {
                let missing = rows_missing_field(rows, "sectionid", None);
                if missing > 0 {
                    Verdict::Invalid(format!("{missing} section rows missing sectionid"))
                } else {
                    Verdict::Valid
                }
            }
            None => Verdict::Invalid("sections blob is not an array".into()),
        },
        Target::StartupData => {
            if is_object(value) {
                Verdict::Valid
            } else {
                Verdict::Invalid("startup data is not an object".into())
            }
        }
        Target::Terms | Target::MembersBlob => {
            if value.is_object() || value.is_array() {
                Verdict::Valid
            } else {
                Verdict::Invalid("blob is neither an object nor an array".into())
            }
        }
        Target::CurrentActiveTerms => {
            if value.is_object() || value.is_array() {
                Verdict::Valid
            } else {
                Verdict::Invalid("active terms blob is neither an object nor an array".into())
            }
        }
        Target::FlexiLists { .. } | Target::FlexiStructure { .. } | Target::FlexiData { .. } => {
            if value.is_object() || value.is_array() {
                Verdict::Valid
            } else {
                Verdict::Invalid("flexi blob is neither an object nor an array".into())
            }
        }
        Target::Events { .. } => {
            let rows = match value {
                Value::Array(rows) => Some(rows.as_slice()),
                Value::Object(map) => map.get("items").and_then(Value::as_array).map(Vec::as_slice),
                _ => None,
            };
            match rows {
                Some([]) => Verdict::Warning("empty events blob".into()),
                Some(rows) => {
                    let missing = rows_missing_field(rows, "eventid", None);
                    if missing > 0 {
                        Verdict::Invalid(format!("{missing} event rows missing eventid"))
                    } else {
                        Verdict::Valid
                    }
                }
                None => Verdict::Invalid("events blob has no rows".into()),
            }
        }
        Target::Attendance { .. } | Target::SharedAttendance { .. } => match value.as_array() {
            Some(rows) if rows.is_empty() => Verdict::Warning("empty attendance blob".into()),
            Some(rows) => {
                let missing = rows_missing_field(rows, "scoutid", Some("member_id"));
                if missing > 0 {
                    Verdict::Invalid(format!("{missing} attendance rows missing scoutid"))
                } else {
                    Verdict::Valid
                }
            }
            None => Verdict::Invalid("attendance blob is not an array".into()),
        },
    }
}

/// True for blobs that would write nothing to the object store; migrating
/// them produces rows that cannot be verified by read-back, so they are
/// skipped with a warning instead.
fn is_empty_blob(item: &ScannedItem) -> bool {
    match &item.target {
        Target::Sections
        | Target::Events { .. }
        | Target::Attendance { .. }
        | Target::SharedAttendance { .. } => {
            matches!(&item.value, Value::Array(rows) if rows.is_empty())
        }
        _ => false,
    }
}

fn entry_type_of(target: &Target) -> &'static str {
    match target {
        Target::CacheEntry(entry_type) => entry_type.as_str(),
        other => other.store().as_str(),
    }
}

fn extracted_ids(target: &Target) -> Map<String, Value> {
    let mut ids = Map::new();
    match target {
        Target::FlexiLists { section_id } => {
            ids.insert("section_id".into(), json!(section_id));
        }
        Target::FlexiStructure { record_id } => {
            ids.insert("record_id".into(), json!(record_id));
        }
        Target::FlexiData {
            record_id,
            section_id,
            term_id,
        } => {
            ids.insert("record_id".into(), json!(record_id));
            ids.insert("section_id".into(), json!(section_id));
            ids.insert("term_id".into(), json!(term_id));
        }
        Target::Events { section_id } => {
            ids.insert("section_id".into(), json!(section_id));
        }
        Target::Attendance { event_id } => {
            ids.insert("event_id".into(), json!(event_id));
        }
        Target::SharedAttendance {
            event_id,
            section_id,
        } => {
            ids.insert("event_id".into(), json!(event_id));
            ids.insert("section_id".into(), json!(section_id));
        }
        _ => {}
    }
    ids
}

fn log_row(item: &ScannedItem, phase: MigrationPhase, migration_id: &str) -> Value {
    json!({
        "key": item.key,
        "original_key": item.key,
        "original_raw": item.raw,
        "entry_type": entry_type_of(&item.target),
        "migrated_at": now_ms(),
        "phase": phase.as_str(),
        "version": DATABASE_VERSION,
        "migration_id": migration_id,
        "extracted": Value::Object(extracted_ids(&item.target)),
    })
}

async fn set_status(
    router: &KeyRouter,
    phase: MigrationPhase,
    status: PhaseStatus,
    migration_id: &str,
) -> AppResult<()> {
    let row = json!({
        "phase": phase.as_str(),
        "status": status.as_str(),
        "migration_id": migration_id,
        "updated_at": now_ms(),
    });
    router
        .object_store()
        .put(StoreName::MigrationStatus, &row)
        .await?;
    Ok(())
}

/// Persisted status of a phase; `Pending` when it has never run.
pub async fn phase_status(router: &KeyRouter, phase: MigrationPhase) -> AppResult<PhaseStatus> {
    let row = router
        .object_store()
        .get(StoreName::MigrationStatus, &Key::from(phase.as_str()))
        .await?;
    Ok(row
        .as_ref()
        .and_then(|r| r.get("status"))
        .and_then(Value::as_str)
        .map(PhaseStatus::parse)
        .unwrap_or(PhaseStatus::Pending))
}

async fn log_rows_for_phase(router: &KeyRouter, phase: MigrationPhase) -> AppResult<Vec<Value>> {
    router
        .object_store()
        .get_all_from_index(
            StoreName::MigrationLog,
            "phase",
            IndexQuery::Equals(json!(phase.as_str())),
        )
        .await
}

async fn integrity_for(router: &KeyRouter, phase: MigrationPhase) -> AppResult<IntegrityReport> {
    let mut object_counts = BTreeMap::new();
    for store in phase.stores() {
        object_counts.insert(
            store.as_str().to_string(),
            router.object_store().count(*store).await?,
        );
    }
    let legacy_remaining = scan_phase(router, phase).len();
    Ok(IntegrityReport {
        object_counts,
        legacy_remaining,
    })
}

/// Runs one migration phase end to end.
///
/// A phase already marked `completed` is a no-op: nothing is scanned and
/// the report comes back successful with zero items.
pub async fn execute_migration(
    router: &KeyRouter,
    phase: MigrationPhase,
    opts: &MigrationOptions,
) -> AppResult<MigrationReport> {
    let started = Instant::now();
    let migration_id = new_migration_id(phase);

    if phase_status(router, phase).await? == PhaseStatus::Completed {
        opts.report(ProgressStep::Complete, 100);
        return Ok(MigrationReport {
            success: true,
            migration_id,
            phase,
            dry_run: opts.dry_run,
            total_items: 0,
            migrated_items: 0,
            skipped_items: 0,
            errors: Vec::new(),
            verification_errors: Vec::new(),
            warnings: vec![format!("phase {phase} already completed")],
            duration_ms: started.elapsed().as_millis() as u64,
            integrity: integrity_for(router, phase).await?,
        });
    }

    opts.report(ProgressStep::Scanning, 5);
    let items = scan_phase(router, phase);
    let total_items = items.len();
    tracing::info!(
        target = "vikingbase",
        event = "migration_scanned",
        phase = %phase,
        migration_id = %migration_id,
        items = total_items
    );

    opts.report(ProgressStep::Validating, 25);
    let mut warnings = Vec::new();
    let mut errors = Vec::new();
    let mut skipped_items = 0usize;
    let mut migratable = Vec::new();
    for item in items {
        match validate_item(&item) {
            Verdict::Invalid(reason) => {
                if opts.skip_validation {
                    warnings.push(format!("skipped {}: {reason}", item.key));
                    skipped_items += 1;
                } else {
                    errors.push(format!("{}: {reason}", item.key));
                }
            }
            Verdict::Warning(reason) if is_empty_blob(&item) => {
                warnings.push(format!("skipped {}: {reason}", item.key));
                skipped_items += 1;
            }
            Verdict::Warning(reason) => {
                warnings.push(format!("{}: {reason}", item.key));
                migratable.push(item);
            }
            Verdict::Valid => migratable.push(item),
        }
    }

    if !errors.is_empty() {
        if !opts.dry_run {
            set_status(router, phase, PhaseStatus::Failed, &migration_id).await?;
        }
        opts.report(ProgressStep::Complete, 100);
        return Ok(MigrationReport {
            success: false,
            migration_id,
            phase,
            dry_run: opts.dry_run,
            total_items,
            migrated_items: 0,
            skipped_items,
            errors,
            verification_errors: Vec::new(),
            warnings,
            duration_ms: started.elapsed().as_millis() as u64,
            integrity: integrity_for(router, phase).await?,
        });
    }

    opts.report(ProgressStep::Migrating, 50);
    let mut migrated_items = 0usize;
    let mut written = Vec::new();
    if !opts.dry_run {
        set_status(router, phase, PhaseStatus::InProgress, &migration_id).await?;
        for item in &migratable {
            match router.set(&item.key, &item.value).await {
                Ok(()) => {
                    router
                        .object_store()
                        .put(StoreName::MigrationLog, &log_row(item, phase, &migration_id))
                        .await?;
                    migrated_items += 1;
                    written.push(item);
                }
                Err(err) => {
                    errors.push(format!("{}: {err}", item.key));
                }
            }
        }
    }

    opts.report(ProgressStep::Verifying, 85);
    let mut verification_errors = Vec::new();
    for item in &written {
        match router.get_object(&item.key, &item.target).await {
            Ok(Some(_)) => {}
            Ok(None) => verification_errors.push(format!(
                "{}: no object-store data after migration",
                item.key
            )),
            Err(err) => verification_errors.push(format!("{}: {err}", item.key)),
        }
    }

    let success = errors.is_empty() && verification_errors.is_empty();
    if !opts.dry_run {
        let status = if success {
            PhaseStatus::Completed
        } else if migrated_items > 0 {
            PhaseStatus::PartialFailure
        } else {
            PhaseStatus::Failed
        };
        set_status(router, phase, status, &migration_id).await?;
    }

    opts.report(ProgressStep::Complete, 100);
    let report = MigrationReport {
        success,
        migration_id,
        phase,
        dry_run: opts.dry_run,
        total_items,
        migrated_items,
        skipped_items,
        errors,
        verification_errors,
        warnings,
        duration_ms: started.elapsed().as_millis() as u64,
        integrity: integrity_for(router, phase).await?,
    };
    tracing::info!(
        target = "vikingbase",
        event = "migration_finished",
        phase = %phase,
        migration_id = %report.migration_id,
        success = report.success,
        migrated = report.migrated_items,
        skipped = report.skipped_items,
        errors = report.errors.len()
    );
    Ok(report)
}

/// Re-checks every log row of a phase against the object store. Returns
/// one message per key whose data is missing.
pub async fn verify_migration(
    router: &KeyRouter,
    phase: MigrationPhase,
) -> AppResult<Vec<String>> {
    let mut errors = Vec::new();
    for row in log_rows_for_phase(router, phase).await? {
        let Some(key) = row.get("original_key").and_then(Value::as_str) else {
            errors.push("log row without original_key".to_string());
            continue;
        };
        let Backing::Object(target) = router.route(key) else {
            errors.push(format!("{key}: no longer routes to the object store"));
            continue;
        };
        match router.get_object(key, &target).await {
            Ok(Some(_)) => {}
            Ok(None) => errors.push(format!("{key}: object-store data missing")),
            Err(err) => errors.push(format!("{key}: {err}")),
        }
    }
    Ok(errors)
}

/// Undoes a phase: restores every logged key to the legacy store with its
/// original raw value, then deletes the object-store copy and the log row.
/// Items are independent; a failure on one is counted and the rest proceed.
pub async fn execute_rollback(
    router: &KeyRouter,
    phase: MigrationPhase,
) -> AppResult<RollbackReport> {
    let rows = log_rows_for_phase(router, phase).await?;
    let mut report = RollbackReport::default();

    for row in rows {
        let key = row
            .get("original_key")
            .and_then(Value::as_str)
            .map(str::to_string);
        let raw = row
            .get("original_raw")
            .and_then(Value::as_str)
            .map(str::to_string);
        let (Some(key), Some(raw)) = (key, raw) else {
            report.failed_items += 1;
            report.errors.push("log row missing key or value".into());
            continue;
        };

        let restore = async {
            router
                .legacy()
                .set_item(&key, &raw)
                .map_err(|e| AppError::new(AppError::STORE_UNAVAILABLE, e.to_string()))?;
            if let Backing::Object(target) = router.route(&key) {
                router.remove_object(&key, &target).await?;
            }
            router
                .object_store()
                .delete(StoreName::MigrationLog, &Key::from(key.as_str()))
                .await?;
            Ok::<(), AppError>(())
        };
        match restore.await {
            Ok(()) => report.restored_items += 1,
            Err(err) => {
                report.failed_items += 1;
                report.errors.push(format!("{key}: {err}"));
            }
        }
    }

    let status = if report.failed_items == 0 {
        PhaseStatus::RolledBack
    } else {
        PhaseStatus::PartialFailure
    };
    set_status(router, phase, status, "rollback").await?;
    tracing::info!(
        target = "vikingbase",
        event = "migration_rolled_back",
        phase = %phase,
        restored = report.restored_items,
        failed = report.failed_items
    );
    Ok(report)
}

/// Removes the legacy copies of a completed phase. Each key is verified
/// against the object store first; a missing object copy skips that key and
/// leaves the legacy value in place.
pub async fn cleanup_legacy(
    router: &KeyRouter,
    phase: MigrationPhase,
) -> AppResult<CleanupReport> {
    let status = phase_status(router, phase).await?;
    if status != PhaseStatus::Completed {
        return Err(AppError::new(
            AppError::CONFLICT_OR_STALE,
            format!("cannot clean up phase {phase} in status {}", status.as_str()),
        ));
    }

    let mut report = CleanupReport::default();
    for row in log_rows_for_phase(router, phase).await? {
        let Some(key) = row.get("original_key").and_then(Value::as_str) else {
            continue;
        };
        let Backing::Object(target) = router.route(key) else {
            report.skipped_keys += 1;
            continue;
        };
        match router.get_object(key, &target).await {
            Ok(Some(_)) => match router.legacy().remove_item(key) {
                Ok(()) => report.removed_keys += 1,
                Err(err) => {
                    report.errors.push(format!("{key}: {err}"));
                }
            },
            Ok(None) => {
                report.skipped_keys += 1;
                tracing::warn!(
                    target = "vikingbase",
                    event = "cleanup_skipped_missing_copy",
                    key = %key,
                    phase = %phase
                );
            }
            Err(err) => {
                report.skipped_keys += 1;
                report.errors.push(format!("{key}: {err}"));
            }
        }
    }
    Ok(report)
}
