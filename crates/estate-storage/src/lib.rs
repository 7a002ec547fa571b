//! Record stores for ERP-synced entities: Postgres via sqlx, plus an
//! in-memory twin used by tests and dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use estate_core::{
    Building, EntityKind, ErpBuildingFields, NewBuilding, SnapshotDetail, SnapshotRow,
    UserBuildingFields,
};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Acquire, Postgres, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "estate-storage";

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn connect_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    MIGRATOR.run(pool).await.context("applying migrations")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("no {kind} row with id {id}")]
    NotFound { kind: EntityKind, id: i64 },
    #[error("external id `{0}` is already claimed by another row")]
    Conflict(String),
    #[error("{row} row cannot be written to {target}")]
    KindMismatch { row: EntityKind, target: EntityKind },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence contract for the upsert-by-external-id strategy.
#[async_trait]
pub trait BuildingStore: Send + Sync {
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<Building>, StoreError>;

    async fn create(&self, record: NewBuilding) -> Result<Building, StoreError>;

    /// Writes ERP-owned columns, `synced_at` and `updated_at` only.
    async fn update_erp_fields(
        &self,
        id: i64,
        patch: &ErpBuildingFields,
        synced_at: DateTime<Utc>,
    ) -> Result<Building, StoreError>;

    /// End-user write path. Never called by sync.
    async fn set_user_fields(
        &self,
        id: i64,
        fields: &UserBuildingFields,
    ) -> Result<Building, StoreError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub inserted: usize,
    pub skipped: usize,
}

/// Persistence contract for the full-refresh strategy.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Truncate `kind`'s table and insert `rows` in one transaction. Rows that
    /// fail to insert are skipped; an error means nothing was changed.
    async fn replace_all(
        &self,
        kind: EntityKind,
        rows: &[SnapshotRow],
    ) -> Result<ReplaceOutcome, StoreError>;

    async fn count(&self, kind: EntityKind) -> Result<usize, StoreError>;
}

pub fn payload_sha256(payload: &JsonValue) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

const BUILDING_COLUMNS: &str = "id, external_id, name, classification, status, address, city, \
     district, latitude, longitude, floors, total_area, erp_modified, sellable, connectivity, \
     resource_class, synced_at, created_at, updated_at";

const INSERT_BUILDING_SQL: &str = "INSERT INTO buildings \
     (external_id, name, classification, status, address, city, district, latitude, longitude, \
      floors, total_area, erp_modified, synced_at, created_at, updated_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, now(), now())";

const UPDATE_ERP_SQL: &str = "UPDATE buildings SET \
     external_id = $2, name = $3, classification = $4, status = $5, address = $6, city = $7, \
     district = $8, latitude = $9, longitude = $10, floors = $11, total_area = $12, \
     erp_modified = $13, synced_at = $14, updated_at = now() \
     WHERE id = $1";

const UPDATE_USER_SQL: &str = "UPDATE buildings SET \
     sellable = $2, connectivity = $3, resource_class = $4, updated_at = now() \
     WHERE id = $1";

fn building_from_row(row: &PgRow) -> Result<Building, sqlx::Error> {
    Ok(Building {
        id: row.try_get("id")?,
        erp: ErpBuildingFields {
            external_id: row.try_get("external_id")?,
            name: row.try_get("name")?,
            classification: row.try_get("classification")?,
            status: row.try_get("status")?,
            address: row.try_get("address")?,
            city: row.try_get("city")?,
            district: row.try_get("district")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            floors: row.try_get("floors")?,
            total_area: row.try_get("total_area")?,
            erp_modified: row.try_get("erp_modified")?,
        },
        user: UserBuildingFields {
            sellable: row.try_get("sellable")?,
            connectivity: row.try_get("connectivity")?,
            resource_class: row.try_get("resource_class")?,
        },
        synced_at: row.try_get("synced_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_write_error(err: sqlx::Error, external_id: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(external_id.to_string())
        }
        _ => StoreError::Database(err),
    }
}

#[derive(Debug, Clone)]
pub struct PgBuildingStore {
    pool: PgPool,
}

impl PgBuildingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BuildingStore for PgBuildingStore {
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<Building>, StoreError> {
        let sql = format!("SELECT {BUILDING_COLUMNS} FROM buildings WHERE external_id = $1");
        let row = sqlx::query(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(building_from_row).transpose()?)
    }

    async fn create(&self, record: NewBuilding) -> Result<Building, StoreError> {
        let sql = format!("{INSERT_BUILDING_SQL} RETURNING {BUILDING_COLUMNS}");
        let erp = &record.erp;
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&sql)
            .bind(erp.external_id.as_str())
            .bind(erp.name.as_str())
            .bind(erp.classification.as_deref())
            .bind(erp.status.as_deref())
            .bind(erp.address.as_deref())
            .bind(erp.city.as_deref())
            .bind(erp.district.as_deref())
            .bind(erp.latitude)
            .bind(erp.longitude)
            .bind(erp.floors)
            .bind(erp.total_area)
            .bind(erp.erp_modified.as_deref())
            .bind(record.synced_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|err| map_write_error(err, &erp.external_id))?;
        let building = building_from_row(&row)?;
        tx.commit().await?;
        Ok(building)
    }

    async fn update_erp_fields(
        &self,
        id: i64,
        patch: &ErpBuildingFields,
        synced_at: DateTime<Utc>,
    ) -> Result<Building, StoreError> {
        let sql = format!("{UPDATE_ERP_SQL} RETURNING {BUILDING_COLUMNS}");
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(patch.external_id.as_str())
            .bind(patch.name.as_str())
            .bind(patch.classification.as_deref())
            .bind(patch.status.as_deref())
            .bind(patch.address.as_deref())
            .bind(patch.city.as_deref())
            .bind(patch.district.as_deref())
            .bind(patch.latitude)
            .bind(patch.longitude)
            .bind(patch.floors)
            .bind(patch.total_area)
            .bind(patch.erp_modified.as_deref())
            .bind(synced_at)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|err| map_write_error(err, &patch.external_id))?;
        let Some(row) = row else {
            return Err(StoreError::NotFound {
                kind: EntityKind::Buildings,
                id,
            });
        };
        let building = building_from_row(&row)?;
        tx.commit().await?;
        Ok(building)
    }

    async fn set_user_fields(
        &self,
        id: i64,
        fields: &UserBuildingFields,
    ) -> Result<Building, StoreError> {
        let sql = format!("{UPDATE_USER_SQL} RETURNING {BUILDING_COLUMNS}");
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(fields.sellable.as_deref())
            .bind(fields.connectivity.as_deref())
            .bind(fields.resource_class.as_deref())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(building_from_row(&row)?),
            None => Err(StoreError::NotFound {
                kind: EntityKind::Buildings,
                id,
            }),
        }
    }
}

const SNAPSHOT_COMMON_COLUMNS: [&str; 8] = [
    "external_id",
    "building_ref",
    "workflow_state",
    "status",
    "erp_created",
    "erp_modified",
    "raw_payload",
    "payload_sha256",
];

fn snapshot_detail_columns(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Acquisitions => &["seller_name", "acquisition_type", "asking_price"],
        EntityKind::Proposals => &["acquisition_ref", "proposed_price", "valid_until"],
        EntityKind::LettersOfIntent => {
            &["proposal_ref", "buyer_name", "offered_price", "signed_on"]
        }
        EntityKind::Buildings => &[],
    }
}

fn snapshot_insert_sql(kind: EntityKind) -> String {
    let columns = SNAPSHOT_COMMON_COLUMNS
        .iter()
        .chain(snapshot_detail_columns(kind))
        .copied()
        .collect::<Vec<_>>();
    let placeholders = (1..=columns.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        kind.table(),
        columns.join(", "),
        placeholders
    )
}

fn bind_snapshot_row<'q>(
    query: Query<'q, Postgres, PgArguments>,
    row: &'q SnapshotRow,
) -> Query<'q, Postgres, PgArguments> {
    let query = query
        .bind(row.external_id.as_str())
        .bind(row.building_ref.as_deref())
        .bind(row.workflow_state.as_deref())
        .bind(row.status.as_deref())
        .bind(row.erp_created.as_deref())
        .bind(row.erp_modified.as_deref())
        .bind(&row.raw_payload)
        .bind(payload_sha256(&row.raw_payload));
    match &row.detail {
        SnapshotDetail::Acquisition {
            seller_name,
            acquisition_type,
            asking_price,
        } => query
            .bind(seller_name.as_deref())
            .bind(acquisition_type.as_deref())
            .bind(*asking_price),
        SnapshotDetail::Proposal {
            acquisition_ref,
            proposed_price,
            valid_until,
        } => query
            .bind(acquisition_ref.as_deref())
            .bind(*proposed_price)
            .bind(valid_until.as_deref()),
        SnapshotDetail::LetterOfIntent {
            proposal_ref,
            buyer_name,
            offered_price,
            signed_on,
        } => query
            .bind(proposal_ref.as_deref())
            .bind(buyer_name.as_deref())
            .bind(*offered_price)
            .bind(signed_on.as_deref()),
    }
}

#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn replace_all(
        &self,
        kind: EntityKind,
        rows: &[SnapshotRow],
    ) -> Result<ReplaceOutcome, StoreError> {
        if kind == EntityKind::Buildings {
            return Err(StoreError::KindMismatch {
                row: kind,
                target: kind,
            });
        }

        let insert_sql = snapshot_insert_sql(kind);
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("TRUNCATE TABLE {}", kind.table()))
            .execute(&mut *tx)
            .await?;

        let mut outcome = ReplaceOutcome::default();
        for row in rows {
            if row.kind() != kind {
                warn!(
                    %kind,
                    external_id = %row.external_id,
                    row_kind = %row.kind(),
                    "skipping row of another kind"
                );
                outcome.skipped += 1;
                continue;
            }

            // A failed statement poisons the surrounding transaction in
            // postgres, so every row gets its own savepoint.
            let mut savepoint = tx.begin().await?;
            match bind_snapshot_row(sqlx::query(&insert_sql), row)
                .execute(&mut *savepoint)
                .await
            {
                Ok(_) => {
                    savepoint.commit().await?;
                    outcome.inserted += 1;
                }
                Err(err) => {
                    warn!(
                        %kind,
                        external_id = %row.external_id,
                        error = %err,
                        "row insert failed; skipping"
                    );
                    savepoint.rollback().await?;
                    outcome.skipped += 1;
                }
            }
        }

        tx.commit().await?;
        debug!(%kind, inserted = outcome.inserted, skipped = outcome.skipped, "snapshot replaced");
        Ok(outcome)
    }

    async fn count(&self, kind: EntityKind) -> Result<usize, StoreError> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", kind.table()))
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as usize)
    }
}

/// Call counters kept by the in-memory stores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCalls {
    pub finds: usize,
    pub creates: usize,
    pub updates: usize,
    pub user_updates: usize,
    pub replaces: usize,
}

#[derive(Debug, Default)]
struct MemoryBuildings {
    rows: BTreeMap<i64, Building>,
    next_id: i64,
    calls: StoreCalls,
    failing_lookups: HashSet<String>,
    failing_writes: HashSet<String>,
}

/// In-process building store with the same uniqueness rules as the table.
#[derive(Debug, Default)]
pub struct MemoryBuildingStore {
    state: Mutex<MemoryBuildings>,
}

impl MemoryBuildingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make lookups for `external_id` fail with a store error.
    pub async fn fail_lookups_for(&self, external_id: impl Into<String>) {
        self.state.lock().await.failing_lookups.insert(external_id.into());
    }

    /// Make creates and ERP updates for `external_id` fail with a store error.
    pub async fn fail_writes_for(&self, external_id: impl Into<String>) {
        self.state.lock().await.failing_writes.insert(external_id.into());
    }

    pub async fn calls(&self) -> StoreCalls {
        self.state.lock().await.calls
    }

    pub async fn all(&self) -> Vec<Building> {
        self.state.lock().await.rows.values().cloned().collect()
    }

    pub async fn get_by_external_id(&self, external_id: &str) -> Option<Building> {
        self.state
            .lock()
            .await
            .rows
            .values()
            .find(|b| b.erp.external_id == external_id)
            .cloned()
    }
}

#[async_trait]
impl BuildingStore for MemoryBuildingStore {
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<Building>, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.finds += 1;
        if state.failing_lookups.contains(external_id) {
            return Err(StoreError::Unavailable(format!("lookup of `{external_id}` failed")));
        }
        Ok(state
            .rows
            .values()
            .find(|b| b.erp.external_id == external_id)
            .cloned())
    }

    async fn create(&self, record: NewBuilding) -> Result<Building, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.creates += 1;
        let external_id = record.erp.external_id.clone();
        if state.failing_writes.contains(&external_id) {
            return Err(StoreError::Unavailable(format!("insert of `{external_id}` failed")));
        }
        if state.rows.values().any(|b| b.erp.external_id == external_id) {
            return Err(StoreError::Conflict(external_id));
        }
        state.next_id += 1;
        let now = Utc::now();
        let building = Building {
            id: state.next_id,
            erp: record.erp,
            user: UserBuildingFields::default(),
            synced_at: record.synced_at,
            created_at: now,
            updated_at: now,
        };
        state.rows.insert(building.id, building.clone());
        Ok(building)
    }

    async fn update_erp_fields(
        &self,
        id: i64,
        patch: &ErpBuildingFields,
        synced_at: DateTime<Utc>,
    ) -> Result<Building, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.updates += 1;
        if state.failing_writes.contains(&patch.external_id) {
            return Err(StoreError::Unavailable(format!(
                "update of `{}` failed",
                patch.external_id
            )));
        }
        if state
            .rows
            .values()
            .any(|b| b.id != id && b.erp.external_id == patch.external_id)
        {
            return Err(StoreError::Conflict(patch.external_id.clone()));
        }
        let Some(existing) = state.rows.get(&id) else {
            return Err(StoreError::NotFound {
                kind: EntityKind::Buildings,
                id,
            });
        };
        let merged = existing.with_erp_patch(patch.clone(), synced_at, Utc::now());
        state.rows.insert(id, merged.clone());
        Ok(merged)
    }

    async fn set_user_fields(
        &self,
        id: i64,
        fields: &UserBuildingFields,
    ) -> Result<Building, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.user_updates += 1;
        let Some(row) = state.rows.get_mut(&id) else {
            return Err(StoreError::NotFound {
                kind: EntityKind::Buildings,
                id,
            });
        };
        row.user = fields.clone();
        row.updated_at = Utc::now();
        Ok(row.clone())
    }
}

#[derive(Debug, Default)]
struct MemorySnapshots {
    tables: HashMap<EntityKind, Vec<SnapshotRow>>,
    calls: StoreCalls,
    failing_inserts: HashSet<String>,
    fail_truncate: bool,
}

/// In-process snapshot store. A replace either swaps in the new table or,
/// on a fatal error, leaves the old one untouched.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    state: Mutex<MemorySnapshots>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_inserts_for(&self, external_id: impl Into<String>) {
        self.state.lock().await.failing_inserts.insert(external_id.into());
    }

    pub async fn fail_truncate(&self, fail: bool) {
        self.state.lock().await.fail_truncate = fail;
    }

    pub async fn calls(&self) -> StoreCalls {
        self.state.lock().await.calls
    }

    pub async fn rows(&self, kind: EntityKind) -> Vec<SnapshotRow> {
        self.state
            .lock()
            .await
            .tables
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn replace_all(
        &self,
        kind: EntityKind,
        rows: &[SnapshotRow],
    ) -> Result<ReplaceOutcome, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.replaces += 1;
        if kind == EntityKind::Buildings {
            return Err(StoreError::KindMismatch {
                row: kind,
                target: kind,
            });
        }
        if state.fail_truncate {
            return Err(StoreError::Unavailable(format!("truncate of {} failed", kind.table())));
        }

        let mut outcome = ReplaceOutcome::default();
        let mut table: Vec<SnapshotRow> = Vec::with_capacity(rows.len());
        for row in rows {
            let rejected = row.kind() != kind
                || state.failing_inserts.contains(&row.external_id)
                || table.iter().any(|r| r.external_id == row.external_id);
            if rejected {
                warn!(%kind, external_id = %row.external_id, "row insert failed; skipping");
                outcome.skipped += 1;
                continue;
            }
            table.push(row.clone());
            outcome.inserted += 1;
        }
        state.tables.insert(kind, table);
        Ok(outcome)
    }

    async fn count(&self, kind: EntityKind) -> Result<usize, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .tables
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const USER_COLUMNS: [&str; 3] = ["sellable", "connectivity", "resource_class"];

    fn erp(external_id: &str, name: &str) -> ErpBuildingFields {
        ErpBuildingFields {
            external_id: external_id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    fn new_building(external_id: &str, name: &str) -> NewBuilding {
        NewBuilding {
            erp: erp(external_id, name),
            synced_at: Utc::now(),
        }
    }

    fn proposal(external_id: &str) -> SnapshotRow {
        SnapshotRow {
            external_id: external_id.into(),
            building_ref: Some("B1".into()),
            workflow_state: Some("Draft".into()),
            status: None,
            erp_created: Some("2026-02-01 10:00:00".into()),
            erp_modified: None,
            detail: SnapshotDetail::Proposal {
                acquisition_ref: Some("ACQ-1".into()),
                proposed_price: Some(1_250_000.0),
                valid_until: None,
            },
            raw_payload: json!({ "name": external_id }),
        }
    }

    #[test]
    fn payload_hashing_is_stable() {
        assert_eq!(
            payload_sha256(&json!({"name": "P-1"})),
            payload_sha256(&json!({"name": "P-1"}))
        );
        assert_ne!(
            payload_sha256(&json!({"name": "P-1"})),
            payload_sha256(&json!({"name": "P-2"}))
        );
        assert_eq!(payload_sha256(&json!({})).len(), 64);
    }

    #[test]
    fn erp_update_statement_never_names_user_columns() {
        for column in USER_COLUMNS {
            assert!(!UPDATE_ERP_SQL.contains(column), "{column} leaked into ERP update");
            assert!(!INSERT_BUILDING_SQL.contains(column), "{column} leaked into insert");
        }
        assert!(UPDATE_ERP_SQL.contains("synced_at = $14"));
        assert!(UPDATE_USER_SQL.contains("sellable = $2"));
    }

    #[test]
    fn snapshot_insert_sql_matches_table_columns() {
        let sql = snapshot_insert_sql(EntityKind::LettersOfIntent);
        assert!(sql.starts_with("INSERT INTO letters_of_intent (external_id, building_ref"));
        assert!(sql.contains("signed_on) VALUES ("));
        assert!(sql.ends_with("$12)"));

        let sql = snapshot_insert_sql(EntityKind::Acquisitions);
        assert!(sql.contains("asking_price"));
        assert!(sql.ends_with("$11)"));
    }

    #[tokio::test]
    async fn memory_store_create_assigns_ids_and_default_user_fields() {
        let store = MemoryBuildingStore::new();
        let a = store.create(new_building("B1", "Tower")).await.unwrap();
        let b = store.create(new_building("B2", "Annex")).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.user, UserBuildingFields::default());

        let dup = store.create(new_building("B1", "Tower again")).await;
        assert!(matches!(dup, Err(StoreError::Conflict(id)) if id == "B1"));
    }

    #[tokio::test]
    async fn memory_store_erp_update_keeps_user_fields() {
        let store = MemoryBuildingStore::new();
        let created = store.create(new_building("B1", "Tower")).await.unwrap();
        store
            .set_user_fields(
                created.id,
                &UserBuildingFields {
                    sellable: Some("sell".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let updated = store
            .update_erp_fields(created.id, &erp("B1", "Tower Renamed"), Utc::now())
            .await
            .unwrap();
        assert_eq!(updated.erp.name, "Tower Renamed");
        assert_eq!(updated.user.sellable.as_deref(), Some("sell"));

        let missing = store.update_erp_fields(999, &erp("B9", "x"), Utc::now()).await;
        assert!(matches!(missing, Err(StoreError::NotFound { id: 999, .. })));
    }

    #[tokio::test]
    async fn memory_snapshot_replace_skips_failing_rows_and_truncates() {
        let store = MemorySnapshotStore::new();
        store
            .replace_all(EntityKind::Proposals, &[proposal("OLD-1"), proposal("OLD-2")])
            .await
            .unwrap();

        store.fail_inserts_for("P-2").await;
        let outcome = store
            .replace_all(
                EntityKind::Proposals,
                &[proposal("P-1"), proposal("P-2"), proposal("P-3"), proposal("P-1")],
            )
            .await
            .unwrap();
        assert_eq!(outcome, ReplaceOutcome { inserted: 2, skipped: 2 });

        let ids = store
            .rows(EntityKind::Proposals)
            .await
            .into_iter()
            .map(|r| r.external_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["P-1", "P-3"]);
    }

    #[tokio::test]
    async fn memory_snapshot_fatal_error_keeps_previous_generation() {
        let store = MemorySnapshotStore::new();
        store
            .replace_all(EntityKind::Proposals, &[proposal("OLD-1")])
            .await
            .unwrap();
        store.fail_truncate(true).await;
        let result = store
            .replace_all(EntityKind::Proposals, &[proposal("P-1")])
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(store.count(EntityKind::Proposals).await.unwrap(), 1);
        assert_eq!(store.rows(EntityKind::Proposals).await[0].external_id, "OLD-1");
    }

    #[tokio::test]
    async fn snapshot_rows_of_another_kind_are_skipped() {
        let store = MemorySnapshotStore::new();
        let outcome = store
            .replace_all(EntityKind::Acquisitions, &[proposal("P-1")])
            .await
            .unwrap();
        assert_eq!(outcome, ReplaceOutcome { inserted: 0, skipped: 1 });
        assert!(store.replace_all(EntityKind::Buildings, &[]).await.is_err());
    }
}
