//! Core domain model for the estate ERP sync subsystem.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "estate-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Buildings,
    Acquisitions,
    Proposals,
    LettersOfIntent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Match by external id, create or patch ERP-owned fields in place.
    Upsert,
    /// Truncate and reload the whole table from the snapshot.
    FullRefresh,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Buildings,
        EntityKind::Acquisitions,
        EntityKind::Proposals,
        EntityKind::LettersOfIntent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Buildings => "buildings",
            EntityKind::Acquisitions => "acquisitions",
            EntityKind::Proposals => "proposals",
            EntityKind::LettersOfIntent => "letters-of-intent",
        }
    }

    /// ERP doctype name, used as the last path segment of the resource URL.
    pub fn erp_resource(&self) -> &'static str {
        match self {
            EntityKind::Buildings => "Building",
            EntityKind::Acquisitions => "Acquisition",
            EntityKind::Proposals => "Proposal",
            EntityKind::LettersOfIntent => "Letter of Intent",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Buildings => "buildings",
            EntityKind::Acquisitions => "acquisitions",
            EntityKind::Proposals => "proposals",
            EntityKind::LettersOfIntent => "letters_of_intent",
        }
    }

    pub fn strategy(&self) -> SyncStrategy {
        match self {
            EntityKind::Buildings => SyncStrategy::Upsert,
            EntityKind::Acquisitions | EntityKind::Proposals | EntityKind::LettersOfIntent => {
                SyncStrategy::FullRefresh
            }
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown entity kind `{0}`")]
pub struct UnknownKind(pub String);

impl FromStr for EntityKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "buildings" | "building" => Ok(EntityKind::Buildings),
            "acquisitions" | "acquisition" => Ok(EntityKind::Acquisitions),
            "proposals" | "proposal" => Ok(EntityKind::Proposals),
            "letters-of-intent" | "letter-of-intent" | "loi" | "lois" => {
                Ok(EntityKind::LettersOfIntent)
            }
            _ => Err(UnknownKind(s.to_string())),
        }
    }
}

/// A building as the ERP reports it. Lives for one fetch + reconcile cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalBuilding {
    pub external_id: String,
    pub name: String,
    pub classification: Option<String>,
    pub status: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub district: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub floors: Option<i32>,
    pub total_area: Option<f64>,
    pub erp_modified: Option<String>,
    pub raw_payload: JsonValue,
}

impl ExternalBuilding {
    /// The only constructor of ERP-owned building values. Nothing user-owned
    /// exists on the external record, so nothing user-owned can leak out.
    pub fn erp_patch(&self) -> ErpBuildingFields {
        ErpBuildingFields {
            external_id: self.external_id.clone(),
            name: self.name.clone(),
            classification: self.classification.clone(),
            status: self.status.clone(),
            address: self.address.clone(),
            city: self.city.clone(),
            district: self.district.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            floors: self.floors,
            total_area: self.total_area,
            erp_modified: self.erp_modified.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ErpBuildingFields {
    pub external_id: String,
    pub name: String,
    pub classification: Option<String>,
    pub status: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub district: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub floors: Option<i32>,
    pub total_area: Option<f64>,
    pub erp_modified: Option<String>,
}

/// Operational flags set by end users. Sync never writes these.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserBuildingFields {
    pub sellable: Option<String>,
    pub connectivity: Option<String>,
    pub resource_class: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Building {
    pub id: i64,
    pub erp: ErpBuildingFields,
    pub user: UserBuildingFields,
    pub synced_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Building {
    pub fn external_id(&self) -> &str {
        &self.erp.external_id
    }

    /// Merge an ERP patch over this row. User-owned values come from `self`
    /// and nowhere else.
    pub fn with_erp_patch(
        &self,
        patch: ErpBuildingFields,
        synced_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Building {
        Building {
            id: self.id,
            erp: patch,
            user: self.user.clone(),
            synced_at,
            created_at: self.created_at,
            updated_at,
        }
    }
}

/// Insert payload for a building seen for the first time. User-owned
/// fields start at their defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBuilding {
    pub erp: ErpBuildingFields,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SnapshotDetail {
    Acquisition {
        seller_name: Option<String>,
        acquisition_type: Option<String>,
        asking_price: Option<f64>,
    },
    Proposal {
        acquisition_ref: Option<String>,
        proposed_price: Option<f64>,
        valid_until: Option<String>,
    },
    LetterOfIntent {
        proposal_ref: Option<String>,
        buyer_name: Option<String>,
        offered_price: Option<f64>,
        signed_on: Option<String>,
    },
}

impl SnapshotDetail {
    pub fn kind(&self) -> EntityKind {
        match self {
            SnapshotDetail::Acquisition { .. } => EntityKind::Acquisitions,
            SnapshotDetail::Proposal { .. } => EntityKind::Proposals,
            SnapshotDetail::LetterOfIntent { .. } => EntityKind::LettersOfIntent,
        }
    }
}

/// One fetched record of a full-refresh kind, inserted as-is. The raw ERP
/// object is kept verbatim for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub external_id: String,
    pub building_ref: Option<String>,
    pub workflow_state: Option<String>,
    pub status: Option<String>,
    pub erp_created: Option<String>,
    pub erp_modified: Option<String>,
    pub detail: SnapshotDetail,
    pub raw_payload: JsonValue,
}

impl SnapshotRow {
    pub fn kind(&self) -> EntityKind {
        self.detail.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PassOutcome {
    Completed,
    FetchFailed { error: String },
    /// Full-refresh transaction could not be committed; nothing changed.
    StoreFailed { error: String },
    /// Cancellation observed between records; earlier writes stand.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPassResult {
    pub pass_id: Uuid,
    pub kind: EntityKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub outcome: PassOutcome,
}

impl SyncPassResult {
    pub fn begin(kind: EntityKind) -> Self {
        let now = Utc::now();
        Self {
            pass_id: Uuid::new_v4(),
            kind,
            started_at: now,
            finished_at: now,
            fetched: 0,
            created: 0,
            updated: 0,
            inserted: 0,
            skipped: 0,
            outcome: PassOutcome::Completed,
        }
    }

    pub fn finish(mut self, outcome: PassOutcome) -> Self {
        self.finished_at = Utc::now();
        self.outcome = outcome;
        self
    }

    pub fn succeeded(&self) -> usize {
        self.created + self.updated + self.inserted
    }

    pub fn fetch_error(&self) -> Option<&str> {
        match &self.outcome {
            PassOutcome::FetchFailed { error } => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).single().unwrap()
    }

    #[test]
    fn kind_parses_common_spellings() {
        assert_eq!("buildings".parse::<EntityKind>(), Ok(EntityKind::Buildings));
        assert_eq!("Letters_Of_Intent".parse::<EntityKind>(), Ok(EntityKind::LettersOfIntent));
        assert_eq!("loi".parse::<EntityKind>(), Ok(EntityKind::LettersOfIntent));
        assert!("parcels".parse::<EntityKind>().is_err());
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>(), Ok(kind));
        }
    }

    #[test]
    fn only_buildings_use_upsert() {
        assert_eq!(EntityKind::Buildings.strategy(), SyncStrategy::Upsert);
        assert_eq!(EntityKind::Proposals.strategy(), SyncStrategy::FullRefresh);
        assert_eq!(EntityKind::LettersOfIntent.erp_resource(), "Letter of Intent");
        assert_eq!(EntityKind::LettersOfIntent.table(), "letters_of_intent");
    }

    #[test]
    fn erp_patch_keeps_user_fields_of_existing_row() {
        let existing = Building {
            id: 7,
            erp: ErpBuildingFields {
                external_id: "B1".into(),
                name: "Tower".into(),
                ..Default::default()
            },
            user: UserBuildingFields {
                sellable: Some("sell".into()),
                connectivity: Some("fiber".into()),
                resource_class: None,
            },
            synced_at: ts(1),
            created_at: ts(1),
            updated_at: ts(1),
        };
        let incoming = ExternalBuilding {
            external_id: "B1".into(),
            name: "Tower Renamed".into(),
            classification: Some("office".into()),
            status: None,
            address: None,
            city: None,
            district: None,
            latitude: None,
            longitude: None,
            floors: Some(12),
            total_area: None,
            erp_modified: None,
            raw_payload: serde_json::json!({"name": "B1", "sellable": "not_sell"}),
        };

        let merged = existing.with_erp_patch(incoming.erp_patch(), ts(2), ts(2));
        assert_eq!(merged.id, 7);
        assert_eq!(merged.erp.name, "Tower Renamed");
        assert_eq!(merged.erp.floors, Some(12));
        assert_eq!(merged.user, existing.user);
        assert_eq!(merged.created_at, ts(1));
        assert_eq!(merged.synced_at, ts(2));
    }

    #[test]
    fn pass_result_counts_successes() {
        let mut pass = SyncPassResult::begin(EntityKind::Buildings);
        pass.fetched = 5;
        pass.created = 2;
        pass.updated = 2;
        pass.skipped = 1;
        let pass = pass.finish(PassOutcome::Completed);
        assert_eq!(pass.succeeded(), 4);
        assert!(pass.fetch_error().is_none());

        let failed = SyncPassResult::begin(EntityKind::Proposals).finish(PassOutcome::FetchFailed {
            error: "http status 503".into(),
        });
        assert_eq!(failed.fetch_error(), Some("http status 503"));
    }
}
