use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    domain::{LevelType, NodeId, OwnerId, RowId},
    error::SourceError,
};

/// Touched fields of a row, keyed by field name.
pub type RowPatch = BTreeMap<String, Value>;

/// One customer record. Known columns are typed; everything else the
/// backend sends lands in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    #[serde(default, alias = "rowId", skip_serializing_if = "Option::is_none")]
    pub row_id: Option<RowId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RowId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, alias = "fleetSize", skip_serializing_if = "Option::is_none")]
    pub fleet_size: Option<i64>,
    #[serde(default, alias = "monthlyTotal", skip_serializing_if = "Option::is_none")]
    pub monthly_total: Option<f64>,
    #[serde(default, alias = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Row {
    /// Reconciliation key: `row_id`, falling back to `id`.
    pub fn identity(&self) -> Option<&RowId> {
        self.row_id.as_ref().or(self.id.as_ref())
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        match self.to_object() {
            Ok(mut object) => object.remove(name),
            Err(_) => None,
        }
    }

    /// Applies `patch` field by field so a rejected value names its field.
    pub fn apply_patch(&self, patch: &RowPatch) -> Result<Row, SourceError> {
        let mut merged = self.clone();
        for (field, value) in patch {
            let mut object = merged
                .to_object()
                .map_err(|err| SourceError::validation(Some(field), err.to_string()))?;
            object.insert(field.clone(), value.clone());
            merged = serde_json::from_value(Value::Object(object))
                .map_err(|err| SourceError::validation(Some(field), err.to_string()))?;
        }
        Ok(merged)
    }

    fn to_object(&self) -> Result<Map<String, Value>, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(object) => Ok(object),
            _ => Ok(Map::new()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub rows: Vec<Row>,
    #[serde(alias = "totalCount")]
    pub total_count: u64,
}

impl Page {
    /// Number of pages for `page_size`; an empty result still has one page.
    pub fn page_count(&self, page_size: usize) -> usize {
        page_count(self.total_count, page_size)
    }

    pub fn find(&self, row_id: &RowId) -> Option<&Row> {
        self.rows.iter().find(|row| row.identity() == Some(row_id))
    }
}

pub fn page_count(total_count: u64, page_size: usize) -> usize {
    let page_size = page_size.max(1) as u64;
    total_count.div_ceil(page_size).max(1) as usize
}

/// Arguments of one `DataSource::fetch_page` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub owner_id: OwnerId,
    pub page_index: usize,
    pub page_size: usize,
    pub filters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    pub sort_key: String,
    pub sort_ascending: bool,
}

impl PageRequest {
    pub fn offset(&self) -> usize {
        self.page_index.saturating_mul(self.page_size)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    #[serde(default)]
    pub visits: u64,
    #[serde(default, alias = "completedVisits")]
    pub completed_visits: u64,
    #[serde(default, alias = "distanceKm")]
    pub distance_km: f64,
    #[serde(default, alias = "durationMinutes")]
    pub duration_minutes: f64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, f64>,
}

impl NodeMetrics {
    pub fn completion_rate(&self) -> Option<f64> {
        (self.visits > 0).then(|| self.completed_visits as f64 / self.visits as f64)
    }
}

/// Report row as returned by a `HierarchySource`, without children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: NodeId,
    #[serde(alias = "levelType")]
    pub level: LevelType,
    #[serde(default, alias = "parentId")]
    pub parent_id: Option<NodeId>,
    pub name: String,
    #[serde(default, alias = "aggregateMetrics")]
    pub metrics: NodeMetrics,
}
