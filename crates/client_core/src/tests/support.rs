//! In-memory sources with scripted latency and failures.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::{LevelType, NodeId, OwnerId, RowId},
    error::SourceError,
    protocol::{NodeMetrics, Page, PageRequest, Row, RowPatch, TreeNode},
    source::{check_level_scope, DataSource, HierarchySource},
};
use tokio::sync::Mutex;

pub fn customer(index: usize, region: &str) -> Row {
    Row {
        row_id: Some(RowId(format!("C{index:03}"))),
        name: Some(format!("Customer {index:03}")),
        region: Some(region.to_string()),
        fleet_size: Some((index % 5) as i64 + 1),
        ..Row::default()
    }
}

pub fn customers(count: usize) -> Vec<Row> {
    let regions = ["East", "South", "West"];
    (0..count)
        .map(|index| customer(index, regions[index % regions.len()]))
        .collect()
}

fn sort_value(row: &Row, key: &str) -> String {
    match row.field(key) {
        Some(Value::Number(number)) => format!("{:020.4}", number.as_f64().unwrap_or_default()),
        Some(Value::String(text)) => text.to_lowercase(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[derive(Default)]
pub struct MemorySource {
    rows: Mutex<Vec<Row>>,
    fetch_calls: Mutex<Vec<PageRequest>>,
    update_calls: Mutex<Vec<(RowId, RowPatch)>>,
    fetch_delays: Mutex<VecDeque<Duration>>,
    update_delays: Mutex<VecDeque<Duration>>,
    fetch_failures: Mutex<VecDeque<SourceError>>,
    update_failures: Mutex<VecDeque<SourceError>>,
    facets_fail: bool,
}

impl MemorySource {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: Mutex::new(rows),
            ..Self::default()
        }
    }

    pub fn with_failing_facets(mut self) -> Self {
        self.facets_fail = true;
        self
    }

    /// Latency of the next fetches, in call order.
    pub async fn script_fetch_delays(&self, delays: impl IntoIterator<Item = Duration>) {
        self.fetch_delays.lock().await.extend(delays);
    }

    pub async fn script_update_delays(&self, delays: impl IntoIterator<Item = Duration>) {
        self.update_delays.lock().await.extend(delays);
    }

    pub async fn fail_next_fetch(&self, error: SourceError) {
        self.fetch_failures.lock().await.push_back(error);
    }

    pub async fn fail_next_update(&self, error: SourceError) {
        self.update_failures.lock().await.push_back(error);
    }

    pub async fn fetch_calls(&self) -> Vec<PageRequest> {
        self.fetch_calls.lock().await.clone()
    }

    pub async fn update_calls(&self) -> Vec<(RowId, RowPatch)> {
        self.update_calls.lock().await.clone()
    }

    pub async fn remove_rows(&self, keep: impl Fn(&Row) -> bool) {
        self.rows.lock().await.retain(|row| keep(row));
    }

    /// What `fetch_page` answers for `request`, without latency or failures.
    pub async fn expected_page(&self, request: &PageRequest) -> Page {
        let rows = self.rows.lock().await;
        let mut matching: Vec<Row> = rows
            .iter()
            .filter(|row| {
                request.filters.iter().all(|(facet, value)| {
                    row.field(facet).and_then(|v| v.as_str().map(str::to_string))
                        == Some(value.clone())
                })
            })
            .filter(|row| match request.search.as_deref() {
                Some(search) => row
                    .name
                    .as_deref()
                    .unwrap_or_default()
                    .to_lowercase()
                    .contains(&search.to_lowercase()),
                None => true,
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            let ordering = sort_value(a, &request.sort_key).cmp(&sort_value(b, &request.sort_key));
            let ordering = if request.sort_ascending {
                ordering
            } else {
                ordering.reverse()
            };
            ordering.then_with(|| a.identity().cmp(&b.identity()))
        });
        let total_count = matching.len() as u64;
        let rows = matching
            .into_iter()
            .skip(request.offset())
            .take(request.page_size)
            .collect();
        Page { rows, total_count }
    }
}

#[async_trait]
impl DataSource for MemorySource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, SourceError> {
        self.fetch_calls.lock().await.push(request.clone());
        let delay = self.fetch_delays.lock().await.pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.fetch_failures.lock().await.pop_front() {
            return Err(error);
        }
        Ok(self.expected_page(request).await)
    }

    async fn update_row(&self, row_id: &RowId, patch: &RowPatch) -> Result<Row, SourceError> {
        self.update_calls
            .lock()
            .await
            .push((row_id.clone(), patch.clone()));
        let delay = self.update_delays.lock().await.pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.update_failures.lock().await.pop_front() {
            return Err(error);
        }
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|row| row.identity() == Some(row_id))
            .ok_or_else(|| SourceError::NotFound(format!("customer {row_id}")))?;
        let mut merged = row.apply_patch(patch)?;
        merged.monthly_total = merged.fleet_size.map(|size| size as f64 * 10.0);
        *row = merged.clone();
        Ok(merged)
    }

    async fn list_facet_values(
        &self,
        _owner_id: &OwnerId,
        facet: &str,
    ) -> Result<Vec<String>, SourceError> {
        if self.facets_fail {
            return Err(SourceError::transient("facet lookup timed out"));
        }
        let rows = self.rows.lock().await;
        let mut values: Vec<String> = rows
            .iter()
            .filter_map(|row| row.field(facet))
            .filter_map(|value| value.as_str().map(str::to_string))
            .collect();
        values.sort();
        values.dedup();
        Ok(values)
    }
}

pub fn node(id: &str, level: LevelType, parent: Option<&str>) -> TreeNode {
    TreeNode {
        id: NodeId::new(id),
        level,
        parent_id: parent.map(NodeId::new),
        name: format!("{level} {id}"),
        metrics: NodeMetrics::default(),
    }
}

type LevelKey = (LevelType, Option<NodeId>);

#[derive(Default)]
pub struct ScriptedHierarchy {
    levels: HashMap<LevelKey, Vec<TreeNode>>,
    calls: Mutex<Vec<LevelKey>>,
    failures: Mutex<VecDeque<SourceError>>,
    delay: Option<Duration>,
}

impl ScriptedHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: LevelType, parent: Option<&str>, nodes: Vec<TreeNode>) -> Self {
        self.levels.insert((level, parent.map(NodeId::new)), nodes);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn fail_next(&self, error: SourceError) {
        self.failures.lock().await.push_back(error);
    }

    pub async fn calls(&self) -> Vec<LevelKey> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl HierarchySource for ScriptedHierarchy {
    async fn fetch_level(
        &self,
        _owner_id: &OwnerId,
        level: LevelType,
        parent_id: Option<&NodeId>,
    ) -> Result<Vec<TreeNode>, SourceError> {
        check_level_scope(level, parent_id)?;
        let key = (level, parent_id.cloned());
        self.calls.lock().await.push(key.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failures.lock().await.pop_front() {
            return Err(error);
        }
        Ok(self.levels.get(&key).cloned().unwrap_or_default())
    }
}
