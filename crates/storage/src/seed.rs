//! Deterministic demo data for local mirrors and tests.

use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};
use shared::{
    domain::{LevelType, NodeId, OwnerId, RowId},
    protocol::{NodeMetrics, Row, TreeNode},
};
use tracing::info;

use crate::Storage;

pub const REGIONS: [&str; 4] = ["East", "South", "West", "Central"];
pub const PLANS: [&str; 3] = ["starter", "growth", "enterprise"];
pub const STATUSES: [&str; 3] = ["active", "trial", "paused"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub customers: usize,
    pub report_nodes: usize,
}

/// Shape of the generated report tree: fan-out per level below the root.
#[derive(Debug, Clone, Copy)]
pub struct HierarchyShape {
    pub branches: usize,
    pub routes: usize,
    pub users: usize,
    pub weeks: usize,
    pub days: usize,
}

impl Default for HierarchyShape {
    fn default() -> Self {
        Self {
            branches: 2,
            routes: 2,
            users: 2,
            weeks: 2,
            days: 5,
        }
    }
}

/// Customer `index` of a seeded owner. Row ids are `C0001`, `C0002`, ...
pub fn demo_customer(index: usize) -> Row {
    let plan = PLANS[index % PLANS.len()];
    Row {
        row_id: Some(RowId(format!("C{:04}", index + 1))),
        name: Some(format!("Customer {:04}", index + 1)),
        email: Some(format!("ops{:04}@example.com", index + 1)),
        phone: Some(format!("+1-555-{:04}", index + 1)),
        region: Some(REGIONS[index % REGIONS.len()].to_string()),
        plan: Some(plan.to_string()),
        status: Some(STATUSES[(index / 2) % STATUSES.len()].to_string()),
        fleet_size: Some((index % 9 + 1) as i64),
        created_at: Utc
            .with_ymd_and_hms(2024, 1, 1, 8, 0, 0)
            .single()
            .map(|start| start + Duration::days(index as i64)),
        ..Row::default()
    }
}

pub async fn seed_customers(storage: &Storage, owner_id: &OwnerId, count: usize) -> Result<usize> {
    for index in 0..count {
        storage
            .upsert_customer(owner_id, &demo_customer(index))
            .await?;
    }
    Ok(count)
}

/// Writes a full BRANCH -> DAY tree. Ids encode their path (`B1`, `B1-R2`,
/// `B1-R2-U1`, ...) so they stay unique across parents.
pub async fn seed_hierarchy(
    storage: &Storage,
    owner_id: &OwnerId,
    shape: HierarchyShape,
) -> Result<usize> {
    let mut written = 0;
    let mut frontier: Vec<Option<TreeNode>> = vec![None];

    for level in LevelType::ALL {
        let fan_out = match level {
            LevelType::Branch => shape.branches,
            LevelType::Route => shape.routes,
            LevelType::User => shape.users,
            LevelType::Week => shape.weeks,
            LevelType::Day => shape.days,
        };
        let mut next = Vec::with_capacity(frontier.len() * fan_out);
        for parent in &frontier {
            for position in 0..fan_out {
                let node = demo_node(parent.as_ref(), level, position);
                storage
                    .insert_report_node(owner_id, &node, position as i64)
                    .await?;
                written += 1;
                next.push(Some(node));
            }
        }
        frontier = next;
    }

    Ok(written)
}

fn demo_node(parent: Option<&TreeNode>, level: LevelType, position: usize) -> TreeNode {
    let ordinal = position + 1;
    let (segment, name) = match level {
        LevelType::Branch => (format!("B{ordinal}"), format!("Branch {ordinal}")),
        LevelType::Route => (format!("R{ordinal}"), format!("Route {ordinal}")),
        LevelType::User => (format!("U{ordinal}"), format!("Driver {ordinal}")),
        LevelType::Week => (format!("W{ordinal}"), format!("Week {ordinal}")),
        LevelType::Day => (format!("D{ordinal}"), format!("Day {ordinal}")),
    };
    let id = match parent {
        Some(parent) => format!("{}-{segment}", parent.id),
        None => segment,
    };
    let visits = (ordinal as u64) * 12;
    TreeNode {
        id: NodeId(id),
        level,
        parent_id: parent.map(|parent| parent.id.clone()),
        name,
        metrics: NodeMetrics {
            visits,
            completed_visits: visits - (ordinal as u64),
            distance_km: 42.5 * ordinal as f64,
            duration_minutes: 95.0 * ordinal as f64,
            ..NodeMetrics::default()
        },
    }
}

pub async fn seed_demo(
    storage: &Storage,
    owner_id: &OwnerId,
    customers: usize,
    shape: HierarchyShape,
) -> Result<SeedSummary> {
    let customers = seed_customers(storage, owner_id, customers).await?;
    let report_nodes = seed_hierarchy(storage, owner_id, shape).await?;
    info!(
        owner_id = %owner_id,
        customers, report_nodes, "storage: seeded demo data"
    );
    Ok(SeedSummary {
        customers,
        report_nodes,
    })
}
