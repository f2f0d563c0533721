use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::{
    domain::{LevelType, NodeId, OwnerId, RowId},
    error::SourceError,
    protocol::{NodeMetrics, Page, PageRequest, Row, RowPatch, TreeNode},
    source::{check_level_scope, DataSource, HierarchySource},
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row as _, Sqlite,
};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

pub mod seed;

const CUSTOMER_COLUMNS: &str = "row_id, name, email, phone, region, plan, status, fleet_size, monthly_total, extra, created_at";

/// Facets that can be filtered on and listed for dropdowns.
pub const FACETS: [&str; 3] = ["region", "plan", "status"];

/// Fields the backend owns; an edit may not touch them.
const READ_ONLY_FIELDS: [&str; 4] = ["row_id", "id", "monthly_total", "created_at"];

/// Price per vehicle and month for each plan.
pub fn plan_rate(plan: &str) -> Option<f64> {
    match plan {
        "starter" => Some(12.0),
        "growth" => Some(18.0),
        "enterprise" => Some(25.0),
        _ => None,
    }
}

fn facet_column(facet: &str) -> Option<&'static str> {
    FACETS.into_iter().find(|column| *column == facet)
}

fn sort_expression(key: &str) -> Option<&'static str> {
    match key {
        "name" => Some("lower(name)"),
        "email" => Some("lower(email)"),
        "region" => Some("lower(region)"),
        "plan" => Some("lower(plan)"),
        "status" => Some("lower(status)"),
        "fleet_size" => Some("fleet_size"),
        "monthly_total" => Some("monthly_total"),
        "created_at" => Some("created_at"),
        _ => None,
    }
}

/// SQLite mirror of the hosted customer and report tables.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Inserts or replaces a customer. `monthly_total` is always derived.
    pub async fn upsert_customer(&self, owner_id: &OwnerId, row: &Row) -> Result<RowId> {
        let row_id = row
            .identity()
            .cloned()
            .context("customer row has neither row_id nor id")?;
        let extra = serde_json::to_string(&row.extra)?;
        sqlx::query(
            "INSERT INTO customers (row_id, owner_id, name, email, phone, region, plan, status, fleet_size, monthly_total, extra, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(row_id) DO UPDATE SET
                owner_id=excluded.owner_id, name=excluded.name, email=excluded.email,
                phone=excluded.phone, region=excluded.region, plan=excluded.plan,
                status=excluded.status, fleet_size=excluded.fleet_size,
                monthly_total=excluded.monthly_total, extra=excluded.extra",
        )
        .bind(row_id.as_str())
        .bind(owner_id.as_str())
        .bind(row.name.as_deref().unwrap_or_default())
        .bind(row.email.as_deref())
        .bind(row.phone.as_deref())
        .bind(row.region.as_deref())
        .bind(row.plan.as_deref())
        .bind(row.status.as_deref())
        .bind(row.fleet_size.unwrap_or_default())
        .bind(derived_monthly_total(row))
        .bind(extra)
        .bind(row.created_at.unwrap_or_else(Utc::now))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert customer {row_id}"))?;
        Ok(row_id)
    }

    pub async fn customer(&self, row_id: &RowId) -> Result<Option<Row>> {
        let row = sqlx::query(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers WHERE row_id = ?"
        ))
        .bind(row_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(customer_from_sqlite).transpose()
    }

    pub async fn insert_report_node(
        &self,
        owner_id: &OwnerId,
        node: &TreeNode,
        position: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO report_nodes (owner_id, node_id, level, parent_id, name, position, visits, completed_visits, distance_km, duration_minutes)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(owner_id, level, node_id) DO UPDATE SET
                parent_id=excluded.parent_id, name=excluded.name, position=excluded.position,
                visits=excluded.visits, completed_visits=excluded.completed_visits,
                distance_km=excluded.distance_km, duration_minutes=excluded.duration_minutes",
        )
        .bind(owner_id.as_str())
        .bind(node.id.as_str())
        .bind(node.level.as_str())
        .bind(node.parent_id.as_ref().map(NodeId::as_str))
        .bind(&node.name)
        .bind(position)
        .bind(i64::try_from(node.metrics.visits).unwrap_or(i64::MAX))
        .bind(i64::try_from(node.metrics.completed_visits).unwrap_or(i64::MAX))
        .bind(node.metrics.distance_km)
        .bind(node.metrics.duration_minutes)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert {} node {}", node.level, node.id))?;
        Ok(())
    }

    async fn customer_page(&self, request: &PageRequest) -> Result<Page, SourceError> {
        let sort = sort_expression(&request.sort_key).ok_or_else(|| {
            SourceError::validation(
                Some("sort_key"),
                format!("cannot sort by '{}'", request.sort_key),
            )
        })?;

        let mut count =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM customers WHERE owner_id = ");
        count.push_bind(request.owner_id.as_str());
        push_conditions(&mut count, request)?;
        let total: i64 = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(transient)?;

        let mut select = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers WHERE owner_id = "
        ));
        select.push_bind(request.owner_id.as_str());
        push_conditions(&mut select, request)?;
        let direction = if request.sort_ascending { "ASC" } else { "DESC" };
        select.push(format!(" ORDER BY {sort} {direction}, row_id ASC LIMIT "));
        select.push_bind(i64::try_from(request.page_size).unwrap_or(i64::MAX));
        select.push(" OFFSET ");
        select.push_bind(i64::try_from(request.offset()).unwrap_or(i64::MAX));

        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(transient)?;
        let rows = rows
            .iter()
            .map(customer_from_sqlite)
            .collect::<Result<Vec<_>>>()
            .map_err(|err| SourceError::transient(err.to_string()))?;

        debug!(
            owner_id = %request.owner_id,
            page_index = request.page_index,
            total,
            returned = rows.len(),
            "storage: served customer page"
        );

        Ok(Page {
            rows,
            total_count: u64::try_from(total).unwrap_or_default(),
        })
    }
}

fn push_conditions(
    builder: &mut QueryBuilder<'_, Sqlite>,
    request: &PageRequest,
) -> Result<(), SourceError> {
    for (facet, value) in &request.filters {
        let column = facet_column(facet).ok_or_else(|| {
            SourceError::validation(Some(facet), format!("unknown filter facet '{facet}'"))
        })?;
        builder.push(format!(" AND {column} = "));
        builder.push_bind(value.clone());
    }

    if let Some(search) = request.search.as_deref().map(str::trim) {
        if !search.is_empty() {
            let pattern = format!("%{}%", escape_like(&search.to_lowercase()));
            builder.push(" AND (lower(name) LIKE ");
            builder.push_bind(pattern.clone());
            builder.push(" ESCAPE '\\' OR lower(email) LIKE ");
            builder.push_bind(pattern.clone());
            builder.push(" ESCAPE '\\' OR phone LIKE ");
            builder.push_bind(pattern);
            builder.push(" ESCAPE '\\')");
        }
    }
    Ok(())
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn derived_monthly_total(row: &Row) -> f64 {
    let rate = row.plan.as_deref().and_then(plan_rate).unwrap_or_default();
    rate * row.fleet_size.unwrap_or_default() as f64
}

fn customer_from_sqlite(r: &SqliteRow) -> Result<Row> {
    let extra: String = r.try_get("extra")?;
    let extra = match serde_json::from_str::<Value>(&extra)? {
        Value::Object(map) => map.into_iter().collect::<BTreeMap<_, _>>(),
        _ => BTreeMap::new(),
    };
    Ok(Row {
        row_id: Some(RowId(r.try_get("row_id")?)),
        id: None,
        name: r.try_get("name")?,
        email: r.try_get("email")?,
        phone: r.try_get("phone")?,
        region: r.try_get("region")?,
        plan: r.try_get("plan")?,
        status: r.try_get("status")?,
        fleet_size: r.try_get("fleet_size")?,
        monthly_total: r.try_get("monthly_total")?,
        created_at: r.try_get::<Option<DateTime<Utc>>, _>("created_at")?,
        extra,
    })
}

fn report_node_from_sqlite(r: &SqliteRow) -> Result<TreeNode> {
    let level: String = r.try_get("level")?;
    let level = LevelType::parse(&level).with_context(|| format!("unknown level '{level}'"))?;
    Ok(TreeNode {
        id: NodeId(r.try_get("node_id")?),
        level,
        parent_id: r.try_get::<Option<String>, _>("parent_id")?.map(NodeId),
        name: r.try_get("name")?,
        metrics: NodeMetrics {
            visits: u64::try_from(r.try_get::<i64, _>("visits")?).unwrap_or_default(),
            completed_visits: u64::try_from(r.try_get::<i64, _>("completed_visits")?)
                .unwrap_or_default(),
            distance_km: r.try_get("distance_km")?,
            duration_minutes: r.try_get("duration_minutes")?,
            extra: BTreeMap::new(),
        },
    })
}

/// Checks an edit against the business rules the hosted backend enforces.
fn validate_edit(original: &Row, patch: &RowPatch) -> Result<Row, SourceError> {
    if let Some(field) = patch
        .keys()
        .find(|field| READ_ONLY_FIELDS.contains(&field.as_str()))
    {
        return Err(SourceError::validation(Some(field), "field is read-only"));
    }

    let merged = original.apply_patch(patch)?;
    if merged.name.as_deref().map(str::trim).unwrap_or_default().is_empty() {
        return Err(SourceError::validation(Some("name"), "name must not be empty"));
    }
    if merged.fleet_size.is_some_and(|size| size < 0) {
        return Err(SourceError::validation(
            Some("fleet_size"),
            "fleet size must not be negative",
        ));
    }
    if let Some(plan) = merged.plan.as_deref() {
        if plan_rate(plan).is_none() {
            return Err(SourceError::validation(
                Some("plan"),
                format!("unknown plan '{plan}'"),
            ));
        }
    }
    if let Some(email) = merged.email.as_deref() {
        if !email.is_empty() && !email.contains('@') {
            return Err(SourceError::validation(
                Some("email"),
                "email address is malformed",
            ));
        }
    }
    Ok(merged)
}

fn transient(err: sqlx::Error) -> SourceError {
    SourceError::transient(err.to_string())
}

#[async_trait]
impl DataSource for Storage {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, SourceError> {
        self.customer_page(request).await
    }

    async fn update_row(&self, row_id: &RowId, patch: &RowPatch) -> Result<Row, SourceError> {
        let original = self
            .customer(row_id)
            .await
            .map_err(|err| SourceError::transient(err.to_string()))?
            .ok_or_else(|| SourceError::NotFound(format!("customer {row_id}")))?;
        let merged = validate_edit(&original, patch)?;
        let extra = serde_json::to_string(&merged.extra)
            .map_err(|err| SourceError::validation(None, err.to_string()))?;

        sqlx::query(
            "UPDATE customers
             SET name = ?, email = ?, phone = ?, region = ?, plan = ?, status = ?,
                 fleet_size = ?, monthly_total = ?, extra = ?
             WHERE row_id = ?",
        )
        .bind(merged.name.as_deref().unwrap_or_default())
        .bind(merged.email.as_deref())
        .bind(merged.phone.as_deref())
        .bind(merged.region.as_deref())
        .bind(merged.plan.as_deref())
        .bind(merged.status.as_deref())
        .bind(merged.fleet_size.unwrap_or_default())
        .bind(derived_monthly_total(&merged))
        .bind(extra)
        .bind(row_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(transient)?;

        self.customer(row_id)
            .await
            .map_err(|err| SourceError::transient(err.to_string()))?
            .ok_or_else(|| SourceError::NotFound(format!("customer {row_id}")))
    }

    async fn list_facet_values(
        &self,
        owner_id: &OwnerId,
        facet: &str,
    ) -> Result<Vec<String>, SourceError> {
        let column = facet_column(facet).ok_or_else(|| {
            SourceError::validation(Some(facet), format!("unknown filter facet '{facet}'"))
        })?;
        sqlx::query_scalar::<_, String>(&format!(
            "SELECT DISTINCT {column} FROM customers
             WHERE owner_id = ? AND {column} IS NOT NULL AND {column} <> ''
             ORDER BY {column} ASC"
        ))
        .bind(owner_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(transient)
    }
}

#[async_trait]
impl HierarchySource for Storage {
    async fn fetch_level(
        &self,
        owner_id: &OwnerId,
        level: LevelType,
        parent_id: Option<&NodeId>,
    ) -> Result<Vec<TreeNode>, SourceError> {
        check_level_scope(level, parent_id)?;
        let rows = sqlx::query(
            "SELECT node_id, level, parent_id, name, visits, completed_visits, distance_km, duration_minutes
             FROM report_nodes
             WHERE owner_id = ? AND level = ? AND parent_id IS ?
             ORDER BY position ASC, node_id ASC",
        )
        .bind(owner_id.as_str())
        .bind(level.as_str())
        .bind(parent_id.map(NodeId::as_str))
        .fetch_all(&self.pool)
        .await
        .map_err(transient)?;

        rows.iter()
            .map(report_node_from_sqlite)
            .collect::<Result<Vec<_>>>()
            .map_err(|err| SourceError::transient(err.to_string()))
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
