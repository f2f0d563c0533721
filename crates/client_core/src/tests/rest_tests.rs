use super::*;
use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response as AxumResponse},
    routing::{patch, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Clone, Default)]
struct BackendState {
    page_requests: Arc<Mutex<Vec<PageRequest>>>,
    patches: Arc<Mutex<Vec<(String, Value)>>>,
    level_requests: Arc<Mutex<Vec<Value>>>,
    auth_headers: Arc<Mutex<Vec<(Option<String>, Option<String>)>>>,
}

impl BackendState {
    async fn record_auth(&self, headers: &HeaderMap) {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        self.auth_headers
            .lock()
            .await
            .push((header("apikey"), header("authorization")));
    }
}

async fn customer_page(
    State(state): State<BackendState>,
    headers: HeaderMap,
    Json(request): Json<PageRequest>,
) -> AxumResponse {
    state.record_auth(&headers).await;
    if request.sort_key == "password" {
        return (
            axum::http::StatusCode::BAD_REQUEST,
            Json(json!({
                "code": "42703",
                "message": "unsupported sort key",
                "hint": "field: sort_key"
            })),
        )
            .into_response();
    }
    if request.filters.get("region").map(String::as_str) == Some("Outage") {
        return (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            "upstream connect error",
        )
            .into_response();
    }
    state.page_requests.lock().await.push(request);
    Json(json!({
        "rows": [
            { "row_id": "C001", "name": "Acme", "region": "East", "fleet_size": 3, "tier": "gold" },
            { "id": "C002", "name": "Birch", "region": "East" }
        ],
        "total_count": 42
    }))
    .into_response()
}

#[derive(Deserialize)]
struct RowFilter {
    row_id: String,
}

async fn patch_customer(
    State(state): State<BackendState>,
    headers: HeaderMap,
    Query(filter): Query<RowFilter>,
    Json(body): Json<Value>,
) -> AxumResponse {
    let prefer = headers
        .get("prefer")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state
        .patches
        .lock()
        .await
        .push((filter.row_id.clone(), body.clone()));
    if prefer != "return=representation" {
        return axum::http::StatusCode::NO_CONTENT.into_response();
    }
    if body.get("fleet_size").and_then(Value::as_i64).is_some_and(|size| size < 0) {
        return (
            axum::http::StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "message": "fleet size must not be negative",
                "details": "field: fleet_size"
            })),
        )
            .into_response();
    }
    if filter.row_id == "eq.C404" {
        return Json(json!([])).into_response();
    }
    let mut row = json!({ "row_id": filter.row_id.trim_start_matches("eq."), "name": "Acme" });
    if let (Some(row), Some(patch)) = (row.as_object_mut(), body.as_object()) {
        row.extend(patch.clone());
    }
    Json(json!([row])).into_response()
}

async fn facet_values(Json(body): Json<Value>) -> AxumResponse {
    match body.get("facet").and_then(Value::as_str) {
        Some("region") => Json(json!(["East", "West"])).into_response(),
        _ => axum::http::StatusCode::NOT_FOUND.into_response(),
    }
}

async fn report_level(State(state): State<BackendState>, Json(body): Json<Value>) -> AxumResponse {
    state.level_requests.lock().await.push(body.clone());
    let parent = body.get("parent_id").and_then(Value::as_str).unwrap_or_default();
    Json(json!([
        {
            "id": format!("{parent}-R1"),
            "levelType": "ROUTE",
            "parentId": parent,
            "name": "Route 1",
            "aggregateMetrics": { "visits": 10, "completed_visits": 8, "on_time": 0.9 }
        }
    ]))
    .into_response()
}

async fn spawn_backend() -> Result<(String, BackendState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = BackendState::default();
    let app = Router::new()
        .route("/rest/v1/rpc/customer_page", post(customer_page))
        .route("/rest/v1/customers", patch(patch_customer))
        .route("/rest/v1/rpc/customer_facet_values", post(facet_values))
        .route("/rest/v1/rpc/report_level", post(report_level))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

fn request() -> PageRequest {
    PageRequest {
        owner_id: OwnerId::new("owner-1"),
        page_index: 1,
        page_size: 2,
        filters: [("region".to_string(), "East".to_string())].into_iter().collect(),
        search: Some("ac".into()),
        sort_key: "name".into(),
        sort_ascending: true,
    }
}

#[test]
fn base_url_gains_trailing_slash() {
    let backend = RestBackend::new("https://reach.example.com/proxy", None).expect("backend");
    assert_eq!(backend.base_url().as_str(), "https://reach.example.com/proxy/");
    assert!(RestBackend::new("not a url", None).is_err());
}

#[test]
fn status_codes_map_to_source_errors() {
    let mut body = ApiError::new("bad plan");
    body.details = Some("field: plan".into());
    assert_eq!(
        status_error(StatusCode::UNPROCESSABLE_ENTITY, &body),
        SourceError::validation(Some("plan"), "bad plan")
    );
    assert!(matches!(
        status_error(StatusCode::NOT_FOUND, &ApiError::default()),
        SourceError::NotFound(_)
    ));
    assert!(status_error(StatusCode::BAD_GATEWAY, &body).is_retryable());
}

#[tokio::test]
async fn fetches_page_with_auth_headers() {
    let (url, state) = spawn_backend().await.expect("spawn backend");
    let backend = RestBackend::new(&url, Some("anon-key".into())).expect("backend");

    let page = backend.fetch_page(&request()).await.expect("page");
    assert_eq!(page.total_count, 42);
    assert_eq!(page.rows.len(), 2);
    assert_eq!(page.rows[0].field("tier"), Some(json!("gold")));
    assert_eq!(page.rows[1].identity(), Some(&RowId::new("C002")));

    assert_eq!(state.page_requests.lock().await.as_slice(), &[request()]);
    let auth = state.auth_headers.lock().await.clone();
    assert_eq!(
        auth,
        vec![(Some("anon-key".to_string()), Some("Bearer anon-key".to_string()))]
    );
}

#[tokio::test]
async fn rejected_query_surfaces_field_from_error_body() {
    let (url, _) = spawn_backend().await.expect("spawn backend");
    let backend = RestBackend::new(&url, None).expect("backend");

    let mut bad_sort = request();
    bad_sort.sort_key = "password".into();
    let err = backend.fetch_page(&bad_sort).await.expect_err("rejected");
    assert_eq!(err, SourceError::validation(Some("sort_key"), "unsupported sort key"));

    let mut outage = request();
    outage.filters.insert("region".into(), "Outage".into());
    let err = backend.fetch_page(&outage).await.expect_err("unavailable");
    assert!(matches!(err, SourceError::TransientFetch(ref msg) if msg.contains("503")));
}

#[tokio::test]
async fn unreachable_backend_is_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");

    let backend = RestBackend::new(&format!("http://{addr}"), None).expect("backend");
    let err = backend.fetch_page(&request()).await.expect_err("refused");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn patch_sends_only_draft_fields_and_returns_representation() {
    let (url, state) = spawn_backend().await.expect("spawn backend");
    let backend = RestBackend::new(&url, Some("anon-key".into())).expect("backend");

    let mut patch = RowPatch::new();
    patch.insert("fleet_size".into(), json!(6));
    let row = backend
        .update_row(&RowId::new("C001"), &patch)
        .await
        .expect("updated");
    assert_eq!(row.fleet_size, Some(6));
    assert_eq!(row.name.as_deref(), Some("Acme"));

    let patches = state.patches.lock().await.clone();
    assert_eq!(patches, vec![("eq.C001".to_string(), json!({ "fleet_size": 6 }))]);
}

#[tokio::test]
async fn patch_maps_rejections_and_missing_rows() {
    let (url, _) = spawn_backend().await.expect("spawn backend");
    let backend = RestBackend::new(&url, None).expect("backend");

    let mut negative = RowPatch::new();
    negative.insert("fleet_size".into(), json!(-1));
    let err = backend
        .update_row(&RowId::new("C001"), &negative)
        .await
        .expect_err("rejected");
    assert!(matches!(err, SourceError::Validation { field: Some(ref f), .. } if f == "fleet_size"));

    let mut rename = RowPatch::new();
    rename.insert("name".into(), json!("Gone"));
    let err = backend
        .update_row(&RowId::new("C404"), &rename)
        .await
        .expect_err("missing");
    assert!(matches!(err, SourceError::NotFound(_)));
}

#[tokio::test]
async fn facet_values_and_report_levels_use_rpc() {
    let (url, state) = spawn_backend().await.expect("spawn backend");
    let backend = RestBackend::new(&url, None).expect("backend");
    let owner = OwnerId::new("owner-1");

    let values = backend
        .list_facet_values(&owner, "region")
        .await
        .expect("values");
    assert_eq!(values, vec!["East", "West"]);
    assert!(matches!(
        backend.list_facet_values(&owner, "colour").await,
        Err(SourceError::NotFound(_))
    ));

    let routes = backend
        .fetch_level(&owner, LevelType::Route, Some(&NodeId::new("B1")))
        .await
        .expect("routes");
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].level, LevelType::Route);
    assert_eq!(routes[0].parent_id, Some(NodeId::new("B1")));
    assert_eq!(routes[0].metrics.completed_visits, 8);
    assert_eq!(routes[0].metrics.extra.get("on_time"), Some(&0.9));

    let sent = state.level_requests.lock().await.clone();
    assert_eq!(
        sent,
        vec![json!({ "owner_id": "owner-1", "level": "ROUTE", "parent_id": "B1" })]
    );

    let err = backend
        .fetch_level(&owner, LevelType::User, None)
        .await
        .expect_err("unscoped");
    assert!(matches!(err, SourceError::Validation { .. }));
    assert_eq!(state.level_requests.lock().await.len(), 1);
}
