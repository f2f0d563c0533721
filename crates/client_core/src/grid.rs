//! Paged, filtered, sortable customer grid with single-row inline editing.
//!
//! Every interaction produces a new [`QueryState`] and issues one fetch tagged
//! with a monotonically increasing version. A response is applied only when
//! its version is still the latest when it settles, so the last query built
//! always decides the last page shown, whatever order responses arrive in.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use serde_json::Value;
use shared::{
    domain::{OwnerId, RowId, SortDirection},
    error::SourceError,
    protocol::{page_count, Page, PageRequest, Row, RowPatch},
    source::DataSource,
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub const DEFAULT_SEARCH_DEBOUNCE: Duration = Duration::from_millis(500);
pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const DEFAULT_SORT_KEY: &str = "name";

/// Immutable snapshot of what the user asked to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryState {
    pub search_text: String,
    pub filters: BTreeMap<String, String>,
    pub sort_key: String,
    pub sort_direction: SortDirection,
    pub page_index: usize,
    pub page_size: usize,
}

impl QueryState {
    pub fn new(sort_key: impl Into<String>, page_size: usize) -> Self {
        Self {
            search_text: String::new(),
            filters: BTreeMap::new(),
            sort_key: sort_key.into(),
            sort_direction: SortDirection::Ascending,
            page_index: 0,
            page_size: page_size.max(1),
        }
    }

    /// No search text and no active filter.
    pub fn is_default(&self) -> bool {
        self.search_text.trim().is_empty() && self.filters.is_empty()
    }

    /// Both queries select the same rows, ignoring order and pagination.
    pub fn same_result_set(&self, other: &QueryState) -> bool {
        self.search_text == other.search_text && self.filters == other.filters
    }

    pub fn with_search(&self, text: impl Into<String>) -> Self {
        Self {
            search_text: text.into(),
            page_index: 0,
            ..self.clone()
        }
    }

    /// An empty value clears the facet.
    pub fn with_filter(&self, facet: impl Into<String>, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        let facet = facet.into();
        let value = value.into();
        if value.trim().is_empty() {
            next.filters.remove(&facet);
        } else {
            next.filters.insert(facet, value);
        }
        next.page_index = 0;
        next
    }

    /// Same key while ascending flips to descending; anything else sorts
    /// ascending. The page position is kept.
    pub fn with_sort(&self, key: impl Into<String>) -> Self {
        let key = key.into();
        let sort_direction = if key == self.sort_key {
            self.sort_direction.flipped()
        } else {
            SortDirection::Ascending
        };
        Self {
            sort_key: key,
            sort_direction,
            ..self.clone()
        }
    }

    /// Clamps against `total_count` when one is known for this result set.
    pub fn with_page(&self, index: usize, total_count: Option<u64>) -> Self {
        let page_index = match total_count {
            Some(total) => index.min(page_count(total, self.page_size) - 1),
            None => index,
        };
        Self {
            page_index,
            ..self.clone()
        }
    }

    pub fn with_page_size(&self, size: usize) -> Self {
        Self {
            page_size: size.max(1),
            page_index: 0,
            ..self.clone()
        }
    }

    pub fn to_request(&self, owner_id: &OwnerId) -> PageRequest {
        let search = self.search_text.trim();
        PageRequest {
            owner_id: owner_id.clone(),
            page_index: self.page_index,
            page_size: self.page_size,
            filters: self.filters.clone(),
            search: (!search.is_empty()).then(|| search.to_string()),
            sort_key: self.sort_key.clone(),
            sort_ascending: self.sort_direction.is_ascending(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GridConfig {
    pub owner_id: OwnerId,
    pub search_debounce: Duration,
    pub page_size: usize,
    pub sort_key: String,
}

impl GridConfig {
    pub fn new(owner_id: OwnerId) -> Self {
        Self {
            owner_id,
            search_debounce: DEFAULT_SEARCH_DEBOUNCE,
            page_size: DEFAULT_PAGE_SIZE,
            sort_key: DEFAULT_SORT_KEY.to_string(),
        }
    }
}

/// The one row being edited. `draft` holds touched fields only.
#[derive(Debug, Clone, PartialEq)]
pub struct EditSession {
    target_row_id: RowId,
    original: Row,
    draft: RowPatch,
    committing: bool,
    error: Option<String>,
    /// Fetch version of the page `original` was taken from.
    page_version: u64,
}

impl EditSession {
    fn open(target_row_id: RowId, original: Row, page_version: u64) -> Self {
        Self {
            target_row_id,
            original,
            draft: RowPatch::new(),
            page_version,
            committing: false,
            error: None,
        }
    }

    pub fn target_row_id(&self) -> &RowId {
        &self.target_row_id
    }

    pub fn original(&self) -> &Row {
        &self.original
    }

    pub fn draft(&self) -> &RowPatch {
        &self.draft
    }

    pub fn is_committing(&self) -> bool {
        self.committing
    }

    /// Message of the last failed commit, shown next to the edit form.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn value(&self, field: &str) -> Option<Value> {
        self.draft
            .get(field)
            .cloned()
            .or_else(|| self.original.field(field))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
    /// Nothing has been fetched successfully yet.
    Loading,
    /// The owner has no customers at all.
    Empty,
    /// Search or filters exclude every row; filter controls stay active.
    NoMatches,
    Rows,
}

#[derive(Debug, Clone)]
pub struct GridView {
    pub query: Arc<QueryState>,
    pub pending_search: String,
    pub page: Option<Page>,
    pub page_count: Option<usize>,
    pub loading: bool,
    pub error: Option<SourceError>,
    pub display_state: DisplayState,
    pub edit: Option<EditSession>,
    pub facet_values: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GridError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("no row is being edited")]
    NoEditSession,
    #[error("commit for row {0} is already in flight")]
    CommitInProgress(RowId),
}

#[derive(Debug, Clone)]
pub enum GridEvent {
    PageApplied {
        version: u64,
        total_count: u64,
        rows: usize,
    },
    StaleResponseDiscarded {
        version: u64,
        latest: u64,
    },
    FetchFailed {
        version: u64,
        error: SourceError,
    },
    EditOpened {
        row_id: RowId,
    },
    EditClosed {
        row_id: RowId,
        committed: bool,
    },
    EditFailed {
        row_id: RowId,
        error: SourceError,
    },
}

struct GridState {
    query: Arc<QueryState>,
    pending_search: String,
    search_generation: u64,
    debounce_task: Option<JoinHandle<()>>,
    version: u64,
    loading_version: Option<u64>,
    outstanding: usize,
    page: Option<Page>,
    page_version: u64,
    page_query: Option<Arc<QueryState>>,
    error: Option<SourceError>,
    edit: Option<EditSession>,
    facet_values: BTreeMap<String, Vec<String>>,
}

impl GridState {
    /// Total of the last successful fetch, if it covered the current result set.
    fn known_total(&self) -> Option<u64> {
        let page = self.page.as_ref()?;
        let page_query = self.page_query.as_ref()?;
        page_query
            .same_result_set(&self.query)
            .then_some(page.total_count)
    }

    fn display_state(&self) -> DisplayState {
        match (&self.page, &self.page_query) {
            (Some(page), Some(query)) if page.total_count == 0 => {
                if query.is_default() {
                    DisplayState::Empty
                } else {
                    DisplayState::NoMatches
                }
            }
            (Some(_), Some(_)) => DisplayState::Rows,
            _ => DisplayState::Loading,
        }
    }
}

pub struct PagedFilterGrid {
    source: Arc<dyn DataSource>,
    config: GridConfig,
    inner: Mutex<GridState>,
    activity: watch::Sender<u64>,
    events: broadcast::Sender<GridEvent>,
}

impl PagedFilterGrid {
    /// Builds an idle grid; call [`PagedFilterGrid::reload`] for the first page.
    pub fn new(source: Arc<dyn DataSource>, config: GridConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let (activity, _) = watch::channel(0);
        let query = Arc::new(QueryState::new(config.sort_key.clone(), config.page_size));
        Arc::new(Self {
            source,
            config,
            inner: Mutex::new(GridState {
                query,
                pending_search: String::new(),
                search_generation: 0,
                debounce_task: None,
                version: 0,
                loading_version: None,
                outstanding: 0,
                page: None,
                page_version: 0,
                page_query: None,
                error: None,
                edit: None,
                facet_values: BTreeMap::new(),
            }),
            activity,
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<GridEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub async fn query(&self) -> Arc<QueryState> {
        Arc::clone(&self.inner.lock().await.query)
    }

    pub async fn view(&self) -> GridView {
        let state = self.inner.lock().await;
        GridView {
            query: Arc::clone(&state.query),
            pending_search: state.pending_search.clone(),
            page: state.page.clone(),
            page_count: state
                .known_total()
                .map(|total| page_count(total, state.query.page_size)),
            loading: state.loading_version.is_some(),
            error: state.error.clone(),
            display_state: state.display_state(),
            edit: state.edit.clone(),
            facet_values: state.facet_values.clone(),
        }
    }

    /// Field of a row on the current page, read through the open draft.
    pub async fn cell_value(&self, row_id: &RowId, field: &str) -> Option<Value> {
        let state = self.inner.lock().await;
        if let Some(draft_value) = state
            .edit
            .as_ref()
            .filter(|session| &session.target_row_id == row_id)
            .and_then(|session| session.draft.get(field))
        {
            return Some(draft_value.clone());
        }
        state.page.as_ref()?.find(row_id)?.field(field)
    }

    /// Resolves once no debounce timer is pending and no fetch is outstanding.
    pub async fn wait_idle(&self) {
        let mut activity = self.activity.subscribe();
        loop {
            {
                let state = self.inner.lock().await;
                if state.debounce_task.is_none() && state.outstanding == 0 {
                    return;
                }
            }
            if activity.changed().await.is_err() {
                return;
            }
        }
    }

    /// Replaces the whole query and fetches it once. A pending debounced
    /// search is cancelled and any open edit session is dropped.
    pub async fn load_query(self: &Arc<Self>, query: QueryState) {
        let mut state = self.inner.lock().await;
        if let Some(task) = state.debounce_task.take() {
            task.abort();
        }
        state.search_generation += 1;
        state.pending_search = query.search_text.clone();
        state.query = Arc::new(query);
        self.discard_edit(&mut state);
        self.issue_fetch(&mut state);
    }

    /// Re-issues the current query. Drops any open edit session.
    pub async fn reload(self: &Arc<Self>) {
        let mut state = self.inner.lock().await;
        self.discard_edit(&mut state);
        self.issue_fetch(&mut state);
    }

    pub async fn set_search_text(self: &Arc<Self>, text: impl Into<String>) {
        let text = text.into();
        let mut state = self.inner.lock().await;
        state.pending_search = text.clone();
        state.search_generation += 1;
        if let Some(task) = state.debounce_task.take() {
            task.abort();
        }

        if text != state.query.search_text {
            let generation = state.search_generation;
            let delay = self.config.search_debounce;
            let grid = Arc::clone(self);
            state.debounce_task = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                grid.apply_debounced_search(generation).await;
            }));
        }
        drop(state);
        self.touch();
    }

    async fn apply_debounced_search(self: &Arc<Self>, generation: u64) {
        let mut state = self.inner.lock().await;
        if state.search_generation != generation {
            return;
        }
        state.debounce_task = None;
        let next = state.query.with_search(state.pending_search.clone());
        debug!(search = %next.search_text, "grid: debounced search fired");
        self.replace_query(&mut state, next);
        drop(state);
        self.touch();
    }

    pub async fn set_filter(self: &Arc<Self>, facet: impl Into<String>, value: impl Into<String>) {
        let mut state = self.inner.lock().await;
        let next = state.query.with_filter(facet, value);
        self.replace_query(&mut state, next);
    }

    pub async fn set_sort(self: &Arc<Self>, key: impl Into<String>) {
        let mut state = self.inner.lock().await;
        let next = state.query.with_sort(key);
        self.replace_query(&mut state, next);
    }

    pub async fn set_page(self: &Arc<Self>, index: usize) {
        let mut state = self.inner.lock().await;
        let next = state.query.with_page(index, state.known_total());
        self.replace_query(&mut state, next);
    }

    pub async fn set_page_size(self: &Arc<Self>, size: usize) {
        let mut state = self.inner.lock().await;
        let next = state.query.with_page_size(size);
        self.replace_query(&mut state, next);
    }

    /// Populates a filter dropdown. Failures leave the list empty.
    pub async fn load_facet_values(&self, facet: &str) -> Vec<String> {
        let values = match self
            .source
            .list_facet_values(&self.config.owner_id, facet)
            .await
        {
            Ok(values) => values,
            Err(err) => {
                warn!(facet, error = %err, "grid: facet values unavailable");
                Vec::new()
            }
        };
        self.inner
            .lock()
            .await
            .facet_values
            .insert(facet.to_string(), values.clone());
        values
    }

    /// Opens an edit session on a row of the current page. Returns `false`
    /// without side effects when another row is already being edited.
    pub async fn start_edit(&self, row_id: &RowId) -> bool {
        let mut state = self.inner.lock().await;
        if state.edit.is_some() {
            return false;
        }
        let Some(row) = state.page.as_ref().and_then(|page| page.find(row_id)).cloned() else {
            return false;
        };
        state.edit = Some(EditSession::open(row_id.clone(), row, state.page_version));
        drop(state);
        debug!(row_id = %row_id, "grid: edit session opened");
        let _ = self.events.send(GridEvent::EditOpened {
            row_id: row_id.clone(),
        });
        true
    }

    /// Records a value in the draft. Returns `false` when there is no session
    /// or a commit is in flight.
    pub async fn edit_field(&self, field: impl Into<String>, value: Value) -> bool {
        let mut state = self.inner.lock().await;
        match state.edit.as_mut() {
            Some(session) if !session.committing => {
                session.draft.insert(field.into(), value);
                true
            }
            _ => false,
        }
    }

    pub async fn cancel_edit(&self) -> bool {
        let mut state = self.inner.lock().await;
        let Some(session) = state.edit.take() else {
            return false;
        };
        drop(state);
        let _ = self.events.send(GridEvent::EditClosed {
            row_id: session.target_row_id,
            committed: false,
        });
        true
    }

    /// Sends the draft to the source. On success the session closes and the
    /// page is fetched again so server-derived fields show up; on failure the
    /// session stays open with the draft intact.
    pub async fn commit_edit(self: &Arc<Self>) -> Result<Row, GridError> {
        let (row_id, patch) = {
            let mut state = self.inner.lock().await;
            let session = state.edit.as_mut().ok_or(GridError::NoEditSession)?;
            if session.committing {
                return Err(GridError::CommitInProgress(session.target_row_id.clone()));
            }
            if let Err(err) = session.original.apply_patch(&session.draft) {
                session.error = Some(err.to_string());
                return Err(err.into());
            }
            if session.draft.is_empty() {
                let session = state.edit.take().ok_or(GridError::NoEditSession)?;
                drop(state);
                let _ = self.events.send(GridEvent::EditClosed {
                    row_id: session.target_row_id,
                    committed: false,
                });
                return Ok(session.original);
            }
            session.committing = true;
            session.error = None;
            (session.target_row_id.clone(), session.draft.clone())
        };
        self.touch();

        let result = self.source.update_row(&row_id, &patch).await;

        let mut state = self.inner.lock().await;
        let outcome = match result {
            Ok(row) => {
                if state
                    .edit
                    .as_ref()
                    .is_some_and(|session| session.target_row_id == row_id)
                {
                    state.edit = None;
                }
                info!(row_id = %row_id, fields = patch.len(), "grid: edit committed");
                let _ = self.events.send(GridEvent::EditClosed {
                    row_id,
                    committed: true,
                });
                self.issue_fetch(&mut state);
                Ok(row)
            }
            Err(error) => {
                if let Some(session) = state
                    .edit
                    .as_mut()
                    .filter(|session| session.target_row_id == row_id)
                {
                    session.committing = false;
                    session.error = Some(error.to_string());
                }
                warn!(row_id = %row_id, error = %error, "grid: edit commit failed");
                let _ = self.events.send(GridEvent::EditFailed {
                    row_id,
                    error: error.clone(),
                });
                Err(GridError::Source(error))
            }
        };
        drop(state);
        self.touch();
        outcome
    }

    fn replace_query(self: &Arc<Self>, state: &mut GridState, next: QueryState) {
        if next == *state.query {
            return;
        }
        state.query = Arc::new(next);
        self.discard_edit(state);
        self.issue_fetch(state);
    }

    fn discard_edit(&self, state: &mut GridState) {
        if let Some(session) = state.edit.take() {
            debug!(row_id = %session.target_row_id, "grid: edit session dropped");
            let _ = self.events.send(GridEvent::EditClosed {
                row_id: session.target_row_id,
                committed: false,
            });
        }
    }

    fn issue_fetch(self: &Arc<Self>, state: &mut GridState) {
        state.version += 1;
        state.outstanding += 1;
        let version = state.version;
        state.loading_version = Some(version);
        let request = state.query.to_request(&self.config.owner_id);
        debug!(
            version,
            page_index = request.page_index,
            page_size = request.page_size,
            sort_key = %request.sort_key,
            "grid: fetching page"
        );

        let grid = Arc::clone(self);
        tokio::spawn(async move {
            let result = grid.source.fetch_page(&request).await;
            grid.settle_fetch(version, result).await;
        });
        self.touch();
    }

    async fn settle_fetch(self: &Arc<Self>, version: u64, result: Result<Page, SourceError>) {
        let mut state = self.inner.lock().await;
        state.outstanding = state.outstanding.saturating_sub(1);

        if version != state.version {
            debug!(version, latest = state.version, "grid: discarding stale page");
            let _ = self.events.send(GridEvent::StaleResponseDiscarded {
                version,
                latest: state.version,
            });
        } else {
            state.loading_version = None;
            match result {
                Ok(page) => {
                    let pages = page.page_count(state.query.page_size);
                    if state.query.page_index >= pages {
                        info!(
                            page_index = state.query.page_index,
                            pages, "grid: page index out of range, clamping"
                        );
                        let clamped = state.query.with_page(pages - 1, Some(page.total_count));
                        state.query = Arc::new(clamped);
                        self.issue_fetch(&mut state);
                    } else {
                        let _ = self.events.send(GridEvent::PageApplied {
                            version,
                            total_count: page.total_count,
                            rows: page.rows.len(),
                        });
                        state.error = None;
                        state.page_query = Some(Arc::clone(&state.query));
                        state.page = Some(page);
                        state.page_version = version;
                        // A session opened on the page this one replaces
                        // holds a snapshot that may no longer be shown.
                        if state
                            .edit
                            .as_ref()
                            .is_some_and(|session| session.page_version < version)
                        {
                            self.discard_edit(&mut state);
                        }
                    }
                }
                Err(error) => {
                    warn!(version, error = %error, "grid: page fetch failed");
                    let _ = self.events.send(GridEvent::FetchFailed {
                        version,
                        error: error.clone(),
                    });
                    state.error = Some(error);
                }
            }
        }
        drop(state);
        self.touch();
    }

    fn touch(&self) {
        self.activity.send_modify(|tick| *tick = tick.wrapping_add(1));
    }
}

#[cfg(test)]
#[path = "tests/grid_tests.rs"]
mod tests;
