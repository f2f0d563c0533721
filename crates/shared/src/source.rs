//! Collaborator contracts consumed by the grid and tree controllers.

use async_trait::async_trait;

use crate::{
    domain::{LevelType, NodeId, OwnerId, RowId},
    error::SourceError,
    protocol::{Page, PageRequest, Row, RowPatch, TreeNode},
};

#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetches one page for the given query. Must be free of side effects so
    /// callers can retry.
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, SourceError>;

    /// Partial update; fields absent from `patch` are left unchanged.
    async fn update_row(&self, row_id: &RowId, patch: &RowPatch) -> Result<Row, SourceError>;

    async fn list_facet_values(
        &self,
        owner_id: &OwnerId,
        facet: &str,
    ) -> Result<Vec<String>, SourceError>;
}

#[async_trait]
pub trait HierarchySource: Send + Sync {
    /// Fetches the nodes of `level` under `parent_id`. Only `Branch` may be
    /// requested without a parent.
    async fn fetch_level(
        &self,
        owner_id: &OwnerId,
        level: LevelType,
        parent_id: Option<&NodeId>,
    ) -> Result<Vec<TreeNode>, SourceError>;
}

/// Rejects a level request whose parent scoping is inconsistent.
pub fn check_level_scope(level: LevelType, parent_id: Option<&NodeId>) -> Result<(), SourceError> {
    match (level, parent_id) {
        (LevelType::Branch, None) => Ok(()),
        (LevelType::Branch, Some(_)) => Err(SourceError::validation(
            Some("parent_id"),
            "branch level is the root and takes no parent",
        )),
        (_, None) => Err(SourceError::validation(
            Some("parent_id"),
            format!("{level} level requires a parent id"),
        )),
        (_, Some(_)) => Ok(()),
    }
}

pub struct MissingDataSource;

#[async_trait]
impl DataSource for MissingDataSource {
    async fn fetch_page(&self, _request: &PageRequest) -> Result<Page, SourceError> {
        Err(SourceError::transient("customer data source is unavailable"))
    }

    async fn update_row(&self, _row_id: &RowId, _patch: &RowPatch) -> Result<Row, SourceError> {
        Err(SourceError::transient("customer data source is unavailable"))
    }

    async fn list_facet_values(
        &self,
        _owner_id: &OwnerId,
        _facet: &str,
    ) -> Result<Vec<String>, SourceError> {
        Err(SourceError::transient("customer data source is unavailable"))
    }
}

pub struct MissingHierarchySource;

#[async_trait]
impl HierarchySource for MissingHierarchySource {
    async fn fetch_level(
        &self,
        _owner_id: &OwnerId,
        _level: LevelType,
        _parent_id: Option<&NodeId>,
    ) -> Result<Vec<TreeNode>, SourceError> {
        Err(SourceError::transient("report hierarchy source is unavailable"))
    }
}
