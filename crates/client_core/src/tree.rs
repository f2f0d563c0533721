//! Report hierarchy BRANCH -> ROUTE -> USER -> WEEK -> DAY, fetched one level
//! at a time as nodes are expanded.
//!
//! Nodes live in an arena keyed by [`NodeKey`]. Keys are never reused, so a
//! key held across [`LazyTree::load_root`] simply stops resolving.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use futures::future::{BoxFuture, FutureExt, Shared};
use shared::{
    domain::{LevelType, NodeId, OwnerId},
    error::SourceError,
    protocol::TreeNode,
    source::HierarchySource,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(u64);

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type LevelFetch = Shared<BoxFuture<'static, Result<Vec<TreeNode>, SourceError>>>;

enum ChildState {
    Unloaded,
    Loading { ticket: u64, fetch: LevelFetch },
    Loaded(Vec<NodeKey>),
}

struct NodeRecord {
    node: TreeNode,
    parent: Option<NodeKey>,
    children: ChildState,
}

impl NodeRecord {
    fn new(node: TreeNode, parent: Option<NodeKey>) -> Self {
        Self {
            node,
            parent,
            children: ChildState::Unloaded,
        }
    }

    fn affordance(&self) -> Affordance {
        if self.node.level.is_leaf() {
            return Affordance::Leaf;
        }
        match &self.children {
            ChildState::Unloaded => Affordance::Expandable,
            ChildState::Loading { .. } => Affordance::Loading,
            ChildState::Loaded(children) if children.is_empty() => Affordance::Leaf,
            ChildState::Loaded(_) => Affordance::Expandable,
        }
    }
}

/// Public view of a node's children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildrenView {
    Unloaded,
    Loading,
    Loaded(Vec<NodeKey>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affordance {
    Expandable,
    Loading,
    Leaf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisibleRow {
    pub key: NodeKey,
    pub depth: usize,
    pub node: TreeNode,
    pub affordance: Affordance,
    pub expanded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Collapsed,
    Expanded,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("unknown tree node {0}")]
    UnknownNode(NodeKey),
    #[error("{level} node {id} has no children")]
    NotExpandable { id: NodeId, level: LevelType },
}

#[derive(Default)]
struct TreeState {
    next_key: u64,
    next_ticket: u64,
    root_generation: u64,
    nodes: HashMap<NodeKey, NodeRecord>,
    roots: Vec<NodeKey>,
    expanded: HashSet<NodeKey>,
}

impl TreeState {
    fn alloc_key(&mut self) -> NodeKey {
        self.next_key += 1;
        NodeKey(self.next_key)
    }

    /// Depth-first walk of loaded nodes in sibling order. With
    /// `expanded_only` the walk stops at collapsed nodes.
    fn walk(&self, expanded_only: bool) -> Vec<(NodeKey, usize)> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<(NodeKey, usize)> =
            self.roots.iter().rev().map(|key| (*key, 0)).collect();
        while let Some((key, depth)) = stack.pop() {
            let Some(record) = self.nodes.get(&key) else {
                continue;
            };
            order.push((key, depth));
            if expanded_only && !self.expanded.contains(&key) {
                continue;
            }
            if let ChildState::Loaded(children) = &record.children {
                stack.extend(children.iter().rev().map(|child| (*child, depth + 1)));
            }
        }
        order
    }
}

pub struct LazyTree {
    source: Arc<dyn HierarchySource>,
    owner_id: OwnerId,
    inner: Mutex<TreeState>,
}

impl LazyTree {
    pub fn new(source: Arc<dyn HierarchySource>, owner_id: OwnerId) -> Arc<Self> {
        Arc::new(Self {
            source,
            owner_id,
            inner: Mutex::new(TreeState::default()),
        })
    }

    /// Builds a tree and fetches its BRANCH level.
    pub async fn load(
        source: Arc<dyn HierarchySource>,
        owner_id: OwnerId,
    ) -> Result<Arc<Self>, TreeError> {
        let tree = Self::new(source, owner_id);
        tree.load_root().await?;
        Ok(tree)
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }

    /// Replaces the whole tree with a fresh BRANCH level and collapses
    /// everything. When calls overlap only the latest one is applied. On
    /// failure the current tree is left as it was.
    pub async fn load_root(&self) -> Result<(), TreeError> {
        let generation = {
            let mut state = self.inner.lock().await;
            state.root_generation += 1;
            state.root_generation
        };

        let result = self
            .source
            .fetch_level(&self.owner_id, LevelType::Branch, None)
            .await;

        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        if generation != state.root_generation {
            debug!(
                generation,
                latest = state.root_generation,
                "tree: discarding stale root level"
            );
            return Ok(());
        }

        let nodes = result.map_err(|err| {
            warn!(owner_id = %self.owner_id, error = %err, "tree: root level fetch failed");
            err
        })?;

        state.nodes.clear();
        state.expanded.clear();
        state.roots.clear();
        for node in nodes {
            if node.level != LevelType::Branch {
                warn!(id = %node.id, level = %node.level, "tree: dropping misplaced root node");
                continue;
            }
            let key = state.alloc_key();
            state.nodes.insert(key, NodeRecord::new(node, None));
            state.roots.push(key);
        }
        info!(
            owner_id = %self.owner_id,
            branches = state.roots.len(),
            "tree: root level loaded"
        );
        Ok(())
    }

    /// Collapses an expanded node, or expands a collapsed one, fetching its
    /// children the first time. Toggling a node whose children are still in
    /// flight waits for that same fetch instead of starting another.
    pub async fn toggle_expand(self: &Arc<Self>, key: NodeKey) -> Result<Toggle, TreeError> {
        let (ticket, fetch) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let record = state
                .nodes
                .get_mut(&key)
                .ok_or(TreeError::UnknownNode(key))?;

            match &record.children {
                ChildState::Loading { ticket, fetch } => {
                    let pending = (*ticket, fetch.clone());
                    state.expanded.insert(key);
                    pending
                }
                _ if state.expanded.contains(&key) => {
                    state.expanded.remove(&key);
                    debug!(key = %key, id = %record.node.id, "tree: collapsed");
                    return Ok(Toggle::Collapsed);
                }
                ChildState::Loaded(_) => {
                    state.expanded.insert(key);
                    return Ok(Toggle::Expanded);
                }
                ChildState::Unloaded => {
                    let Some(level) = record.node.level.next() else {
                        return Err(TreeError::NotExpandable {
                            id: record.node.id.clone(),
                            level: record.node.level,
                        });
                    };
                    state.next_ticket += 1;
                    let ticket = state.next_ticket;
                    let fetch = self.level_fetch(level, record.node.id.clone());
                    debug!(
                        key = %key,
                        parent_id = %record.node.id,
                        level = %level,
                        "tree: fetching children"
                    );
                    record.children = ChildState::Loading {
                        ticket,
                        fetch: fetch.clone(),
                    };
                    state.expanded.insert(key);

                    // Settles the node even if the caller stops waiting.
                    let tree = Arc::clone(self);
                    let driver = fetch.clone();
                    tokio::spawn(async move {
                        let result = driver.await;
                        tree.settle_children(key, ticket, result).await;
                    });
                    (ticket, fetch)
                }
            }
        };

        let result = fetch.await;
        self.settle_children(key, ticket, result.clone()).await;
        match result {
            Ok(_) => Ok(Toggle::Expanded),
            Err(err) => Err(err.into()),
        }
    }

    fn level_fetch(&self, level: LevelType, parent_id: NodeId) -> LevelFetch {
        let source = Arc::clone(&self.source);
        let owner_id = self.owner_id.clone();
        async move {
            source
                .fetch_level(&owner_id, level, Some(&parent_id))
                .await
        }
        .boxed()
        .shared()
    }

    /// Applies a child fetch once. Later calls for the same ticket, or calls
    /// for a node that has since been replaced, do nothing.
    async fn settle_children(
        &self,
        key: NodeKey,
        ticket: u64,
        result: Result<Vec<TreeNode>, SourceError>,
    ) {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let Some(record) = state.nodes.get_mut(&key) else {
            return;
        };
        if !matches!(&record.children, ChildState::Loading { ticket: current, .. } if *current == ticket)
        {
            return;
        }

        let nodes = match result {
            Ok(nodes) => nodes,
            Err(err) => {
                record.children = ChildState::Unloaded;
                state.expanded.remove(&key);
                warn!(key = %key, id = %record.node.id, error = %err, "tree: child fetch failed");
                return;
            }
        };

        let parent_id = record.node.id.clone();
        let expected = record.node.level.next();
        let mut children = Vec::with_capacity(nodes.len());
        for node in nodes {
            if Some(node.level) != expected {
                warn!(
                    parent_id = %parent_id,
                    id = %node.id,
                    level = %node.level,
                    "tree: dropping node at unexpected level"
                );
                continue;
            }
            let child = state.alloc_key();
            state.nodes.insert(child, NodeRecord::new(node, Some(key)));
            children.push(child);
        }
        debug!(key = %key, parent_id = %parent_id, children = children.len(), "tree: children loaded");
        if let Some(record) = state.nodes.get_mut(&key) {
            record.children = ChildState::Loaded(children);
        }
    }

    pub async fn roots(&self) -> Vec<NodeKey> {
        self.inner.lock().await.roots.clone()
    }

    pub async fn node(&self, key: NodeKey) -> Option<TreeNode> {
        let state = self.inner.lock().await;
        state.nodes.get(&key).map(|record| record.node.clone())
    }

    pub async fn parent(&self, key: NodeKey) -> Option<NodeKey> {
        let state = self.inner.lock().await;
        state.nodes.get(&key).and_then(|record| record.parent)
    }

    pub async fn children(&self, key: NodeKey) -> Option<ChildrenView> {
        let state = self.inner.lock().await;
        let record = state.nodes.get(&key)?;
        Some(match &record.children {
            ChildState::Unloaded => ChildrenView::Unloaded,
            ChildState::Loading { .. } => ChildrenView::Loading,
            ChildState::Loaded(children) => ChildrenView::Loaded(children.clone()),
        })
    }

    pub async fn is_expanded(&self, key: NodeKey) -> bool {
        self.inner.lock().await.expanded.contains(&key)
    }

    /// First loaded node with this level and id, in depth-first order.
    /// Ids are only unique within a parent, hence the level.
    pub async fn find_by_id(&self, level: LevelType, id: &NodeId) -> Option<NodeKey> {
        let state = self.inner.lock().await;
        state.walk(false).into_iter().find_map(|(key, _)| {
            state
                .nodes
                .get(&key)
                .filter(|record| record.node.level == level && &record.node.id == id)
                .map(|_| key)
        })
    }

    /// Rows to render: roots plus the children of every expanded node.
    pub async fn visible_rows(&self) -> Vec<VisibleRow> {
        let state = self.inner.lock().await;
        state
            .walk(true)
            .into_iter()
            .filter_map(|(key, depth)| {
                let record = state.nodes.get(&key)?;
                Some(VisibleRow {
                    key,
                    depth,
                    node: record.node.clone(),
                    affordance: record.affordance(),
                    expanded: state.expanded.contains(&key),
                })
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "tests/tree_tests.rs"]
mod tests;
