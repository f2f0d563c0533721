//! Client-side controllers for the Reach customer grid and report tree,
//! plus the HTTP backend and settings they run against.

pub mod grid;
pub mod rest;
pub mod settings;
pub mod tree;

pub use grid::{
    DisplayState, EditSession, GridConfig, GridError, GridEvent, GridView, PagedFilterGrid,
    QueryState,
};
pub use rest::RestBackend;
pub use settings::{load_settings, Settings};
pub use tree::{Affordance, ChildrenView, LazyTree, NodeKey, Toggle, TreeError, VisibleRow};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
