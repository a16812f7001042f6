//! Closure-table hierarchies for SeaORM entities.
//!
//! A closure table stores one `(ancestor, descendant, distance)` row for every
//! pair of nodes on the same root path, so ancestor, descendant and depth
//! queries need no recursive traversal. [`ClosureStore`] owns the set-based
//! rewrites of that relation, [`HierarchyService`] layers node operations and
//! cycle checks on top of it, and [`ForestBuilder`] nests flat query results
//! back into trees. PostgreSQL and SQLite are supported.

pub mod config;
pub mod error;
pub mod forest;
pub mod integrity;
pub mod lock;
pub mod service;
pub mod store;
pub mod traits;

pub mod prelude {
    //! Convenient re-exports for consumers.
    pub use crate::config::{
        AdvisoryLockStrategy, ClosureTableConfig, ClosureTableOptions, DeletionPolicy,
        OrderStrategy,
    };
    pub use crate::forest::{ForestBuilder, TreeNode};
    pub use crate::service::HierarchyService;
    pub use crate::traits::ClosureNode;
}

#[doc(hidden)]
pub mod __private {
    pub use once_cell::sync::Lazy;
}

pub use closure_table_macros::ClosureNode as ClosureNodeDerive;
#[doc(hidden)]
pub use closure_table_macros::ClosureNode;
pub use config::{
    AdvisoryLockKey, AdvisoryLockStrategy, ClosureTableConfig, ClosureTableOptions,
    DeletionPolicy, OrderStrategy,
};
pub use error::ClosureTableError;
pub use forest::{build_nodes, ForestBuilder, TreeNode};
pub use integrity::{find_violations, Violation};
pub use service::{HierarchyService, PerfectTreeReport};
pub use store::{ClosureRow, ClosureStore, DetachScope};
pub use traits::ClosureNode;
