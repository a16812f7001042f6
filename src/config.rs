use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::error::ClosureTableError;

/// Static configuration describing how a SeaORM model maps onto its
/// closure table.
#[derive(Clone, Debug)]
pub struct ClosureTableConfig {
    entity_name: String,
    entity_table: String,
    key_column: String,
    parent_column: String,
    closure_table: String,
    ancestor_column: String,
    descendant_column: String,
    distance_column: String,
    children_key: String,
    deletion_policy: DeletionPolicy,
    order_strategy: Option<OrderStrategy>,
    soft_delete_column: Option<String>,
    advisory_lock_strategy: AdvisoryLockStrategy,
}

impl ClosureTableConfig {
    /// Create a configuration for the given entity table with every option defaulted.
    ///
    /// The closure table defaults to `<snake_case(entity_name)>_closure`.
    pub fn new(entity_table: impl Into<String>) -> Self {
        let entity_table = entity_table.into();
        let entity_name = entity_table.clone();
        let closure_table = format!("{}_closure", to_snake_case(&entity_name));

        Self {
            entity_name,
            entity_table,
            key_column: "id".to_string(),
            parent_column: "parent".to_string(),
            closure_table,
            ancestor_column: "ancestor".to_string(),
            descendant_column: "descendant".to_string(),
            distance_column: "distance".to_string(),
            children_key: "children".to_string(),
            deletion_policy: DeletionPolicy::default(),
            order_strategy: None,
            soft_delete_column: None,
            advisory_lock_strategy: AdvisoryLockStrategy::Disabled,
        }
    }

    /// Merge options produced by [`ClosureTableOptions`].
    pub(crate) fn apply_options(mut self, options: ClosureTableOptions) -> Self {
        if let Some(entity_name) = options.entity_name {
            if options.closure_table.is_none() {
                self.closure_table = format!("{}_closure", to_snake_case(&entity_name));
            }
            self.entity_name = entity_name;
        }
        if let Some(key_column) = options.key_column {
            self.key_column = key_column;
        }
        if let Some(parent_column) = options.parent_column {
            self.parent_column = parent_column;
        }
        if let Some(closure_table) = options.closure_table {
            self.closure_table = closure_table;
        }
        if let Some(column) = options.ancestor_column {
            self.ancestor_column = column;
        }
        if let Some(column) = options.descendant_column {
            self.descendant_column = column;
        }
        if let Some(column) = options.distance_column {
            self.distance_column = column;
        }
        if let Some(children_key) = options.children_key {
            self.children_key = children_key;
        }
        if let Some(policy) = options.deletion_policy {
            self.deletion_policy = policy;
        }
        if let Some(order_strategy) = options.order_strategy {
            self.order_strategy = Some(order_strategy);
        }
        if let Some(column) = options.soft_delete_column {
            self.soft_delete_column = Some(column);
        }
        if let Some(strategy) = options.advisory_lock_strategy {
            self.advisory_lock_strategy = strategy;
        }
        self
    }

    /// Check that every table and column name is a plain SQL identifier.
    ///
    /// Names are interpolated into set-based statements, so anything other
    /// than `[A-Za-z_][A-Za-z0-9_]*` is rejected.
    pub fn validate(&self) -> Result<(), ClosureTableError> {
        let identifiers = [
            ("entity table", self.entity_table.as_str()),
            ("key column", self.key_column.as_str()),
            ("parent column", self.parent_column.as_str()),
            ("closure table", self.closure_table.as_str()),
            ("ancestor column", self.ancestor_column.as_str()),
            ("descendant column", self.descendant_column.as_str()),
            ("distance column", self.distance_column.as_str()),
        ];
        for (label, value) in identifiers {
            check_identifier(label, value)?;
        }
        if let Some(column) = &self.soft_delete_column {
            check_identifier("soft delete column", column)?;
        }
        if let Some(OrderStrategy::NumericColumn { column }) = &self.order_strategy {
            check_identifier("order column", column)?;
        }

        if self.ancestor_column == self.descendant_column
            || self.ancestor_column == self.distance_column
            || self.descendant_column == self.distance_column
        {
            return Err(ClosureTableError::invalid_configuration(format!(
                "closure columns must be distinct (ancestor `{}`, descendant `{}`, distance `{}`)",
                self.ancestor_column, self.descendant_column, self.distance_column
            )));
        }
        if self.closure_table == self.entity_table {
            return Err(ClosureTableError::invalid_configuration(
                "closure table cannot be the entity table",
            ));
        }
        if self.children_key.is_empty() {
            return Err(ClosureTableError::invalid_configuration(
                "children key cannot be empty",
            ));
        }
        Ok(())
    }

    /// Logical entity name used for diagnostics and lock keys.
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Table holding the primary entity rows.
    pub fn entity_table(&self) -> &str {
        &self.entity_table
    }

    /// Primary key column of the entity table.
    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    /// Column storing the parent foreign key.
    pub fn parent_column(&self) -> &str {
        &self.parent_column
    }

    /// Table backing the closure relation.
    pub fn closure_table(&self) -> &str {
        &self.closure_table
    }

    pub fn ancestor_column(&self) -> &str {
        &self.ancestor_column
    }

    pub fn descendant_column(&self) -> &str {
        &self.descendant_column
    }

    pub fn distance_column(&self) -> &str {
        &self.distance_column
    }

    /// Field name the forest builder writes nested children into.
    pub fn children_key(&self) -> &str {
        &self.children_key
    }

    /// What happens to the closure rows of a node's subtree when the node is deleted.
    pub fn deletion_policy(&self) -> DeletionPolicy {
        self.deletion_policy
    }

    /// Ordering strategy to apply when returning children and descendants.
    pub fn order_strategy(&self) -> Option<&OrderStrategy> {
        self.order_strategy.as_ref()
    }

    /// Column marking soft-deleted entities, if the entity supports it.
    pub fn soft_delete_column(&self) -> Option<&str> {
        self.soft_delete_column.as_deref()
    }

    /// Advisory lock strategy (PostgreSQL only).
    pub fn advisory_lock_strategy(&self) -> &AdvisoryLockStrategy {
        &self.advisory_lock_strategy
    }
}

/// Builder-style options consumed by the derive macro.
#[derive(Clone, Debug, Default)]
pub struct ClosureTableOptions {
    entity_name: Option<String>,
    key_column: Option<String>,
    parent_column: Option<String>,
    closure_table: Option<String>,
    ancestor_column: Option<String>,
    descendant_column: Option<String>,
    distance_column: Option<String>,
    children_key: Option<String>,
    deletion_policy: Option<DeletionPolicy>,
    order_strategy: Option<OrderStrategy>,
    soft_delete_column: Option<String>,
    advisory_lock_strategy: Option<AdvisoryLockStrategy>,
}

impl ClosureTableOptions {
    pub fn entity_name(mut self, value: impl Into<String>) -> Self {
        self.entity_name = Some(value.into());
        self
    }

    pub fn key_column(mut self, value: impl Into<String>) -> Self {
        self.key_column = Some(value.into());
        self
    }

    pub fn parent_column(mut self, value: impl Into<String>) -> Self {
        self.parent_column = Some(value.into());
        self
    }

    pub fn closure_table(mut self, value: impl Into<String>) -> Self {
        self.closure_table = Some(value.into());
        self
    }

    pub fn ancestor_column(mut self, value: impl Into<String>) -> Self {
        self.ancestor_column = Some(value.into());
        self
    }

    pub fn descendant_column(mut self, value: impl Into<String>) -> Self {
        self.descendant_column = Some(value.into());
        self
    }

    pub fn distance_column(mut self, value: impl Into<String>) -> Self {
        self.distance_column = Some(value.into());
        self
    }

    pub fn children_key(mut self, value: impl Into<String>) -> Self {
        self.children_key = Some(value.into());
        self
    }

    pub fn deletion_policy(mut self, policy: DeletionPolicy) -> Self {
        self.deletion_policy = Some(policy);
        self
    }

    pub fn order_strategy(mut self, strategy: OrderStrategy) -> Self {
        self.order_strategy = Some(strategy);
        self
    }

    pub fn soft_delete_column(mut self, value: impl Into<String>) -> Self {
        self.soft_delete_column = Some(value.into());
        self
    }

    pub fn advisory_lock_strategy(mut self, strategy: AdvisoryLockStrategy) -> Self {
        self.advisory_lock_strategy = Some(strategy);
        self
    }

    pub fn apply(self, base: ClosureTableConfig) -> ClosureTableConfig {
        base.apply_options(self)
    }
}

/// Closure maintenance applied when a node is deleted.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeletionPolicy {
    /// Direct children become roots; only the deleted node's rows are dropped.
    #[default]
    ReparentChildrenToRoot,
    /// Every closure row below the deleted node is removed. Children keep
    /// their parent pointers, so callers delete the whole subtree's entities.
    CascadeSubtree,
}

impl DeletionPolicy {
    /// Parse the spelling accepted by `#[closure_table(deletion_policy = "...")]`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "reparent" | "reparent-children-to-root" => Some(Self::ReparentChildrenToRoot),
            "cascade" | "cascade-subtree" => Some(Self::CascadeSubtree),
            _ => None,
        }
    }
}

/// Sibling ordering applied to query results after distance.
///
/// Without one, results are ordered by key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OrderStrategy {
    NumericColumn { column: String },
}

impl OrderStrategy {
    pub fn numeric_column(column: impl Into<String>) -> Self {
        Self::NumericColumn {
            column: column.into(),
        }
    }
}

/// Key used for PostgreSQL advisory locks.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct AdvisoryLockKey(String);

impl AdvisoryLockKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Derive a stable key namespaced by entity and closure table.
    pub fn derived_from(config: &ClosureTableConfig) -> Self {
        let entity = config.entity_name();
        let closure = config.closure_table();
        let mut hasher = Hasher::new();
        hasher.update(entity.as_bytes());
        hasher.update(b"/");
        hasher.update(closure.as_bytes());
        let crc = hasher.finalize();
        Self(format!("closure-table::{entity}::{closure}::{crc:x}"))
    }
}

/// Configuration describing how to acquire advisory locks around engine transactions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AdvisoryLockStrategy {
    Disabled,
    Namespaced(AdvisoryLockKey),
}

impl AdvisoryLockStrategy {
    pub fn key(&self) -> Option<&AdvisoryLockKey> {
        match self {
            AdvisoryLockStrategy::Disabled => None,
            AdvisoryLockStrategy::Namespaced(key) => Some(key),
        }
    }
}

fn check_identifier(label: &str, value: &str) -> Result<(), ClosureTableError> {
    let mut chars = value.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(ClosureTableError::invalid_configuration(format!(
            "{label} `{value}` is not a valid SQL identifier"
        )))
    }
}

pub(crate) fn to_snake_case(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 4);
    let mut prev_lower = false;
    for c in value.chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_entity_name() {
        let config = ClosureTableConfig::new("CategoryNode");
        assert_eq!(config.closure_table(), "category_node_closure");
        assert_eq!(config.parent_column(), "parent");
        assert_eq!(config.ancestor_column(), "ancestor");
        assert_eq!(config.descendant_column(), "descendant");
        assert_eq!(config.distance_column(), "distance");
        assert_eq!(config.children_key(), "children");
        assert_eq!(
            config.deletion_policy(),
            DeletionPolicy::ReparentChildrenToRoot
        );
        assert!(config.advisory_lock_strategy().key().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn options_override_defaults() {
        let config = ClosureTableOptions::default()
            .entity_name("Menu")
            .parent_column("parent_id")
            .deletion_policy(DeletionPolicy::CascadeSubtree)
            .apply(ClosureTableConfig::new("menus"));

        assert_eq!(config.entity_table(), "menus");
        assert_eq!(config.closure_table(), "menu_closure");
        assert_eq!(config.parent_column(), "parent_id");
        assert_eq!(config.deletion_policy(), DeletionPolicy::CascadeSubtree);
    }

    #[test]
    fn explicit_closure_table_wins_over_entity_name() {
        let config = ClosureTableOptions::default()
            .closure_table("menu_paths")
            .entity_name("Menu")
            .apply(ClosureTableConfig::new("menus"));
        assert_eq!(config.closure_table(), "menu_paths");
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        let config = ClosureTableOptions::default()
            .ancestor_column("ancestor; DROP TABLE x")
            .apply(ClosureTableConfig::new("nodes"));
        assert!(matches!(
            config.validate(),
            Err(ClosureTableError::InvalidConfiguration(_))
        ));

        let config = ClosureTableOptions::default()
            .closure_table("")
            .apply(ClosureTableConfig::new("nodes"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_colliding_columns() {
        let config = ClosureTableOptions::default()
            .distance_column("ancestor")
            .apply(ClosureTableConfig::new("nodes"));
        assert!(matches!(
            config.validate(),
            Err(ClosureTableError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn lock_key_is_stable() {
        let config = ClosureTableConfig::new("nodes");
        let a = AdvisoryLockKey::derived_from(&config);
        let b = AdvisoryLockKey::derived_from(&config);
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("closure-table::nodes::nodes_closure::"));
    }

    #[test]
    fn parses_deletion_policy_spellings() {
        assert_eq!(
            DeletionPolicy::parse("cascade"),
            Some(DeletionPolicy::CascadeSubtree)
        );
        assert_eq!(
            DeletionPolicy::parse("reparent-children-to-root"),
            Some(DeletionPolicy::ReparentChildrenToRoot)
        );
        assert_eq!(DeletionPolicy::parse("destroy"), None);
    }
}
