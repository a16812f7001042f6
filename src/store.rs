//! Set-based rewrites of the closure relation.
//!
//! Every statement here touches whole sets of `(ancestor, descendant, distance)`
//! rows at once. Callers that chain several of them wrap the chain in a
//! [`LockedTransaction`](crate::lock::LockedTransaction).

use std::fmt::Debug;

use sea_orm::{ConnectionTrait, DbBackend, QueryResult, Statement, TryGetable, Value};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ClosureTableConfig;
use crate::error::ClosureTableError;

/// One row of the closure relation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClosureRow<K> {
    pub ancestor: K,
    pub descendant: K,
    pub distance: i32,
}

/// Which side of a node's closure rows [`ClosureStore::detach_self`] removes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DetachScope {
    /// Rows where the node is the descendant (its ancestor chain and self-row).
    Ancestor,
    /// Rows where the node is the ancestor (its subtree links and self-row).
    Descendant,
    Both,
}

/// Quoted identifiers derived from a validated [`ClosureTableConfig`].
#[derive(Clone, Debug)]
pub(crate) struct SqlNames {
    pub closure: String,
    pub ancestor: String,
    pub descendant: String,
    pub distance: String,
    pub entity: String,
    pub key: String,
    pub parent: String,
    pub soft_delete: Option<String>,
    pub order: Option<String>,
}

impl SqlNames {
    pub(crate) fn new(config: &ClosureTableConfig) -> Self {
        use crate::config::OrderStrategy;

        Self {
            closure: quote_ident(config.closure_table()),
            ancestor: quote_ident(config.ancestor_column()),
            descendant: quote_ident(config.descendant_column()),
            distance: quote_ident(config.distance_column()),
            entity: quote_ident(config.entity_table()),
            key: quote_ident(config.key_column()),
            parent: quote_ident(config.parent_column()),
            soft_delete: config.soft_delete_column().map(quote_ident),
            order: match config.order_strategy() {
                Some(OrderStrategy::NumericColumn { column }) => Some(quote_ident(column)),
                _ => None,
            },
        }
    }
}

/// Low-level closure relation operations bound to one table/column configuration.
#[derive(Clone, Debug)]
pub struct ClosureStore {
    config: ClosureTableConfig,
    names: SqlNames,
}

impl ClosureStore {
    pub fn new(config: ClosureTableConfig) -> Result<Self, ClosureTableError> {
        config.validate()?;
        let names = SqlNames::new(&config);
        Ok(Self { config, names })
    }

    pub fn config(&self) -> &ClosureTableConfig {
        &self.config
    }

    pub(crate) fn names(&self) -> &SqlNames {
        &self.names
    }

    /// Link `node` under `parent` and give it its self-row, in one statement.
    ///
    /// Every row `(a, parent, d)` is copied as `(a, node, d + 1)` and
    /// `(node, node, 0)` is added. Without a parent only the self-row is written.
    pub async fn insert_self_and_ancestors<C, K>(
        &self,
        conn: &C,
        node: &K,
        parent: Option<&K>,
    ) -> Result<u64, ClosureTableError>
    where
        C: ConnectionTrait,
        K: Clone + Debug + Into<Value>,
    {
        let backend = supported_backend(conn)?;
        let n = &self.names;

        let statement = match parent {
            Some(parent) => {
                if !self.has_self_row(conn, parent).await? {
                    return Err(ClosureTableError::not_a_node(parent));
                }
                let sql = format!(
                    "INSERT INTO {t} ({a}, {d}, {x}) \
                     SELECT tbl.{a}, {p1}, tbl.{x} + 1 FROM {t} AS tbl WHERE tbl.{d} = {p2} \
                     UNION \
                     SELECT {p1}, {p1}, 0",
                    t = n.closure,
                    a = n.ancestor,
                    d = n.descendant,
                    x = n.distance,
                    p1 = placeholder(backend, 1),
                    p2 = placeholder(backend, 2),
                );
                Statement::from_sql_and_values(
                    backend,
                    sql,
                    vec![node.clone().into(), parent.clone().into()],
                )
            }
            None => {
                let sql = format!(
                    "INSERT INTO {t} ({a}, {d}, {x}) VALUES ({p1}, {p1}, 0)",
                    t = n.closure,
                    a = n.ancestor,
                    d = n.descendant,
                    x = n.distance,
                    p1 = placeholder(backend, 1),
                );
                Statement::from_sql_and_values(backend, sql, vec![node.clone().into()])
            }
        };

        let rows = conn.execute(statement).await?.rows_affected();
        debug!(
            closure_table = %self.config.closure_table(),
            node = ?node,
            parent = ?parent,
            rows,
            "inserted self and ancestor rows"
        );
        Ok(rows)
    }

    /// Cut the subtree rooted at `node` away from everything above it.
    ///
    /// Rows internal to the subtree (including `node`'s self-row) are kept.
    pub async fn detach_from_ancestors<C, K>(
        &self,
        conn: &C,
        node: &K,
    ) -> Result<u64, ClosureTableError>
    where
        C: ConnectionTrait,
        K: Clone + Debug + Into<Value>,
    {
        let backend = supported_backend(conn)?;
        if !self.has_self_row(conn, node).await? {
            return Err(ClosureTableError::not_a_node(node));
        }

        let n = &self.names;
        let sql = format!(
            "DELETE FROM {t} \
             WHERE {d} IN (SELECT sub_d FROM (SELECT {d} AS sub_d FROM {t} WHERE {a} = {p1}) AS dct) \
             AND {a} IN (SELECT sup_a FROM (SELECT {a} AS sup_a FROM {t} WHERE {d} = {p1} AND {a} <> {p1}) AS act)",
            t = n.closure,
            a = n.ancestor,
            d = n.descendant,
            p1 = placeholder(backend, 1),
        );
        let rows = conn
            .execute(Statement::from_sql_and_values(
                backend,
                sql,
                vec![node.clone().into()],
            ))
            .await?
            .rows_affected();

        debug!(closure_table = %self.config.closure_table(), node = ?node, rows, "detached subtree from ancestors");
        Ok(rows)
    }

    /// Link the subtree rooted at `node` below `parent`.
    ///
    /// Cross-joins `{parent} ∪ ancestors(parent)` with `{node} ∪ descendants(node)`.
    /// A `None` parent leaves the subtree as a root and writes nothing.
    pub async fn attach_subtree_to<C, K>(
        &self,
        conn: &C,
        node: &K,
        parent: Option<&K>,
    ) -> Result<u64, ClosureTableError>
    where
        C: ConnectionTrait,
        K: Clone + Debug + Into<Value>,
    {
        let backend = supported_backend(conn)?;
        let Some(parent) = parent else {
            return Ok(0);
        };
        if !self.has_self_row(conn, node).await? {
            return Err(ClosureTableError::not_a_node(node));
        }
        if !self.has_self_row(conn, parent).await? {
            return Err(ClosureTableError::not_a_node(parent));
        }

        let n = &self.names;
        let sql = format!(
            "INSERT INTO {t} ({a}, {d}, {x}) \
             SELECT supertbl.{a}, subtbl.{d}, supertbl.{x} + subtbl.{x} + 1 \
             FROM {t} AS supertbl \
             JOIN {t} AS subtbl ON subtbl.{a} = {p1} \
             WHERE supertbl.{d} = {p2}",
            t = n.closure,
            a = n.ancestor,
            d = n.descendant,
            x = n.distance,
            p1 = placeholder(backend, 1),
            p2 = placeholder(backend, 2),
        );
        let rows = conn
            .execute(Statement::from_sql_and_values(
                backend,
                sql,
                vec![node.clone().into(), parent.clone().into()],
            ))
            .await?
            .rows_affected();

        debug!(
            closure_table = %self.config.closure_table(),
            node = ?node,
            parent = ?parent,
            rows,
            "attached subtree"
        );
        Ok(rows)
    }

    /// Remove every row whose descendant lies in the subtree rooted at `node`.
    pub async fn delete_subtree<C, K>(&self, conn: &C, node: &K) -> Result<u64, ClosureTableError>
    where
        C: ConnectionTrait,
        K: Clone + Debug + Into<Value>,
    {
        let backend = supported_backend(conn)?;
        let n = &self.names;
        let sql = format!(
            "DELETE FROM {t} \
             WHERE {d} IN (SELECT sub_d FROM (SELECT {d} AS sub_d FROM {t} WHERE {a} = {p1}) AS dct)",
            t = n.closure,
            a = n.ancestor,
            d = n.descendant,
            p1 = placeholder(backend, 1),
        );
        let rows = conn
            .execute(Statement::from_sql_and_values(
                backend,
                sql,
                vec![node.clone().into()],
            ))
            .await?
            .rows_affected();

        debug!(closure_table = %self.config.closure_table(), node = ?node, rows, "deleted subtree rows");
        Ok(rows)
    }

    /// Remove rows touching `node` on the side(s) named by `scope`.
    pub async fn detach_self<C, K>(
        &self,
        conn: &C,
        node: &K,
        scope: DetachScope,
    ) -> Result<u64, ClosureTableError>
    where
        C: ConnectionTrait,
        K: Clone + Debug + Into<Value>,
    {
        let backend = supported_backend(conn)?;
        let n = &self.names;
        let p1 = placeholder(backend, 1);
        let predicate = match scope {
            DetachScope::Ancestor => format!("{} = {p1}", n.descendant),
            DetachScope::Descendant => format!("{} = {p1}", n.ancestor),
            DetachScope::Both => format!("{} = {p1} OR {} = {p1}", n.descendant, n.ancestor),
        };
        let sql = format!("DELETE FROM {} WHERE {predicate}", n.closure);
        let rows = conn
            .execute(Statement::from_sql_and_values(
                backend,
                sql,
                vec![node.clone().into()],
            ))
            .await?
            .rows_affected();

        debug!(closure_table = %self.config.closure_table(), node = ?node, ?scope, rows, "detached node rows");
        Ok(rows)
    }

    /// Delete closure rows that reference entities which no longer exist
    /// (or are soft-deleted, when a soft-delete column is configured).
    pub async fn prune_orphans<C>(&self, conn: &C) -> Result<u64, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        let backend = supported_backend(conn)?;
        let n = &self.names;
        let soft_deleted = match &n.soft_delete {
            Some(column) => format!(" OR e.{column} IS NOT NULL"),
            None => String::new(),
        };
        let sql = format!(
            "DELETE FROM {t} \
             WHERE {d} IN (SELECT gone FROM (\
                 SELECT c.{d} AS gone FROM {t} AS c LEFT JOIN {e} AS e ON c.{d} = e.{k} \
                 WHERE e.{k} IS NULL{soft_deleted}) AS dct) \
             OR {a} IN (SELECT gone FROM (\
                 SELECT c.{a} AS gone FROM {t} AS c LEFT JOIN {e} AS e ON c.{a} = e.{k} \
                 WHERE e.{k} IS NULL{soft_deleted}) AS act)",
            t = n.closure,
            a = n.ancestor,
            d = n.descendant,
            e = n.entity,
            k = n.key,
        );
        let rows = conn
            .execute(Statement::from_string(backend, sql))
            .await?
            .rows_affected();

        debug!(closure_table = %self.config.closure_table(), rows, "pruned orphan rows");
        Ok(rows)
    }

    /// Whether `(node, node, 0)` exists.
    pub async fn has_self_row<C, K>(&self, conn: &C, node: &K) -> Result<bool, ClosureTableError>
    where
        C: ConnectionTrait,
        K: Clone + Into<Value>,
    {
        let backend = supported_backend(conn)?;
        let n = &self.names;
        let sql = format!(
            "SELECT COUNT(*) AS row_count FROM {t} WHERE {a} = {p1} AND {d} = {p1} AND {x} = 0",
            t = n.closure,
            a = n.ancestor,
            d = n.descendant,
            x = n.distance,
            p1 = placeholder(backend, 1),
        );
        self.count(conn, backend, sql, node).await.map(|count| count > 0)
    }

    /// Whether any row mentions `node` as ancestor or descendant.
    pub async fn has_any_row<C, K>(&self, conn: &C, node: &K) -> Result<bool, ClosureTableError>
    where
        C: ConnectionTrait,
        K: Clone + Into<Value>,
    {
        let backend = supported_backend(conn)?;
        let n = &self.names;
        let sql = format!(
            "SELECT COUNT(*) AS row_count FROM {t} WHERE {a} = {p1} OR {d} = {p1}",
            t = n.closure,
            a = n.ancestor,
            d = n.descendant,
            p1 = placeholder(backend, 1),
        );
        self.count(conn, backend, sql, node).await.map(|count| count > 0)
    }

    /// Ancestor keys of `node`, root first (distance descending).
    pub async fn ancestor_keys<C, K>(
        &self,
        conn: &C,
        node: &K,
        with_self: bool,
    ) -> Result<Vec<K>, ClosureTableError>
    where
        C: ConnectionTrait,
        K: Clone + Into<Value> + TryGetable,
    {
        let backend = supported_backend(conn)?;
        let n = &self.names;
        let sql = format!(
            "SELECT {a} AS node_key FROM {t} WHERE {d} = {p1} AND {x} {op} 0 ORDER BY {x} DESC",
            t = n.closure,
            a = n.ancestor,
            d = n.descendant,
            x = n.distance,
            op = distance_operator(with_self),
            p1 = placeholder(backend, 1),
        );
        self.keys(conn, backend, sql, node).await
    }

    /// Descendant keys of `node`, nearest first (distance ascending).
    pub async fn descendant_keys<C, K>(
        &self,
        conn: &C,
        node: &K,
        with_self: bool,
    ) -> Result<Vec<K>, ClosureTableError>
    where
        C: ConnectionTrait,
        K: Clone + Into<Value> + TryGetable,
    {
        let backend = supported_backend(conn)?;
        let n = &self.names;
        let sql = format!(
            "SELECT {d} AS node_key FROM {t} WHERE {a} = {p1} AND {x} {op} 0 ORDER BY {x} ASC",
            t = n.closure,
            a = n.ancestor,
            d = n.descendant,
            x = n.distance,
            op = distance_operator(with_self),
            p1 = placeholder(backend, 1),
        );
        self.keys(conn, backend, sql, node).await
    }

    /// Greatest distance from any ancestor to `node`, or `None` when `node`
    /// has no rows at all.
    pub async fn depth<C, K>(&self, conn: &C, node: &K) -> Result<Option<i32>, ClosureTableError>
    where
        C: ConnectionTrait,
        K: Clone + Into<Value>,
    {
        let backend = supported_backend(conn)?;
        let n = &self.names;
        let sql = format!(
            "SELECT MAX({x}) AS max_distance FROM {t} WHERE {d} = {p1}",
            t = n.closure,
            d = n.descendant,
            x = n.distance,
            p1 = placeholder(backend, 1),
        );
        let row = conn
            .query_one(Statement::from_sql_and_values(
                backend,
                sql,
                vec![node.clone().into()],
            ))
            .await?;
        match row {
            Some(row) => Ok(row.try_get::<Option<i32>>("", "max_distance")?),
            None => Ok(None),
        }
    }

    /// Distance recorded for the `(ancestor, descendant)` pair, if any.
    pub async fn distance_between<C, K>(
        &self,
        conn: &C,
        ancestor: &K,
        descendant: &K,
    ) -> Result<Option<i32>, ClosureTableError>
    where
        C: ConnectionTrait,
        K: Clone + Into<Value>,
    {
        let backend = supported_backend(conn)?;
        let n = &self.names;
        let sql = format!(
            "SELECT {x} AS pair_distance FROM {t} WHERE {a} = {p1} AND {d} = {p2}",
            t = n.closure,
            a = n.ancestor,
            d = n.descendant,
            x = n.distance,
            p1 = placeholder(backend, 1),
            p2 = placeholder(backend, 2),
        );
        let row = conn
            .query_one(Statement::from_sql_and_values(
                backend,
                sql,
                vec![ancestor.clone().into(), descendant.clone().into()],
            ))
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<i32>("", "pair_distance")?)),
            None => Ok(None),
        }
    }

    /// Every row of the closure relation.
    pub async fn rows<C, K>(&self, conn: &C) -> Result<Vec<ClosureRow<K>>, ClosureTableError>
    where
        C: ConnectionTrait,
        K: TryGetable,
    {
        let backend = supported_backend(conn)?;
        let n = &self.names;
        let sql = format!(
            "SELECT {a} AS row_ancestor, {d} AS row_descendant, {x} AS row_distance \
             FROM {t} ORDER BY {a}, {x}, {d}",
            t = n.closure,
            a = n.ancestor,
            d = n.descendant,
            x = n.distance,
        );
        let rows = conn.query_all(Statement::from_string(backend, sql)).await?;
        rows.iter().map(read_row).collect()
    }

    async fn count<C, K>(
        &self,
        conn: &C,
        backend: DbBackend,
        sql: String,
        node: &K,
    ) -> Result<i64, ClosureTableError>
    where
        C: ConnectionTrait,
        K: Clone + Into<Value>,
    {
        let row = conn
            .query_one(Statement::from_sql_and_values(
                backend,
                sql,
                vec![node.clone().into()],
            ))
            .await?
            .ok_or_else(|| ClosureTableError::invariant("COUNT(*) returned no row"))?;
        Ok(row.try_get::<i64>("", "row_count")?)
    }

    async fn keys<C, K>(
        &self,
        conn: &C,
        backend: DbBackend,
        sql: String,
        node: &K,
    ) -> Result<Vec<K>, ClosureTableError>
    where
        C: ConnectionTrait,
        K: Clone + Into<Value> + TryGetable,
    {
        let rows = conn
            .query_all(Statement::from_sql_and_values(
                backend,
                sql,
                vec![node.clone().into()],
            ))
            .await?;
        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            keys.push(row.try_get::<K>("", "node_key")?);
        }
        Ok(keys)
    }
}

fn read_row<K: TryGetable>(row: &QueryResult) -> Result<ClosureRow<K>, ClosureTableError> {
    Ok(ClosureRow {
        ancestor: row.try_get("", "row_ancestor")?,
        descendant: row.try_get("", "row_descendant")?,
        distance: row.try_get("", "row_distance")?,
    })
}

pub(crate) fn supported_backend(conn: &impl ConnectionTrait) -> Result<DbBackend, ClosureTableError> {
    match conn.get_database_backend() {
        backend @ (DbBackend::Postgres | DbBackend::Sqlite) => Ok(backend),
        _ => Err(ClosureTableError::UnsupportedBackend),
    }
}

/// Numbered bind parameter; numbered so a value can be referenced twice.
pub(crate) fn placeholder(backend: DbBackend, index: usize) -> String {
    match backend {
        DbBackend::Postgres => format!("${index}"),
        _ => format!("?{index}"),
    }
}

pub(crate) fn distance_operator(with_self: bool) -> &'static str {
    if with_self {
        ">="
    } else {
        ">"
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult, Transaction};

    fn store() -> ClosureStore {
        ClosureStore::new(ClosureTableConfig::new("nodes")).unwrap()
    }

    #[test]
    fn placeholders_follow_backend() {
        assert_eq!(placeholder(DbBackend::Postgres, 2), "$2");
        assert_eq!(placeholder(DbBackend::Sqlite, 2), "?2");
        assert_eq!(quote_ident("node_closure"), "\"node_closure\"");
    }

    #[tokio::test]
    async fn rejects_mysql_connections() {
        let db = MockDatabase::new(DatabaseBackend::MySql).into_connection();
        let err = store().delete_subtree(&db, &1).await.unwrap_err();
        assert!(matches!(err, ClosureTableError::UnsupportedBackend));
    }

    #[tokio::test]
    async fn detach_self_scopes_issue_expected_statements() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([
                MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 3,
                },
                MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 1,
                },
            ])
            .into_connection();

        let store = store();
        let removed = store
            .detach_self(&db, &5, DetachScope::Ancestor)
            .await
            .unwrap();
        assert_eq!(removed, 3);
        store
            .detach_self(&db, &5, DetachScope::Both)
            .await
            .unwrap();

        assert_eq!(
            db.into_transaction_log(),
            [
                Transaction::from_sql_and_values(
                    DatabaseBackend::Postgres,
                    r#"DELETE FROM "nodes_closure" WHERE "descendant" = $1"#,
                    [5.into()],
                ),
                Transaction::from_sql_and_values(
                    DatabaseBackend::Postgres,
                    r#"DELETE FROM "nodes_closure" WHERE "descendant" = $1 OR "ancestor" = $1"#,
                    [5.into()],
                ),
            ]
        );
    }
}
