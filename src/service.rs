use std::collections::{HashSet, VecDeque};
use std::marker::PhantomData;

use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbBackend, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Select, Statement, TransactionTrait, Value,
};
use tracing::{info, instrument, warn};

use crate::config::{ClosureTableConfig, DeletionPolicy, OrderStrategy};
use crate::error::ClosureTableError;
use crate::forest::{build_nodes, TreeNode};
use crate::integrity::{find_violations, Violation};
use crate::lock::LockedTransaction;
use crate::store::{
    distance_operator, placeholder, quote_ident, supported_backend, ClosureStore, DetachScope,
    SqlNames,
};
use crate::traits::ClosureNode;

/// Outcome of [`HierarchyService::perfect_tree`].
///
/// Each node is repaired in its own transaction, so one failure does not
/// undo the nodes repaired before it.
#[derive(Debug)]
pub struct PerfectTreeReport<K> {
    pub repaired: Vec<K>,
    pub failed: Vec<(K, ClosureTableError)>,
}

impl<K> Default for PerfectTreeReport<K> {
    fn default() -> Self {
        Self {
            repaired: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<K> PerfectTreeReport<K> {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn merge(&mut self, other: PerfectTreeReport<K>) {
        self.repaired.extend(other.repaired);
        self.failed.extend(other.failed);
    }
}

/// Node-level hierarchy operations for a [`ClosureNode`] model.
///
/// The service keeps the closure table in step with parent pointers. Host
/// code either calls the lifecycle entry points (`on_created`,
/// `on_parent_changed`, `on_deleting`) after its own writes, or lets the
/// service perform the writes (`create_child`, `move_to`, `delete`, ...).
#[derive(Debug)]
pub struct HierarchyService<M>
where
    M: ClosureNode,
{
    store: ClosureStore,
    _marker: PhantomData<M>,
}

impl<M> Clone for HierarchyService<M>
where
    M: ClosureNode,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _marker: PhantomData,
        }
    }
}

impl<M> HierarchyService<M>
where
    M: ClosureNode,
{
    /// Service bound to the model's own configuration.
    pub fn new() -> Result<Self, ClosureTableError> {
        Self::with_config(M::closure_config().clone())
    }

    pub fn with_config(config: ClosureTableConfig) -> Result<Self, ClosureTableError> {
        Ok(Self {
            store: ClosureStore::new(config)?,
            _marker: PhantomData,
        })
    }

    pub fn store(&self) -> &ClosureStore {
        &self.store
    }

    pub fn config(&self) -> &ClosureTableConfig {
        self.store.config()
    }

    fn names(&self) -> &SqlNames {
        self.store.names()
    }

    async fn begin<C>(&self, db: &C) -> Result<LockedTransaction, ClosureTableError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        supported_backend(db)?;
        LockedTransaction::acquire(self.config().advisory_lock_strategy(), db).await
    }

    /// Register a freshly inserted entity: self-row plus its parent's ancestor chain.
    #[instrument(skip_all, fields(node = ?node.key()))]
    pub async fn on_created<C>(&self, db: &C, node: &M) -> Result<(), ClosureTableError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let guard = self.begin(db).await?;
        let result = self
            .store
            .insert_self_and_ancestors(guard.connection(), &node.key(), node.parent_key().as_ref())
            .await
            .map(|_| ());
        guard.finish(result).await
    }

    /// Rewrite the ancestor links of `node` after its parent pointer was
    /// changed by the host. `node` must carry the new parent key.
    #[instrument(skip_all, fields(node = ?node.key(), parent = ?node.parent_key()))]
    pub async fn on_parent_changed<C>(&self, db: &C, node: &M) -> Result<(), ClosureTableError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let target = node.parent_key();
        self.relink(db, node, target.as_ref(), false).await.map(|_| ())
    }

    /// Closure maintenance for an entity the host is about to delete.
    ///
    /// With [`DeletionPolicy::ReparentChildrenToRoot`] the direct children get
    /// a null parent and become roots of their own subtrees. With
    /// [`DeletionPolicy::CascadeSubtree`] every row below the node is removed.
    #[instrument(skip_all, fields(node = ?node.key()))]
    pub async fn on_deleting<C>(&self, db: &C, node: &M) -> Result<(), ClosureTableError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let guard = self.begin(db).await?;
        let result = self.on_deleting_on(guard.connection(), node).await;
        guard.finish(result).await
    }

    /// Re-register a soft-deleted entity the host has restored.
    ///
    /// The node's ancestor rows are rebuilt from its parent pointer, then its
    /// descendants are relinked through it, since pruning may have dropped
    /// the rows that ran through the node while it was deleted.
    #[instrument(skip_all, fields(node = ?node.key()))]
    pub async fn on_restored<C>(
        &self,
        db: &C,
        node: &M,
    ) -> Result<PerfectTreeReport<M::Id>, ClosureTableError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        self.perfect_node(db, node).await?;
        self.perfect_tree(db, node).await
    }

    /// Closure maintenance plus deletion of the entity row(s), in one transaction.
    ///
    /// Under the cascade policy the entities of the whole subtree are deleted.
    #[instrument(skip_all, fields(node = ?node.key()))]
    pub async fn delete<C>(&self, db: &C, node: &M) -> Result<u64, ClosureTableError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let guard = self.begin(db).await?;
        let result = self.delete_on(guard.connection(), node).await;
        guard.finish(result).await
    }

    /// Insert `active` and register it under whatever parent it carries.
    #[instrument(skip_all)]
    pub async fn create<C>(&self, db: &C, active: M::ActiveModel) -> Result<M, ClosureTableError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let guard = self.begin(db).await?;
        let result = self.create_on(guard.connection(), active).await;
        guard.finish(result).await
    }

    /// Insert `active` as a child of `parent`.
    #[instrument(skip_all, fields(parent = ?parent.key()))]
    pub async fn create_child<C>(
        &self,
        db: &C,
        parent: &M,
        mut active: M::ActiveModel,
    ) -> Result<M, ClosureTableError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let parent_key = parent.key();
        self.ensure_node(db, &parent_key).await?;
        M::set_parent_key(&mut active, Some(parent_key));
        self.create(db, active).await
    }

    /// Insert `active` next to `node`, under the same parent (or as a root).
    #[instrument(skip_all, fields(node = ?node.key()))]
    pub async fn create_sibling<C>(
        &self,
        db: &C,
        node: &M,
        mut active: M::ActiveModel,
    ) -> Result<M, ClosureTableError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        self.ensure_node(db, &node.key()).await?;
        M::set_parent_key(&mut active, node.parent_key());
        self.create(db, active).await
    }

    /// Move the existing node `child` below `parent`.
    #[instrument(skip_all, fields(parent = ?parent.key(), child = ?child))]
    pub async fn add_child<C>(
        &self,
        db: &C,
        parent: &M,
        child: &M::Id,
    ) -> Result<M, ClosureTableError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let parent_key = parent.key();
        self.ensure_node(db, &parent_key).await?;
        let child_model = self.find(db, child).await?;

        let lineage = self.store.ancestor_keys(db, &parent_key, true).await?;
        if lineage.contains(child) {
            return Err(ClosureTableError::cycle(child, &parent_key));
        }

        self.move_to(db, &child_model, Some(&parent_key)).await
    }

    /// Move the existing node `sibling` next to `node`.
    ///
    /// When `node` is a root, `sibling` becomes a root as well.
    #[instrument(skip_all, fields(node = ?node.key(), sibling = ?sibling))]
    pub async fn add_sibling<C>(
        &self,
        db: &C,
        node: &M,
        sibling: &M::Id,
    ) -> Result<M, ClosureTableError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        match node.parent_key() {
            Some(parent_key) => {
                let parent = self.find(db, &parent_key).await?;
                self.add_child(db, &parent, sibling).await
            }
            None => {
                let sibling = self.find(db, sibling).await?;
                self.make_root(db, &sibling).await
            }
        }
    }

    /// Reparent `node` (with its whole subtree) under `target`, or make it a
    /// root when `target` is `None`. Writes the entity's parent column too.
    ///
    /// Fails with [`ClosureTableError::CycleDetected`] when `target` lies in
    /// the subtree of `node`.
    #[instrument(skip_all, fields(node = ?node.key(), target = ?target))]
    pub async fn move_to<C>(
        &self,
        db: &C,
        node: &M,
        target: Option<&M::Id>,
    ) -> Result<M, ClosureTableError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        self.relink(db, node, target, true).await
    }

    /// Detach `node` from its ancestors, keeping its subtree intact.
    pub async fn make_root<C>(&self, db: &C, node: &M) -> Result<M, ClosureTableError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        if node.parent_key().is_none() {
            return Ok(node.clone());
        }
        self.move_to(db, node, None).await
    }

    /// Rebuild the ancestor rows of `node` from its parent pointer alone.
    #[instrument(skip_all, fields(node = ?node.key()))]
    pub async fn perfect_node<C>(&self, db: &C, node: &M) -> Result<(), ClosureTableError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        self.perfect_key(db, &node.key(), node.parent_key().as_ref())
            .await
    }

    /// Apply [`perfect_node`](Self::perfect_node) to every descendant of
    /// `node`, parents before children, following parent pointers.
    #[instrument(skip_all, fields(node = ?node.key()))]
    pub async fn perfect_tree<C>(
        &self,
        db: &C,
        node: &M,
    ) -> Result<PerfectTreeReport<M::Id>, ClosureTableError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        supported_backend(db)?;
        let mut report = PerfectTreeReport::default();
        let mut seen: HashSet<M::Id> = HashSet::new();
        seen.insert(node.key());

        let mut queue: VecDeque<M> = self.children(db, node).await?.into();
        while let Some(current) = queue.pop_front() {
            let key = current.key();
            if !seen.insert(key.clone()) {
                continue;
            }

            match self.perfect_node(db, &current).await {
                Ok(()) => report.repaired.push(key.clone()),
                Err(err) => {
                    warn!(node = ?key, error = %err, "failed to repair node");
                    report.failed.push((key.clone(), err));
                }
            }

            match self.children(db, &current).await {
                Ok(children) => queue.extend(children),
                Err(err) => {
                    warn!(node = ?key, error = %err, "failed to load children for repair");
                    report.failed.push((key, err));
                }
            }
        }

        info!(
            repaired = report.repaired.len(),
            failed = report.failed.len(),
            "repaired subtree"
        );
        Ok(report)
    }

    /// Prune orphan rows, then rebuild every tree from its root.
    ///
    /// Isolated entities that hang off a root by parent pointer are attached
    /// along the way.
    #[instrument(skip_all)]
    pub async fn perfect_all<C>(&self, db: &C) -> Result<PerfectTreeReport<M::Id>, ClosureTableError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        self.prune_orphans(db).await?;

        let mut report = PerfectTreeReport::default();
        for root in self.roots(db).await? {
            let key = root.key();
            match self.perfect_node(db, &root).await {
                Ok(()) => report.repaired.push(key),
                Err(err) => {
                    warn!(node = ?key, error = %err, "failed to repair root");
                    report.failed.push((key, err));
                    continue;
                }
            }
            report.merge(self.perfect_tree(db, &root).await?);
        }
        Ok(report)
    }

    /// Remove closure rows that reference missing or soft-deleted entities.
    #[instrument(skip_all)]
    pub async fn prune_orphans<C>(&self, db: &C) -> Result<u64, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        let removed = self.store.prune_orphans(db).await?;
        info!(removed, "pruned orphan closure rows");
        Ok(removed)
    }

    /// Compare the closure table with the parent pointers and list every
    /// broken invariant.
    pub async fn verify<C>(&self, db: &C) -> Result<Vec<Violation<M::Id>>, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        supported_backend(db)?;
        let rows = self.store.rows::<_, M::Id>(db).await?;
        let parents: Vec<(M::Id, Option<M::Id>)> = M::Entity::find()
            .all(db)
            .await?
            .iter()
            .map(|model| (model.key(), model.parent_key()))
            .collect();
        Ok(find_violations(&rows, &parents))
    }

    /// Look up an entity by key.
    pub async fn find<C>(&self, db: &C, key: &M::Id) -> Result<M, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        M::Entity::find()
            .filter(M::key_column().eq(M::key_to_value(key)))
            .one(db)
            .await?
            .ok_or_else(|| ClosureTableError::not_found(key))
    }

    /// Ancestors of `node`, root first.
    pub async fn ancestors<C>(
        &self,
        db: &C,
        node: &M,
        with_self: bool,
    ) -> Result<Vec<M>, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        let backend = supported_backend(db)?;
        let n = self.names();
        let sql = format!(
            "SELECT e.* FROM {e} AS e JOIN {t} AS c ON c.{a} = e.{k} \
             WHERE c.{d} = {p1} AND c.{x} {op} 0{live} ORDER BY c.{x} DESC",
            e = n.entity,
            t = n.closure,
            a = n.ancestor,
            d = n.descendant,
            x = n.distance,
            k = n.key,
            live = self.live_clause(),
            op = distance_operator(with_self),
            p1 = placeholder(backend, 1),
        );
        self.query_models(db, backend, sql, vec![M::key_to_value(&node.key())])
            .await
    }

    /// Descendants of `node`, nearest first.
    pub async fn descendants<C>(
        &self,
        db: &C,
        node: &M,
        with_self: bool,
    ) -> Result<Vec<M>, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        let backend = supported_backend(db)?;
        let n = self.names();
        let sql = format!(
            "SELECT e.* FROM {e} AS e JOIN {t} AS c ON c.{d} = e.{k} \
             WHERE c.{a} = {p1} AND c.{x} {op} 0{live} ORDER BY c.{x} ASC, {order}",
            e = n.entity,
            t = n.closure,
            a = n.ancestor,
            d = n.descendant,
            x = n.distance,
            k = n.key,
            live = self.live_clause(),
            op = distance_operator(with_self),
            p1 = placeholder(backend, 1),
            order = self.entity_order(),
        );
        self.query_models(db, backend, sql, vec![M::key_to_value(&node.key())])
            .await
    }

    /// Direct children, read from the parent column rather than the closure table.
    pub async fn children<C>(&self, db: &C, node: &M) -> Result<Vec<M>, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        supported_backend(db)?;
        let query = M::Entity::find().filter(M::parent_column().eq(M::key_to_value(&node.key())));
        Ok(self.ordered(self.live(query)).all(db).await?)
    }

    pub async fn parent<C>(&self, db: &C, node: &M) -> Result<Option<M>, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        supported_backend(db)?;
        match node.parent_key() {
            Some(parent_key) => {
                let query = M::Entity::find()
                    .filter(M::key_column().eq(M::key_to_value(&parent_key)));
                let parent = self.live(query).one(db).await?;
                Ok(parent)
            }
            None => Ok(None),
        }
    }

    /// Every node with a null parent.
    pub async fn roots<C>(&self, db: &C) -> Result<Vec<M>, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        supported_backend(db)?;
        let query = M::Entity::find().filter(M::parent_column().is_null());
        Ok(self.ordered(self.live(query)).all(db).await?)
    }

    /// Root of the tree containing `node`; `node` itself when it is a root.
    pub async fn root<C>(&self, db: &C, node: &M) -> Result<Option<M>, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        let backend = supported_backend(db)?;
        if node.parent_key().is_none() {
            return Ok(Some(node.clone()));
        }

        let n = self.names();
        let sql = format!(
            "SELECT e.* FROM {e} AS e JOIN {t} AS c ON c.{a} = e.{k} \
             WHERE c.{d} = {p1} AND c.{x} > 0 AND e.{parent} IS NULL{live} \
             ORDER BY c.{x} DESC",
            e = n.entity,
            t = n.closure,
            a = n.ancestor,
            d = n.descendant,
            x = n.distance,
            k = n.key,
            live = self.live_clause(),
            parent = n.parent,
            p1 = placeholder(backend, 1),
        );
        let root = M::Entity::find()
            .from_raw_sql(Statement::from_sql_and_values(
                backend,
                sql,
                vec![M::key_to_value(&node.key())],
            ))
            .one(db)
            .await?;
        Ok(root)
    }

    /// Nodes sharing the parent of `node`; for a root, the other roots.
    pub async fn siblings<C>(
        &self,
        db: &C,
        node: &M,
        with_self: bool,
    ) -> Result<Vec<M>, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        supported_backend(db)?;
        let mut query = match node.parent_key() {
            Some(parent_key) => {
                M::Entity::find().filter(M::parent_column().eq(M::key_to_value(&parent_key)))
            }
            None => M::Entity::find().filter(M::parent_column().is_null()),
        };
        if !with_self {
            query = query.filter(M::key_column().ne(M::key_to_value(&node.key())));
        }
        Ok(self.ordered(self.live(query)).all(db).await?)
    }

    /// Everything in the same tree as `node` that is outside its subtree.
    pub async fn besides<C>(&self, db: &C, node: &M) -> Result<Vec<M>, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        let backend = supported_backend(db)?;
        let key = node.key();
        let root_key = match self.root(db, node).await? {
            Some(root) if root.key() != key => root.key(),
            _ => return Ok(Vec::new()),
        };

        let n = self.names();
        let sql = format!(
            "SELECT e.* FROM {e} AS e JOIN {t} AS c ON c.{d} = e.{k} \
             WHERE c.{a} = {p1} \
             AND c.{d} NOT IN (SELECT sub.{d} FROM {t} AS sub WHERE sub.{a} = {p2}){live} \
             ORDER BY c.{x} ASC, {order}",
            e = n.entity,
            t = n.closure,
            a = n.ancestor,
            d = n.descendant,
            x = n.distance,
            k = n.key,
            live = self.live_clause(),
            p1 = placeholder(backend, 1),
            p2 = placeholder(backend, 2),
            order = self.entity_order(),
        );
        self.query_models(
            db,
            backend,
            sql,
            vec![M::key_to_value(&root_key), M::key_to_value(&key)],
        )
        .await
    }

    /// Entities with no closure rows at all.
    pub async fn isolated<C>(&self, db: &C) -> Result<Vec<M>, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        let backend = supported_backend(db)?;
        let n = self.names();
        let sql = format!(
            "SELECT e.* FROM {e} AS e LEFT JOIN {t} AS c ON c.{a} = e.{k} \
             WHERE c.{a} IS NULL{live} ORDER BY {order}",
            e = n.entity,
            t = n.closure,
            a = n.ancestor,
            k = n.key,
            live = self.live_clause(),
            order = self.entity_order(),
        );
        self.query_models(db, backend, sql, Vec::new()).await
    }

    pub async fn is_isolated<C>(&self, db: &C, node: &M) -> Result<bool, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        Ok(!self.store.has_any_row(db, &node.key()).await?)
    }

    pub fn is_root(&self, node: &M) -> bool {
        node.parent_key().is_none()
    }

    pub async fn is_leaf<C>(&self, db: &C, node: &M) -> Result<bool, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        supported_backend(db)?;
        let query = M::Entity::find().filter(M::parent_column().eq(M::key_to_value(&node.key())));
        let count = self.live(query).count(db).await?;
        Ok(count == 0)
    }

    /// Hops from the root to `node`; `None` when `node` is not attached.
    pub async fn depth<C>(&self, db: &C, node: &M) -> Result<Option<i32>, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        self.store.depth(db, &node.key()).await
    }

    pub fn is_parent_of(&self, node: &M, other: &M) -> bool {
        other.parent_key().as_ref() == Some(&node.key())
    }

    pub fn is_child_of(&self, node: &M, other: &M) -> bool {
        node.parent_key().as_ref() == Some(&other.key())
    }

    /// Same parent (or both roots), different node.
    pub fn is_sibling_of(&self, node: &M, other: &M) -> bool {
        node.key() != other.key() && node.parent_key() == other.parent_key()
    }

    pub async fn is_ancestor_of<C>(
        &self,
        db: &C,
        node: &M,
        other: &M,
    ) -> Result<bool, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        let distance = self
            .store
            .distance_between(db, &node.key(), &other.key())
            .await?;
        Ok(matches!(distance, Some(d) if d > 0))
    }

    pub async fn is_descendant_of<C>(
        &self,
        db: &C,
        node: &M,
        other: &M,
    ) -> Result<bool, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        self.is_ancestor_of(db, other, node).await
    }

    /// Whether `other` is one of [`besides`](Self::besides) of `node`.
    pub async fn is_beside_of<C>(
        &self,
        db: &C,
        node: &M,
        other: &M,
    ) -> Result<bool, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        let key = node.key();
        let root_key = match self.root(db, node).await? {
            Some(root) if root.key() != key => root.key(),
            _ => return Ok(false),
        };

        let other_key = other.key();
        let in_tree = self
            .store
            .distance_between(db, &root_key, &other_key)
            .await?
            .is_some();
        let in_subtree = self
            .store
            .distance_between(db, &key, &other_key)
            .await?
            .is_some();
        Ok(in_tree && !in_subtree)
    }

    /// The subtree rooted at `node`, nested.
    pub async fn tree<C>(&self, db: &C, node: &M) -> Result<Option<TreeNode<M>>, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        let rows = self.descendants(db, node, true).await?;
        Ok(nest(rows).into_iter().next())
    }

    /// [`besides`](Self::besides) of `node`, nested. Empty for a root.
    pub async fn beside_tree<C>(&self, db: &C, node: &M) -> Result<Vec<TreeNode<M>>, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        let rows = self.besides(db, node).await?;
        Ok(nest(rows))
    }

    async fn ensure_node<C>(&self, db: &C, key: &M::Id) -> Result<(), ClosureTableError>
    where
        C: ConnectionTrait,
    {
        if self.store.has_self_row(db, key).await? {
            Ok(())
        } else {
            Err(ClosureTableError::not_a_node(key))
        }
    }

    /// Validate, then detach and reattach the subtree of `node` in one transaction.
    async fn relink<C>(
        &self,
        db: &C,
        node: &M,
        target: Option<&M::Id>,
        write_parent: bool,
    ) -> Result<M, ClosureTableError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        supported_backend(db)?;
        let key = node.key();
        self.ensure_node(db, &key).await?;

        if let Some(target) = target {
            self.find(db, target).await?;
            self.ensure_node(db, target).await?;
            let subtree = self.store.descendant_keys(db, &key, true).await?;
            if subtree.contains(target) {
                return Err(ClosureTableError::cycle(&key, target));
            }
        }

        let guard = self.begin(db).await?;
        let result = self
            .relink_on(guard.connection(), node, target, write_parent)
            .await;
        guard.finish(result).await
    }

    async fn relink_on<C>(
        &self,
        conn: &C,
        node: &M,
        target: Option<&M::Id>,
        write_parent: bool,
    ) -> Result<M, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        let key = node.key();
        let model = if write_parent {
            let mut active = node.clone().into_active_model();
            M::set_parent_key(&mut active, target.cloned());
            active.update(conn).await?
        } else {
            node.clone()
        };

        self.store.detach_from_ancestors(conn, &key).await?;
        self.store.attach_subtree_to(conn, &key, target).await?;
        Ok(model)
    }

    async fn create_on<C>(&self, conn: &C, active: M::ActiveModel) -> Result<M, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        let model = active.insert(conn).await?;
        self.store
            .insert_self_and_ancestors(conn, &model.key(), model.parent_key().as_ref())
            .await?;
        Ok(model)
    }

    async fn on_deleting_on<C>(&self, conn: &C, node: &M) -> Result<(), ClosureTableError>
    where
        C: ConnectionTrait,
    {
        let key = node.key();
        match self.config().deletion_policy() {
            DeletionPolicy::ReparentChildrenToRoot => {
                let query =
                    M::Entity::find().filter(M::parent_column().eq(M::key_to_value(&key)));
                for child in query.all(conn).await? {
                    let child_key = child.key();
                    let mut active = child.into_active_model();
                    M::set_parent_key(&mut active, None);
                    active.update(conn).await?;
                    if self.store.has_self_row(conn, &child_key).await? {
                        self.store.detach_from_ancestors(conn, &child_key).await?;
                    }
                }
                self.store
                    .detach_self(conn, &key, DetachScope::Both)
                    .await?;
            }
            DeletionPolicy::CascadeSubtree => {
                self.store.delete_subtree(conn, &key).await?;
            }
        }
        Ok(())
    }

    async fn delete_on<C>(&self, conn: &C, node: &M) -> Result<u64, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        let key = node.key();
        let doomed: Vec<Value> = match self.config().deletion_policy() {
            DeletionPolicy::ReparentChildrenToRoot => vec![M::key_to_value(&key)],
            DeletionPolicy::CascadeSubtree => {
                let mut keys = self.store.descendant_keys(conn, &key, true).await?;
                if keys.is_empty() {
                    keys.push(key.clone());
                }
                keys.iter().map(M::key_to_value).collect()
            }
        };

        self.on_deleting_on(conn, node).await?;
        let deleted = M::Entity::delete_many()
            .filter(M::key_column().is_in(doomed))
            .exec(conn)
            .await?
            .rows_affected;
        Ok(deleted)
    }

    async fn perfect_key<C>(
        &self,
        db: &C,
        key: &M::Id,
        parent: Option<&M::Id>,
    ) -> Result<(), ClosureTableError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let guard = self.begin(db).await?;
        let conn = guard.connection();
        let result = async {
            self.store
                .detach_self(conn, key, DetachScope::Ancestor)
                .await?;
            self.store
                .insert_self_and_ancestors(conn, key, parent)
                .await?;
            Ok::<(), ClosureTableError>(())
        }
        .await;
        guard.finish(result).await
    }

    async fn query_models<C>(
        &self,
        db: &C,
        backend: DbBackend,
        sql: String,
        values: Vec<Value>,
    ) -> Result<Vec<M>, ClosureTableError>
    where
        C: ConnectionTrait,
    {
        let models = M::Entity::find()
            .from_raw_sql(Statement::from_sql_and_values(backend, sql, values))
            .all(db)
            .await?;
        Ok(models)
    }

    fn ordered(&self, mut query: Select<M::Entity>) -> Select<M::Entity> {
        if let Some(OrderStrategy::NumericColumn { column }) = self.config().order_strategy() {
            query = query.order_by_asc(Expr::cust(quote_ident(column)));
        }
        query.order_by_asc(M::key_column())
    }

    /// Hide soft-deleted entities when a soft-delete column is configured.
    fn live(&self, query: Select<M::Entity>) -> Select<M::Entity> {
        match &self.names().soft_delete {
            Some(column) => query.filter(Expr::cust(format!("{column} IS NULL"))),
            None => query,
        }
    }

    /// Raw-SQL form of [`live`](Self::live) for queries aliasing the entity as `e`.
    fn live_clause(&self) -> String {
        match &self.names().soft_delete {
            Some(column) => format!(" AND e.{column} IS NULL"),
            None => String::new(),
        }
    }

    fn entity_order(&self) -> String {
        let n = self.names();
        match &n.order {
            Some(column) => format!("e.{column} ASC, e.{} ASC", n.key),
            None => format!("e.{} ASC", n.key),
        }
    }
}

fn nest<M: ClosureNode>(rows: Vec<M>) -> Vec<TreeNode<M>> {
    build_nodes(rows, |model| Some(model.key()), |model| model.parent_key())
}
