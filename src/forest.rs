//! Flat rows to nested forests.
//!
//! Linking is done with an explicit id index and index lists, then the nested
//! structure is assembled bottom-up without recursion, so very deep trees do
//! not exhaust the stack while being built.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::ClosureTableConfig;

/// A row together with its nested children.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TreeNode<T> {
    pub item: T,
    pub children: Vec<TreeNode<T>>,
}

impl<T> TreeNode<T> {
    /// Number of nodes in this subtree, including itself.
    pub fn size(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(node.children.iter());
        }
        count
    }
}

impl<T> Drop for TreeNode<T> {
    // The derived drop recurses once per level.
    fn drop(&mut self) {
        let mut stack = std::mem::take(&mut self.children);
        while let Some(mut node) = stack.pop() {
            stack.append(&mut node.children);
        }
    }
}

/// Nest `items` by parent key, preserving input order at every level.
///
/// The first occurrence of a duplicated key is the one children attach to.
/// Items whose parent key does not resolve become roots. Items caught in a
/// parent cycle are promoted to roots at the first cycle member in input order.
pub fn build_nodes<T, K, FK, FP>(items: Vec<T>, key_of: FK, parent_of: FP) -> Vec<TreeNode<T>>
where
    K: Eq + Hash,
    FK: Fn(&T) -> Option<K>,
    FP: Fn(&T) -> Option<K>,
{
    let keys: Vec<Option<K>> = items.iter().map(&key_of).collect();
    let parents: Vec<Option<K>> = items.iter().map(&parent_of).collect();
    let links = Links::resolve(&keys, &parents);
    links.assemble(items, |item, children| TreeNode { item, children })
}

/// Converts flat JSON rows into a nested forest.
#[derive(Clone, Debug)]
pub struct ForestBuilder {
    key: String,
    parent: String,
    children: String,
}

impl Default for ForestBuilder {
    fn default() -> Self {
        Self::new("id", "parent", "children")
    }
}

impl ForestBuilder {
    pub fn new(
        key: impl Into<String>,
        parent: impl Into<String>,
        children: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            parent: parent.into(),
            children: children.into(),
        }
    }

    /// Builder keyed by the configured key, parent and children names.
    pub fn from_config(config: &ClosureTableConfig) -> Self {
        Self::new(
            config.key_column(),
            config.parent_column(),
            config.children_key(),
        )
    }

    /// Nest `rows` into a forest of JSON objects.
    ///
    /// Every returned object carries a children array, empty for leaves.
    /// Numeric and string ids compare by their textual form, so a parent of
    /// `"1"` resolves to the row with id `1`.
    pub fn build(&self, rows: Vec<Map<String, Value>>) -> Vec<Value> {
        let keys: Vec<Option<String>> = rows
            .iter()
            .map(|row| row.get(&self.key).and_then(normalize_key))
            .collect();
        let parents: Vec<Option<String>> = rows
            .iter()
            .map(|row| row.get(&self.parent).and_then(normalize_key))
            .collect();

        Links::resolve(&keys, &parents).assemble(rows, |mut row, children| {
            row.insert(self.children.clone(), Value::Array(children));
            Value::Object(row)
        })
    }

    /// Like [`build`](Self::build) but returns only the first root.
    pub fn build_single(&self, rows: Vec<Map<String, Value>>) -> Option<Value> {
        self.build(rows).into_iter().next()
    }
}

fn normalize_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Resolved parent/child index lists for a batch of rows.
struct Links {
    roots: Vec<usize>,
    children: Vec<Vec<usize>>,
}

impl Links {
    fn resolve<K: Eq + Hash>(keys: &[Option<K>], parents: &[Option<K>]) -> Self {
        let mut index: HashMap<&K, usize> = HashMap::with_capacity(keys.len());
        for (position, key) in keys.iter().enumerate() {
            if let Some(key) = key {
                index.entry(key).or_insert(position);
            }
        }

        let mut parent_of: Vec<Option<usize>> = Vec::with_capacity(keys.len());
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); keys.len()];
        let mut roots = Vec::new();
        for (position, parent) in parents.iter().enumerate() {
            match parent.as_ref().and_then(|key| index.get(key)) {
                Some(&parent_position) => {
                    children[parent_position].push(position);
                    parent_of.push(Some(parent_position));
                }
                None => {
                    roots.push(position);
                    parent_of.push(None);
                }
            }
        }

        let mut links = Self { roots, children };
        links.break_cycles(&parent_of);
        links
    }

    /// Promote the first unreachable member of each parent cycle to a root.
    fn break_cycles(&mut self, parent_of: &[Option<usize>]) {
        let mut reached = vec![false; parent_of.len()];
        let mut queue: VecDeque<usize> = self.roots.iter().copied().collect();
        self.mark(&mut reached, &mut queue);

        for position in 0..parent_of.len() {
            if reached[position] {
                continue;
            }
            if let Some(parent) = parent_of[position] {
                self.children[parent].retain(|&child| child != position);
            }
            self.roots.push(position);
            queue.push_back(position);
            self.mark(&mut reached, &mut queue);
        }
    }

    fn mark(&self, reached: &mut [bool], queue: &mut VecDeque<usize>) {
        while let Some(position) = queue.pop_front() {
            if reached[position] {
                continue;
            }
            reached[position] = true;
            queue.extend(self.children[position].iter().copied());
        }
    }

    /// Build every node after its children, using `make` to join an item
    /// with its finished children.
    fn assemble<T, N>(self, items: Vec<T>, mut make: impl FnMut(T, Vec<N>) -> N) -> Vec<N> {
        // Breadth-first order from the roots; walking it backwards finishes
        // every child before its parent.
        let mut order = Vec::with_capacity(items.len());
        let mut queue: VecDeque<usize> = self.roots.iter().copied().collect();
        while let Some(position) = queue.pop_front() {
            order.push(position);
            queue.extend(self.children[position].iter().copied());
        }

        let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
        let mut built: Vec<Option<N>> = Vec::with_capacity(slots.len());
        built.resize_with(slots.len(), || None);

        for &position in order.iter().rev() {
            let Some(item) = slots[position].take() else {
                continue;
            };
            let children = self.children[position]
                .iter()
                .filter_map(|&child| built[child].take())
                .collect();
            built[position] = Some(make(item, children));
        }

        self.roots
            .iter()
            .filter_map(|&root| built[root].take())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(value: Value) -> Vec<Map<String, Value>> {
        match value {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    #[test]
    fn nests_children_under_parents() {
        let forest = ForestBuilder::default().build(rows(json!([
            {"id": 1, "parent": null},
            {"id": 2, "parent": 1},
            {"id": 3, "parent": 1},
        ])));

        assert_eq!(
            Value::Array(forest),
            json!([
                {"id": 1, "parent": null, "children": [
                    {"id": 2, "parent": 1, "children": []},
                    {"id": 3, "parent": 1, "children": []},
                ]},
            ])
        );
    }

    #[test]
    fn empty_input_yields_empty_forest() {
        assert!(ForestBuilder::default().build(Vec::new()).is_empty());
        assert!(ForestBuilder::default().build_single(Vec::new()).is_none());
    }

    #[test]
    fn unresolved_parents_become_roots_in_input_order() {
        let forest = ForestBuilder::new("key", "up", "kids").build(rows(json!([
            {"key": "b", "up": "missing"},
            {"key": "a"},
            {"key": "c", "up": "a"},
        ])));

        assert_eq!(
            Value::Array(forest),
            json!([
                {"key": "b", "up": "missing", "kids": []},
                {"key": "a", "kids": [{"key": "c", "up": "a", "kids": []}]},
            ])
        );
    }

    #[test]
    fn numeric_and_string_ids_match() {
        let forest = ForestBuilder::default().build(rows(json!([
            {"id": 1},
            {"id": 2, "parent": "1"},
        ])));
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0]["children"][0]["id"], json!(2));
    }

    #[test]
    fn duplicate_ids_attach_to_first_occurrence() {
        let forest = ForestBuilder::default().build(rows(json!([
            {"id": 1, "tag": "first"},
            {"id": 1, "tag": "second"},
            {"id": 2, "parent": 1},
        ])));

        assert_eq!(forest.len(), 2);
        assert_eq!(forest[0]["tag"], json!("first"));
        assert_eq!(forest[0]["children"][0]["id"], json!(2));
        assert_eq!(forest[1]["children"], json!([]));
    }

    #[test]
    fn cycles_do_not_drop_rows() {
        let nodes = build_nodes(
            vec![(1, Some(2)), (2, Some(1)), (3, Some(3))],
            |row: &(i32, Option<i32>)| Some(row.0),
            |row| row.1,
        );

        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].item.0, 1);
        assert_eq!(nodes[0].children[0].item.0, 2);
        assert_eq!(nodes[1].item.0, 3);
        assert!(nodes[1].children.is_empty());
        assert_eq!(nodes.iter().map(TreeNode::size).sum::<usize>(), 3);
    }

    #[test]
    fn deep_chains_build_without_recursion() {
        let depth = 50_000;
        let items: Vec<(u32, Option<u32>)> = (0..depth)
            .map(|i| (i, if i == 0 { None } else { Some(i - 1) }))
            .collect();
        let nodes = build_nodes(items, |row| Some(row.0), |row| row.1);

        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].size(), depth as usize);
    }

    #[test]
    fn deep_trees_drop_on_a_small_stack() {
        let handle = std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(|| {
                let items: Vec<(u32, Option<u32>)> = (0..200_000)
                    .map(|i| (i, if i == 0 { None } else { Some(i - 1) }))
                    .collect();
                let nodes = build_nodes(items, |row| Some(row.0), |row| row.1);
                nodes[0].size()
            })
            .unwrap();
        assert_eq!(handle.join().unwrap(), 200_000);
    }
}
