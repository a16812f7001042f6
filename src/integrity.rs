//! Offline consistency check of a closure relation against parent pointers.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use serde::Serialize;

use crate::store::ClosureRow;

/// A broken closure invariant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Violation<K> {
    /// An attached node lacks `(n, n, 0)`.
    MissingSelfRow { node: K },
    /// More than one row for the same pair.
    DuplicatePair { ancestor: K, descendant: K },
    /// `(n, n, d)` with `d > 0`.
    SelfAncestry { node: K, distance: i32 },
    /// `(a, m, d1)` and `(m, b, d2)` exist but `(a, b, d1 + d2)` does not.
    MissingPath {
        ancestor: K,
        descendant: K,
        distance: i32,
    },
    /// The distance-1 row disagrees with the node's parent pointer.
    ParentMismatch {
        node: K,
        parent: Option<K>,
        recorded: Option<K>,
    },
}

/// Check `rows` against the closure invariants.
///
/// `parents` lists every entity with its parent pointer. Only nodes that
/// appear in at least one row are considered attached; isolated entities are
/// skipped.
pub fn find_violations<K>(rows: &[ClosureRow<K>], parents: &[(K, Option<K>)]) -> Vec<Violation<K>>
where
    K: Clone + Debug + Eq + Hash,
{
    let mut violations = Vec::new();
    let mut pairs: HashMap<(&K, &K), i32> = HashMap::with_capacity(rows.len());
    let mut attached: HashSet<&K> = HashSet::new();
    let mut by_ancestor: HashMap<&K, Vec<(&K, i32)>> = HashMap::new();
    let mut recorded_parent: HashMap<&K, Vec<&K>> = HashMap::new();

    for row in rows {
        attached.insert(&row.ancestor);
        attached.insert(&row.descendant);

        if pairs
            .insert((&row.ancestor, &row.descendant), row.distance)
            .is_some()
        {
            violations.push(Violation::DuplicatePair {
                ancestor: row.ancestor.clone(),
                descendant: row.descendant.clone(),
            });
            continue;
        }

        if row.ancestor == row.descendant && row.distance != 0 {
            violations.push(Violation::SelfAncestry {
                node: row.ancestor.clone(),
                distance: row.distance,
            });
        }
        if row.distance == 1 {
            recorded_parent
                .entry(&row.descendant)
                .or_default()
                .push(&row.ancestor);
        }
        by_ancestor
            .entry(&row.ancestor)
            .or_default()
            .push((&row.descendant, row.distance));
    }

    for (&(ancestor, descendant), &distance) in &pairs {
        if ancestor == descendant {
            continue;
        }
        let Some(tails) = by_ancestor.get(descendant) else {
            continue;
        };
        for &(tail, tail_distance) in tails {
            if tail == descendant {
                continue;
            }
            let expected = distance + tail_distance;
            if pairs.get(&(ancestor, tail)) != Some(&expected) {
                violations.push(Violation::MissingPath {
                    ancestor: ancestor.clone(),
                    descendant: tail.clone(),
                    distance: expected,
                });
            }
        }
    }

    for (node, parent) in parents {
        if !attached.contains(node) {
            continue;
        }
        if pairs.get(&(node, node)) != Some(&0) {
            violations.push(Violation::MissingSelfRow { node: node.clone() });
        }

        let recorded = recorded_parent.get(node).map(Vec::as_slice).unwrap_or(&[]);
        let agrees = match (parent, recorded) {
            (None, []) => true,
            (Some(parent), [only]) => parent == *only,
            _ => false,
        };
        if !agrees {
            violations.push(Violation::ParentMismatch {
                node: node.clone(),
                parent: parent.clone(),
                recorded: recorded.first().map(|key| (*key).clone()),
            });
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(ancestor: i32, descendant: i32, distance: i32) -> ClosureRow<i32> {
        ClosureRow {
            ancestor,
            descendant,
            distance,
        }
    }

    fn sample_tree() -> (Vec<ClosureRow<i32>>, Vec<(i32, Option<i32>)>) {
        // 1 -> 2 -> 4, 1 -> 3
        let rows = vec![
            row(1, 1, 0),
            row(2, 2, 0),
            row(3, 3, 0),
            row(4, 4, 0),
            row(1, 2, 1),
            row(1, 3, 1),
            row(2, 4, 1),
            row(1, 4, 2),
        ];
        let parents = vec![(1, None), (2, Some(1)), (3, Some(1)), (4, Some(2))];
        (rows, parents)
    }

    #[test]
    fn consistent_tree_has_no_violations() {
        let (rows, parents) = sample_tree();
        assert!(find_violations(&rows, &parents).is_empty());
    }

    #[test]
    fn reports_missing_transitive_row() {
        let (mut rows, parents) = sample_tree();
        rows.retain(|r| !(r.ancestor == 1 && r.descendant == 4));
        let violations = find_violations(&rows, &parents);
        assert_eq!(
            violations,
            vec![Violation::MissingPath {
                ancestor: 1,
                descendant: 4,
                distance: 2
            }]
        );
    }

    #[test]
    fn reports_self_ancestry_and_duplicates() {
        let (mut rows, parents) = sample_tree();
        rows.push(row(3, 3, 2));
        rows.push(row(2, 3, 1));
        rows.push(row(5, 5, 1));
        let violations = find_violations(&rows, &parents);
        assert!(violations.contains(&Violation::SelfAncestry {
            node: 5,
            distance: 1
        }));
        assert!(violations.contains(&Violation::DuplicatePair {
            ancestor: 3,
            descendant: 3
        }));
        assert!(violations.contains(&Violation::ParentMismatch {
            node: 3,
            parent: Some(1),
            recorded: Some(1),
        }));
    }

    #[test]
    fn reports_stale_parent_link() {
        let (rows, mut parents) = sample_tree();
        parents[3] = (4, Some(3));
        let violations = find_violations(&rows, &parents);
        assert_eq!(
            violations,
            vec![Violation::ParentMismatch {
                node: 4,
                parent: Some(3),
                recorded: Some(2),
            }]
        );
    }

    #[test]
    fn isolated_entities_are_skipped() {
        let (rows, mut parents) = sample_tree();
        parents.push((9, None));
        assert!(find_violations(&rows, &parents).is_empty());
    }
}
