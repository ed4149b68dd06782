//! Versioned map
//!
//! Ordered keys, each owning an embedded history list of every value the
//! key has carried. Assignment appends to the history; `set` soft-deletes
//! the old history first. A key is visible at a point in time exactly when
//! its history holds a live entry there.

use std::cmp::Ordering;

use crate::tree::list::VersionedList;
use crate::tree::node::Node;
use crate::tree::node::Tree;
use crate::tree::Timestamp;
use crate::tree::TIME_MAX;
use crate::Value;

/// Map node payload: the key plus its value history.
#[derive(Clone, Debug)]
pub(crate) struct KeyPair {
    pub(crate) key: Value,
    pub(crate) history: Tree<Value>,
}

/// A persistent ordered map with per-assignment versioning.
///
/// Every mutating operation returns a new map; the receiver is never
/// changed, so any map handle is a stable snapshot.
#[derive(Clone, Debug, Default)]
pub struct VersionedMap {
    root: Tree<KeyPair>,
}

impl VersionedMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self { root: Tree::nil() }
    }

    pub(crate) fn from_root(root: Tree<KeyPair>) -> Self {
        Self { root }
    }

    pub(crate) fn root(&self) -> &Tree<KeyPair> {
        &self.root
    }

    /// True when both maps share the same root node.
    pub fn same_root(&self, other: &VersionedMap) -> bool {
        self.root.same_tree(&other.root)
    }

    /// Append `value` to the history of `key` at `time`, creating the key
    /// if this is its first assignment.
    pub fn add(&self, key: &Value, value: Value, time: Timestamp) -> Self {
        let root = with_key(&self.root, key, time);
        let root = update_history(&root, key, |history| {
            history.insert_at(history.total_size(), value.clone(), time, TIME_MAX)
        });
        Self { root }
    }

    /// Replace the value of `key` at `time`: soft-delete the live history,
    /// then append the single new entry.
    pub fn set(&self, key: &Value, value: Value, time: Timestamp) -> Self {
        let root = with_key(&self.root, key, time);
        let root = update_history(&root, key, |history| {
            let cleared = history.mark_all_deleted(time);
            cleared.insert_at(cleared.total_size(), value.clone(), time, TIME_MAX)
        });
        Self { root }
    }

    /// Soft-delete the first live history entry of `key` equal to `value`.
    /// Unknown keys and absent values leave the identical root.
    pub fn remove(&self, key: &Value, value: &Value, time: Timestamp) -> Self {
        let root = update_history(&self.root, key, |history| {
            let found = history
                .iter()
                .enumerate()
                .find(|(_, n)| n.exists(time) && n.payload == *value)
                .map(|(index, _)| index as u64);
            match found {
                Some(index) => history.mark_deleted_at(index, time),
                None => history.clone(),
            }
        });
        Self { root }
    }

    /// Soft-delete the whole live history of `key` at `time`.
    pub fn clear_entry(&self, key: &Value, time: Timestamp) -> Self {
        let root = update_history(&self.root, key, |history| history.mark_all_deleted(time));
        Self { root }
    }

    /// Soft-delete every key's live history at `time`.
    pub fn clear(&self, time: Timestamp) -> Self {
        Self {
            root: clear_all(&self.root, time),
        }
    }

    /// Newest value of `key` live at `time`.
    pub fn get(&self, key: &Value, time: Timestamp) -> Option<Value> {
        let node = find_key(&self.root, key)?;
        let index = node.payload.history.last_existing(time)?;
        node.payload
            .history
            .get_at(index)
            .map(|n| n.payload.clone())
    }

    /// Full value history of `key`, deleted entries included.
    pub fn history(&self, key: &Value) -> Option<VersionedList> {
        find_key(&self.root, key).map(|n| VersionedList::from_root(n.payload.history.clone()))
    }

    /// True when `key` has a live entry at `time`.
    pub fn contains_key(&self, key: &Value, time: Timestamp) -> bool {
        find_key(&self.root, key)
            .map(|n| n.payload.history.last_existing(time).is_some())
            .unwrap_or(false)
    }

    /// Smallest key live at `time`.
    pub fn first_key(&self, time: Timestamp) -> Option<Value> {
        first_live_key(&self.root, time)
    }

    /// Greatest key live at `time`.
    pub fn last_key(&self, time: Timestamp) -> Option<Value> {
        last_live_key(&self.root, time)
    }

    /// Smallest key strictly greater than `key` live at `time`.
    pub fn higher_key(&self, key: &Value, time: Timestamp) -> Option<Value> {
        higher_live_key(&self.root, key, time)
    }

    /// Greatest key strictly less than `key` live at `time`.
    pub fn lower_key(&self, key: &Value, time: Timestamp) -> Option<Value> {
        lower_live_key(&self.root, key, time)
    }

    /// Smallest key at or above `key` live at `time`.
    pub fn ceiling_key(&self, key: &Value, time: Timestamp) -> Option<Value> {
        if self.contains_key(key, time) {
            Some(key.clone())
        } else {
            self.higher_key(key, time)
        }
    }

    /// Greatest key at or below `key` live at `time`.
    pub fn floor_key(&self, key: &Value, time: Timestamp) -> Option<Value> {
        if self.contains_key(key, time) {
            Some(key.clone())
        } else {
            self.lower_key(key, time)
        }
    }

    /// Keys live at `time`, in order. Lazy and restartable.
    pub fn keys(&self, time: Timestamp) -> impl Iterator<Item = Value> + '_ {
        self.root
            .iter()
            .filter(move |n| n.payload.history.last_existing(time).is_some())
            .map(|n| n.payload.key.clone())
    }

    /// Key/value pairs live at `time`, in key order.
    pub fn entries(&self, time: Timestamp) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.root.iter().filter_map(move |n| {
            let index = n.payload.history.last_existing(time)?;
            let value = n.payload.history.get_at(index)?.payload.clone();
            Some((n.payload.key.clone(), value))
        })
    }

    /// True when no key is live at `time`.
    pub fn is_empty(&self, time: Timestamp) -> bool {
        self.first_key(time).is_none()
    }

    /// Count of keys live at `time`.
    pub fn size(&self, time: Timestamp) -> u64 {
        self.root
            .iter()
            .filter(|n| n.payload.history.last_existing(time).is_some())
            .count() as u64
    }

    /// Count of all keys, including those with only dead history.
    pub fn total_size(&self) -> u64 {
        self.root.total_size()
    }

    /// Copy dropping history entries dead at or before `before`; keys left
    /// with no history at all are dropped too. O(n log n) rebuild.
    pub fn compact(&self, before: Timestamp) -> Self {
        let mut root: Tree<KeyPair> = Tree::nil();
        for node in self.root.iter() {
            let history = VersionedList::from_root(node.payload.history.clone()).compact(before);
            if history.total_size() == 0 {
                continue;
            }
            root = root.insert_at(
                root.total_size(),
                KeyPair {
                    key: node.payload.key.clone(),
                    history: history.root().clone(),
                },
                node.created_at,
                node.deleted_at,
            );
        }
        Self { root }
    }
}

/// Ensure a node for `key` exists; the returned root is identical when it
/// already does.
fn with_key(tree: &Tree<KeyPair>, key: &Value, time: Timestamp) -> Tree<KeyPair> {
    match tree.node() {
        None => Tree::leaf(
            KeyPair {
                key: key.clone(),
                history: Tree::nil(),
            },
            time,
            TIME_MAX,
        ),
        Some(node) => match key.cmp(&node.payload.key) {
            Ordering::Equal => tree.clone(),
            Ordering::Less => {
                let left = with_key(&node.left, key, time);
                if left.same_tree(&node.left) {
                    tree.clone()
                } else {
                    Tree::with(node, left, node.right.clone()).skew().split()
                }
            }
            Ordering::Greater => {
                let right = with_key(&node.right, key, time);
                if right.same_tree(&node.right) {
                    tree.clone()
                } else {
                    Tree::with(node, node.left.clone(), right).skew().split()
                }
            }
        },
    }
}

fn find_key<'a>(tree: &'a Tree<KeyPair>, key: &Value) -> Option<&'a Node<KeyPair>> {
    let node = tree.node()?;
    match key.cmp(&node.payload.key) {
        Ordering::Equal => Some(node),
        Ordering::Less => find_key(&node.left, key),
        Ordering::Greater => find_key(&node.right, key),
    }
}

/// Rebuild the path to `key` with a replacement history. No structural
/// change, so no rebalancing; an unchanged history leaves the identical
/// root.
fn update_history(
    tree: &Tree<KeyPair>,
    key: &Value,
    replace: impl Fn(&Tree<Value>) -> Tree<Value> + Copy,
) -> Tree<KeyPair> {
    let Some(node) = tree.node() else {
        return tree.clone();
    };
    match key.cmp(&node.payload.key) {
        Ordering::Equal => {
            let history = replace(&node.payload.history);
            if history.same_tree(&node.payload.history) {
                tree.clone()
            } else {
                Tree::with_payload(
                    node,
                    KeyPair {
                        key: node.payload.key.clone(),
                        history,
                    },
                )
            }
        }
        Ordering::Less => {
            let left = update_history(&node.left, key, replace);
            if left.same_tree(&node.left) {
                tree.clone()
            } else {
                Tree::with(node, left, node.right.clone())
            }
        }
        Ordering::Greater => {
            let right = update_history(&node.right, key, replace);
            if right.same_tree(&node.right) {
                tree.clone()
            } else {
                Tree::with(node, node.left.clone(), right)
            }
        }
    }
}

fn clear_all(tree: &Tree<KeyPair>, time: Timestamp) -> Tree<KeyPair> {
    let Some(node) = tree.node() else {
        return tree.clone();
    };
    let left = clear_all(&node.left, time);
    let right = clear_all(&node.right, time);
    let history = node.payload.history.mark_all_deleted(time);
    if left.same_tree(&node.left)
        && right.same_tree(&node.right)
        && history.same_tree(&node.payload.history)
    {
        return tree.clone();
    }
    Tree::from_parts(
        node.level,
        node.total_size,
        node.created_at,
        node.deleted_at,
        left,
        right,
        KeyPair {
            key: node.payload.key.clone(),
            history,
        },
    )
}

fn first_live_key(tree: &Tree<KeyPair>, time: Timestamp) -> Option<Value> {
    let node = tree.node()?;
    if let Some(found) = first_live_key(&node.left, time) {
        return Some(found);
    }
    if node.payload.history.last_existing(time).is_some() {
        return Some(node.payload.key.clone());
    }
    first_live_key(&node.right, time)
}

fn last_live_key(tree: &Tree<KeyPair>, time: Timestamp) -> Option<Value> {
    let node = tree.node()?;
    if let Some(found) = last_live_key(&node.right, time) {
        return Some(found);
    }
    if node.payload.history.last_existing(time).is_some() {
        return Some(node.payload.key.clone());
    }
    last_live_key(&node.left, time)
}

fn higher_live_key(tree: &Tree<KeyPair>, key: &Value, time: Timestamp) -> Option<Value> {
    let node = tree.node()?;
    if node.payload.key > *key {
        if let Some(found) = higher_live_key(&node.left, key, time) {
            return Some(found);
        }
        if node.payload.history.last_existing(time).is_some() {
            return Some(node.payload.key.clone());
        }
        first_live_key(&node.right, time)
    } else {
        higher_live_key(&node.right, key, time)
    }
}

fn lower_live_key(tree: &Tree<KeyPair>, key: &Value, time: Timestamp) -> Option<Value> {
    let node = tree.node()?;
    if node.payload.key < *key {
        if let Some(found) = lower_live_key(&node.right, key, time) {
            return Some(found);
        }
        if node.payload.history.last_existing(time).is_some() {
            return Some(node.payload.key.clone());
        }
        last_live_key(&node.left, time)
    } else {
        lower_live_key(&node.left, key, time)
    }
}

impl PartialEq for VersionedMap {
    fn eq(&self, other: &Self) -> bool {
        self.total_size() == other.total_size()
            && self.root.iter().zip(other.root.iter()).all(|(a, b)| {
                a.payload.key == b.payload.key
                    && a.created_at == b.created_at
                    && a.deleted_at == b.deleted_at
                    && VersionedList::from_root(a.payload.history.clone())
                        == VersionedList::from_root(b.payload.history.clone())
            })
    }
}

impl Eq for VersionedMap {}

impl PartialOrd for VersionedMap {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionedMap {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.root.iter().map(|n| {
            (
                n.payload.key.clone(),
                VersionedList::from_root(n.payload.history.clone()),
            )
        });
        let rhs = other.root.iter().map(|n| {
            (
                n.payload.key.clone(),
                VersionedList::from_root(n.payload.history.clone()),
            )
        });
        lhs.cmp(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_sets_and_gets() {
        let map = VersionedMap::new().set(&Value::from("x"), Value::from("hi"), 10);
        assert_eq!(map.get(&Value::from("x"), TIME_MAX), Some(Value::from("hi")));
        assert_eq!(map.get(&Value::from("x"), 5), None);
        assert_eq!(map.get(&Value::from("missing"), TIME_MAX), None);
    }

    #[test]
    fn it_keeps_history_across_set() {
        let key = Value::from("k");
        let map = VersionedMap::new()
            .set(&key, Value::from("first"), 10)
            .set(&key, Value::from("second"), 20);

        // Newest value wins now, the old one is still visible in the past
        assert_eq!(map.get(&key, 25), Some(Value::from("second")));
        assert_eq!(map.get(&key, 15), Some(Value::from("first")));

        let history = map.history(&key).expect("key has history");
        assert_eq!(history.total_size(), 2);
        assert_eq!(history.entry(0).unwrap().deleted_at, 20);
        assert_eq!(history.entry(1).unwrap().deleted_at, TIME_MAX);
    }

    #[test]
    fn it_accumulates_values_with_add() {
        let key = Value::from("tags");
        let map = VersionedMap::new()
            .add(&key, Value::from("red"), 10)
            .add(&key, Value::from("blue"), 20);
        let history = map.history(&key).expect("key has history");
        assert_eq!(history.size(25), 2);
        // add never deletes, so both stay live
        assert_eq!(history.entry(0).unwrap().deleted_at, TIME_MAX);
    }

    #[test]
    fn it_removes_one_value() {
        let key = Value::from("tags");
        let map = VersionedMap::new()
            .add(&key, Value::from("red"), 10)
            .add(&key, Value::from("blue"), 10);
        let removed = map.remove(&key, &Value::from("red"), 20);
        assert_eq!(removed.get(&key, 25), Some(Value::from("blue")));
        assert_eq!(removed.history(&key).unwrap().size(25), 1);
        // Removing an absent value leaves the identical root
        let missing = removed.remove(&key, &Value::from("green"), 30);
        assert!(missing.same_root(&removed));
        let no_key = removed.remove(&Value::from("other"), &Value::from("red"), 30);
        assert!(no_key.same_root(&removed));
    }

    #[test]
    fn it_counts_live_keys() {
        let mut map = VersionedMap::new();
        for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
            map = map.set(&Value::from(*key), Value::from(i as i32), 10);
        }
        let map = map.clear_entry(&Value::from("b"), 20);

        assert_eq!(map.size(15), 4);
        assert_eq!(map.size(25), 3);
        assert_eq!(map.total_size(), 4);
        assert!(!map.contains_key(&Value::from("b"), 25));
        assert!(map.contains_key(&Value::from("b"), 15));
        assert!(map.is_empty(5));
    }

    #[test]
    fn it_orders_key_queries_by_time() {
        let mut map = VersionedMap::new();
        for key in ["b", "d", "f"] {
            map = map.set(&Value::from(key), Value::from(1), 10);
        }
        let map = map.clear_entry(&Value::from("d"), 20);

        assert_eq!(map.first_key(25), Some(Value::from("b")));
        assert_eq!(map.last_key(25), Some(Value::from("f")));
        assert_eq!(map.higher_key(&Value::from("b"), 25), Some(Value::from("f")));
        assert_eq!(map.higher_key(&Value::from("b"), 15), Some(Value::from("d")));
        assert_eq!(map.lower_key(&Value::from("f"), 25), Some(Value::from("b")));
        assert_eq!(map.ceiling_key(&Value::from("d"), 25), Some(Value::from("f")));
        assert_eq!(map.ceiling_key(&Value::from("d"), 15), Some(Value::from("d")));
        assert_eq!(map.floor_key(&Value::from("d"), 25), Some(Value::from("b")));
        assert_eq!(map.higher_key(&Value::from("f"), 25), None);
        assert_eq!(
            map.keys(25).collect::<Vec<Value>>(),
            vec![Value::from("b"), Value::from("f")]
        );
    }

    #[test]
    fn it_clears_the_whole_map() {
        let mut map = VersionedMap::new();
        for key in ["a", "b", "c"] {
            map = map.set(&Value::from(key), Value::from(key), 10);
        }
        let cleared = map.clear(20);
        assert!(cleared.is_empty(25));
        assert_eq!(cleared.size(15), 3);
        let again = cleared.clear(30);
        assert!(again.same_root(&cleared));
    }

    #[test]
    fn it_compacts_dead_keys_away() {
        let map = VersionedMap::new()
            .set(&Value::from("keep"), Value::from(1), 10)
            .set(&Value::from("drop"), Value::from(2), 10)
            .clear_entry(&Value::from("drop"), 20);

        let compacted = map.compact(30);
        assert_eq!(compacted.total_size(), 1);
        assert_eq!(compacted.get(&Value::from("keep"), 40), Some(Value::from(1)));
        assert_eq!(compacted.get(&Value::from("drop"), 15), None);
        assert!(compacted.root().check_invariants());
    }

    #[test]
    fn it_keeps_aa_invariants_under_key_churn() {
        use rand::Rng;
        let mut map = VersionedMap::new();
        for i in 0..200 {
            let key = Value::from(rand::thread_rng().gen_range(0..50));
            map = map.set(&key, Value::from(i), i as Timestamp);
            assert!(map.root().check_invariants());
        }
    }
}
