//! Versioned list
//!
//! A positional collection in which every entry remembers when it was
//! created and when it was deleted. Removal never drops data; it stamps
//! the entry, so earlier roots keep answering queries about the past.

use std::cmp::Ordering;

use crate::tree::node::Tree;
use crate::tree::Timestamp;
use crate::tree::TIME_MAX;
use crate::Value;

/// One list entry together with its lifetime stamps.
#[derive(Clone, Debug, PartialEq)]
pub struct ListEntry {
    /// The stored value.
    pub value: Value,
    /// Transaction time the entry was created.
    pub created_at: Timestamp,
    /// Transaction time the entry was deleted, [`TIME_MAX`] while live.
    pub deleted_at: Timestamp,
}

/// A persistent list with per-entry versioning.
///
/// Every mutating operation returns a new list; the receiver is never
/// changed. Positions are raw: they count every entry ever inserted,
/// deleted ones included, which keeps positions stable across soft
/// deletes. Time-filtered queries report raw positions of live entries.
#[derive(Clone, Debug, Default)]
pub struct VersionedList {
    root: Tree<Value>,
}

impl VersionedList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self { root: Tree::nil() }
    }

    pub(crate) fn from_root(root: Tree<Value>) -> Self {
        Self { root }
    }

    pub(crate) fn root(&self) -> &Tree<Value> {
        &self.root
    }

    /// True when both lists share the same root node.
    pub fn same_root(&self, other: &VersionedList) -> bool {
        self.root.same_tree(&other.root)
    }

    /// Append `value`, created at `time`.
    pub fn add(&self, value: Value, time: Timestamp) -> Self {
        self.insert(self.total_size(), value, time)
    }

    /// Insert `value` before raw position `index`; an index at or past the
    /// end appends.
    pub fn insert(&self, index: u64, value: Value, time: Timestamp) -> Self {
        Self {
            root: self.root.insert_at(index, value, time, TIME_MAX),
        }
    }

    pub(crate) fn insert_stamped(
        &self,
        index: u64,
        value: Value,
        created_at: Timestamp,
        deleted_at: Timestamp,
    ) -> Self {
        Self {
            root: self.root.insert_at(index, value, created_at, deleted_at),
        }
    }

    /// Stamp the entry at `index` deleted at `time`.
    ///
    /// A no-op (out of range, or the entry is not live at `time`) returns
    /// a list sharing the identical root.
    pub fn remove(&self, index: u64, time: Timestamp) -> Self {
        match self.root.get_at(index) {
            Some(node) if node.exists(time) => Self {
                root: self.root.mark_deleted_at(index, time),
            },
            _ => self.clone(),
        }
    }

    /// Stamp the first live entry that is the same instance as `value`
    /// deleted at `time`.
    pub fn remove_value(&self, value: &Value, time: Timestamp) -> Self {
        match self.find_by_reference(value, time) {
            Some(index) => self.remove(index, time),
            None => self.clone(),
        }
    }

    /// Stamp every entry live at `time` deleted at `time`.
    pub fn clear(&self, time: Timestamp) -> Self {
        Self {
            root: self.root.mark_all_deleted(time),
        }
    }

    /// Value at raw position `index`, live or not.
    pub fn get(&self, index: u64) -> Option<Value> {
        self.root.get_at(index).map(|n| n.payload.clone())
    }

    /// Value at raw position `index` if the entry is live at `time`.
    pub fn get_at(&self, index: u64, time: Timestamp) -> Option<Value> {
        self.root
            .get_at(index)
            .filter(|n| n.exists(time))
            .map(|n| n.payload.clone())
    }

    /// Entry at raw position `index` with its stamps.
    pub fn entry(&self, index: u64) -> Option<ListEntry> {
        self.root.get_at(index).map(|n| ListEntry {
            value: n.payload.clone(),
            created_at: n.created_at,
            deleted_at: n.deleted_at,
        })
    }

    /// Raw position of the first live entry equal to `value`.
    pub fn find_by_equals(&self, value: &Value, time: Timestamp) -> Option<u64> {
        self.root
            .iter()
            .enumerate()
            .find(|(_, n)| n.exists(time) && n.payload == *value)
            .map(|(index, _)| index as u64)
    }

    /// Raw position of the first live entry that is the same instance as
    /// `value`. Distinguishes equal-but-distinct entries; see
    /// [`Value::same_instance`].
    pub fn find_by_reference(&self, value: &Value, time: Timestamp) -> Option<u64> {
        self.root
            .iter()
            .enumerate()
            .find(|(_, n)| n.exists(time) && n.payload.same_instance(value))
            .map(|(index, _)| index as u64)
    }

    /// Raw position of the first entry live at `time`.
    pub fn first_index(&self, time: Timestamp) -> Option<u64> {
        self.root.first_existing(time)
    }

    /// Raw position of the last entry live at `time`.
    pub fn last_index(&self, time: Timestamp) -> Option<u64> {
        self.root.last_existing(time)
    }

    /// Smallest raw position strictly greater than `index` live at `time`.
    pub fn higher(&self, index: u64, time: Timestamp) -> Option<u64> {
        self.root.higher_existing(index, time)
    }

    /// Greatest raw position strictly less than `index` live at `time`.
    pub fn lower(&self, index: u64, time: Timestamp) -> Option<u64> {
        self.root.lower_existing(index, time)
    }

    /// Smallest raw position at or above `index` live at `time`.
    pub fn ceiling(&self, index: u64, time: Timestamp) -> Option<u64> {
        match self.root.get_at(index) {
            Some(node) if node.exists(time) => Some(index),
            _ if index == 0 => self.first_index(time),
            _ => self.higher(index - 1, time),
        }
    }

    /// Greatest raw position at or below `index` live at `time`.
    pub fn floor(&self, index: u64, time: Timestamp) -> Option<u64> {
        match self.root.get_at(index) {
            Some(node) if node.exists(time) => Some(index),
            _ => self.lower(index.min(self.total_size()), time),
        }
    }

    /// True when no entry is live at `time`.
    pub fn is_empty(&self, time: Timestamp) -> bool {
        self.first_index(time).is_none()
    }

    /// Count of entries live at `time`.
    pub fn size(&self, time: Timestamp) -> u64 {
        self.root.size_at(time)
    }

    /// Count of all entries, deleted ones included.
    pub fn total_size(&self) -> u64 {
        self.root.total_size()
    }

    /// Values live at `time`, in position order. Lazy: entries are visited
    /// as the iterator is pulled, and each call starts a fresh pass.
    pub fn values(&self, time: Timestamp) -> impl Iterator<Item = Value> + '_ {
        self.root
            .iter()
            .filter(move |n| n.exists(time))
            .map(|n| n.payload.clone())
    }

    /// Every entry with its stamps, in position order.
    pub fn entries(&self) -> impl Iterator<Item = ListEntry> + '_ {
        self.root.iter().map(|n| ListEntry {
            value: n.payload.clone(),
            created_at: n.created_at,
            deleted_at: n.deleted_at,
        })
    }

    /// Copy dropping entries whose deletion is at or before `before`.
    ///
    /// Rebuilds by repeated insertion; O(n log n), intended for
    /// opportunistic use when bounding historical growth.
    pub fn compact(&self, before: Timestamp) -> Self {
        let mut out = VersionedList::new();
        for node in self.root.iter() {
            if node.deleted_at > before {
                out = out.insert_stamped(
                    out.total_size(),
                    node.payload.clone(),
                    node.created_at,
                    node.deleted_at,
                );
            }
        }
        out
    }
}

impl PartialEq for VersionedList {
    fn eq(&self, other: &Self) -> bool {
        self.total_size() == other.total_size()
            && self
                .entries()
                .zip(other.entries())
                .all(|(a, b)| a == b)
    }
}

impl Eq for VersionedList {}

impl PartialOrd for VersionedList {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionedList {
    fn cmp(&self, other: &Self) -> Ordering {
        self.entries()
            .map(|e| (e.value, e.created_at, e.deleted_at))
            .cmp(other.entries().map(|e| (e.value, e.created_at, e.deleted_at)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_prepends_in_reverse_into_order() {
        let mut list = VersionedList::new();
        for s in ["g", "f", "e", "d", "c", "b", "a"] {
            list = list.insert(0, Value::from(s), 1);
        }
        let flat: Vec<String> = list.values(1).map(|v| v.to_string()).collect();
        assert_eq!(flat, vec!["a", "b", "c", "d", "e", "f", "g"]);
        assert_eq!(list.total_size(), 7);
    }

    #[test]
    fn it_matches_the_existence_predicate_exhaustively() {
        // Entry i created at i*10, entries 1 and 3 deleted at 35 and 60
        let mut list = VersionedList::new();
        for i in 0..5 {
            list = list.add(Value::from(i), i as Timestamp * 10);
        }
        let list = list.remove(1, 35).remove(3, 60);

        let stamps = [(0, TIME_MAX), (10, 35), (20, TIME_MAX), (30, 60), (40, TIME_MAX)];
        for time in 0..100 {
            let expected = stamps
                .iter()
                .filter(|(created, deleted)| *created <= time && time < *deleted)
                .count() as u64;
            assert_eq!(list.size(time), expected, "at time {time}");
            assert_eq!(list.values(time).count() as u64, expected, "at time {time}");
        }
        assert_eq!(list.total_size(), 5);
    }

    #[test]
    fn it_ignores_repeated_removal() {
        let list = VersionedList::new()
            .add(Value::from("one"), 1)
            .add(Value::from("two"), 1);
        let removed = list.remove(0, 5);
        assert!(!removed.same_root(&list));
        let again = removed.remove(0, 5);
        assert!(again.same_root(&removed));
        // Out of range is also a no-op
        let missing = removed.remove(9, 5);
        assert!(missing.same_root(&removed));
    }

    #[test]
    fn it_searches_by_identity_and_by_equality() {
        let needle = Value::from("dup");
        let list = VersionedList::new()
            .add(Value::from("dup"), 1)
            .add(needle.clone(), 1)
            .add(Value::from("tail"), 1);

        assert_eq!(list.find_by_equals(&needle, 1), Some(0));
        assert_eq!(list.find_by_reference(&needle, 1), Some(1));
        assert_eq!(list.find_by_equals(&Value::from("gone"), 1), None);
        assert_eq!(list.find_by_reference(&Value::from("tail"), 1), None);

        // Identity-based removal takes out the right duplicate
        let removed = list.remove_value(&needle, 9);
        assert_eq!(removed.entry(1).unwrap().deleted_at, 9);
        assert_eq!(removed.entry(0).unwrap().deleted_at, TIME_MAX);
    }

    #[test]
    fn it_answers_ordered_queries() {
        let mut list = VersionedList::new();
        for i in 0..6 {
            list = list.add(Value::from(i), 0);
        }
        let list = list.remove(0, 10).remove(2, 10).remove(5, 10);

        assert_eq!(list.first_index(20), Some(1));
        assert_eq!(list.last_index(20), Some(4));
        assert_eq!(list.higher(1, 20), Some(3));
        assert_eq!(list.lower(3, 20), Some(1));
        assert_eq!(list.ceiling(2, 20), Some(3));
        assert_eq!(list.floor(2, 20), Some(1));
        assert_eq!(list.ceiling(5, 20), None);
        assert_eq!(list.floor(0, 20), None);
        assert!(!list.is_empty(20));
        assert!(VersionedList::new().is_empty(0));
    }

    #[test]
    fn it_clears_without_losing_the_past() {
        let list = VersionedList::new()
            .add(Value::from("x"), 1)
            .add(Value::from("y"), 2);
        let cleared = list.clear(10);
        assert!(cleared.is_empty(10));
        assert_eq!(cleared.size(5), 2);
        assert_eq!(cleared.total_size(), 2);
        // Clearing an already-empty view changes nothing
        let again = cleared.clear(20);
        assert!(again.same_root(&cleared));
    }

    #[test]
    fn it_compacts_dead_entries() {
        let list = VersionedList::new()
            .add(Value::from("keep"), 1)
            .add(Value::from("drop"), 2)
            .add(Value::from("late"), 3);
        let list = list.remove(1, 10).remove(2, 40);

        let compacted = list.compact(20);
        assert_eq!(compacted.total_size(), 2);
        let entries: Vec<ListEntry> = compacted.entries().collect();
        assert_eq!(entries[0].value, Value::from("keep"));
        assert_eq!(entries[0].created_at, 1);
        assert_eq!(entries[1].value, Value::from("late"));
        assert_eq!(entries[1].deleted_at, 40);
    }
}
