//! AA-tree node core
//!
//! Shared by the list and map layers. Balancing uses the two AA moves,
//! skew and split, over a single `level` rank field. `total_size` counts
//! every entry in a subtree, deleted ones included, which is what makes
//! positional descent work over historical data.

use std::sync::Arc;

use super::Timestamp;

/// A populated tree node. The nil case lives in [`Tree`].
#[derive(Debug)]
pub(crate) struct Node<P> {
    pub(crate) level: u32,
    pub(crate) total_size: u64,
    pub(crate) created_at: Timestamp,
    pub(crate) deleted_at: Timestamp,
    pub(crate) left: Tree<P>,
    pub(crate) right: Tree<P>,
    pub(crate) payload: P,
}

impl<P> Node<P> {
    /// Entry exists at `time` when `created_at <= time < deleted_at`.
    pub(crate) fn exists(&self, time: Timestamp) -> bool {
        self.created_at <= time && time < self.deleted_at
    }
}

/// Handle to a subtree. `None` is the canonical nil sentinel; a nil
/// subtree has level 0 and size 0 by definition.
#[derive(Debug)]
pub(crate) struct Tree<P>(pub(crate) Option<Arc<Node<P>>>);

impl<P> Clone for Tree<P> {
    fn clone(&self) -> Self {
        Tree(self.0.clone())
    }
}

impl<P> Default for Tree<P> {
    fn default() -> Self {
        Tree(None)
    }
}

impl<P> Tree<P> {
    pub(crate) fn nil() -> Self {
        Tree(None)
    }

    pub(crate) fn node(&self) -> Option<&Arc<Node<P>>> {
        self.0.as_ref()
    }

    /// Level of this subtree's root; 0 for nil.
    #[allow(dead_code)]
    pub(crate) fn level(&self) -> u32 {
        self.node().map_or(0, |n| n.level)
    }

    pub(crate) fn total_size(&self) -> u64 {
        self.node().map_or(0, |n| n.total_size)
    }

    /// True when both handles reference the same node (or are both nil).
    pub(crate) fn same_tree(&self, other: &Tree<P>) -> bool {
        match (&self.0, &other.0) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub(crate) fn iter(&self) -> TreeIter<P> {
        let mut iter = TreeIter { stack: Vec::new() };
        iter.push_left_spine(self);
        iter
    }

    /// Existence-filtered entry count. O(n).
    pub(crate) fn size_at(&self, time: Timestamp) -> u64 {
        match self.node() {
            None => 0,
            Some(n) => {
                n.left.size_at(time) + n.right.size_at(time) + u64::from(n.exists(time))
            }
        }
    }
}

impl<P: Clone> Tree<P> {
    pub(crate) fn leaf(payload: P, created_at: Timestamp, deleted_at: Timestamp) -> Self {
        Tree(Some(Arc::new(Node {
            level: 1,
            total_size: 1,
            created_at,
            deleted_at,
            left: Tree::nil(),
            right: Tree::nil(),
            payload,
        })))
    }

    /// Raw constructor used by the codec when rebuilding a stored tree.
    pub(crate) fn from_parts(
        level: u32,
        total_size: u64,
        created_at: Timestamp,
        deleted_at: Timestamp,
        left: Tree<P>,
        right: Tree<P>,
        payload: P,
    ) -> Self {
        Tree(Some(Arc::new(Node {
            level,
            total_size,
            created_at,
            deleted_at,
            left,
            right,
            payload,
        })))
    }

    /// Copy of `node` with new children, size recomputed.
    pub(crate) fn with(node: &Node<P>, left: Tree<P>, right: Tree<P>) -> Tree<P> {
        Tree::with_level(node, node.level, left, right)
    }

    pub(crate) fn with_level(node: &Node<P>, level: u32, left: Tree<P>, right: Tree<P>) -> Tree<P> {
        let total_size = 1 + left.total_size() + right.total_size();
        Tree(Some(Arc::new(Node {
            level,
            total_size,
            created_at: node.created_at,
            deleted_at: node.deleted_at,
            left,
            right,
            payload: node.payload.clone(),
        })))
    }

    /// Copy of `node` with a replacement payload, structure untouched.
    pub(crate) fn with_payload(node: &Node<P>, payload: P) -> Tree<P> {
        Tree(Some(Arc::new(Node {
            level: node.level,
            total_size: node.total_size,
            created_at: node.created_at,
            deleted_at: node.deleted_at,
            left: node.left.clone(),
            right: node.right.clone(),
            payload,
        })))
    }

    fn with_deleted(node: &Node<P>, deleted_at: Timestamp) -> Tree<P> {
        Tree(Some(Arc::new(Node {
            level: node.level,
            total_size: node.total_size,
            created_at: node.created_at,
            deleted_at,
            left: node.left.clone(),
            right: node.right.clone(),
            payload: node.payload.clone(),
        })))
    }

    /// Fix a left-left rank violation by rotating right.
    pub(crate) fn skew(&self) -> Tree<P> {
        let Some(node) = self.node() else {
            return self.clone();
        };
        let Some(left) = node.left.node() else {
            return self.clone();
        };
        if left.level == node.level {
            let lowered = Tree::with(node, left.right.clone(), node.right.clone());
            Tree::with_level(left, left.level, left.left.clone(), lowered)
        } else {
            self.clone()
        }
    }

    /// Fix a right-right-right rank violation by rotating left and
    /// promoting the middle node.
    pub(crate) fn split(&self) -> Tree<P> {
        let Some(node) = self.node() else {
            return self.clone();
        };
        let Some(right) = node.right.node() else {
            return self.clone();
        };
        let Some(right_right) = right.right.node() else {
            return self.clone();
        };
        if node.level == right_right.level {
            let lowered = Tree::with(node, node.left.clone(), right.left.clone());
            Tree::with_level(right, right.level + 1, lowered, right.right.clone())
        } else {
            self.clone()
        }
    }

    /// Insert a new entry before raw position `index`; an index at or past
    /// the end appends.
    pub(crate) fn insert_at(
        &self,
        index: u64,
        payload: P,
        created_at: Timestamp,
        deleted_at: Timestamp,
    ) -> Tree<P> {
        match self.node() {
            None => Tree::leaf(payload, created_at, deleted_at),
            Some(node) => {
                let left_size = node.left.total_size();
                let rebuilt = if index <= left_size {
                    let left = node.left.insert_at(index, payload, created_at, deleted_at);
                    Tree::with(node, left, node.right.clone())
                } else {
                    let right = node.right.insert_at(
                        index - left_size - 1,
                        payload,
                        created_at,
                        deleted_at,
                    );
                    Tree::with(node, node.left.clone(), right)
                };
                rebuilt.skew().split()
            }
        }
    }

    /// Entry at raw position `index`, deleted entries included.
    pub(crate) fn get_at(&self, index: u64) -> Option<&Node<P>> {
        let node = self.node()?;
        let left_size = node.left.total_size();
        if index < left_size {
            node.left.get_at(index)
        } else if index == left_size {
            Some(node)
        } else {
            node.right.get_at(index - left_size - 1)
        }
    }

    /// Stamp the entry at `index` deleted at `deleted_at`.
    ///
    /// Returns the identical root when the index is out of range or the
    /// entry already carries that stamp, so callers can detect a no-op by
    /// handle identity.
    pub(crate) fn mark_deleted_at(&self, index: u64, deleted_at: Timestamp) -> Tree<P> {
        let Some(node) = self.node() else {
            return self.clone();
        };
        let left_size = node.left.total_size();
        if index < left_size {
            let left = node.left.mark_deleted_at(index, deleted_at);
            if left.same_tree(&node.left) {
                self.clone()
            } else {
                Tree::with(node, left, node.right.clone())
            }
        } else if index == left_size {
            if node.deleted_at == deleted_at {
                self.clone()
            } else {
                Tree::with_deleted(node, deleted_at)
            }
        } else {
            let right = node.right.mark_deleted_at(index - left_size - 1, deleted_at);
            if right.same_tree(&node.right) {
                self.clone()
            } else {
                Tree::with(node, node.left.clone(), right)
            }
        }
    }

    /// Stamp every entry live at `time` deleted at `time`.
    pub(crate) fn mark_all_deleted(&self, time: Timestamp) -> Tree<P> {
        let Some(node) = self.node() else {
            return self.clone();
        };
        let left = node.left.mark_all_deleted(time);
        let right = node.right.mark_all_deleted(time);
        let live = node.exists(time);
        if !live && left.same_tree(&node.left) && right.same_tree(&node.right) {
            return self.clone();
        }
        Tree(Some(Arc::new(Node {
            level: node.level,
            total_size: node.total_size,
            created_at: node.created_at,
            deleted_at: if live { time } else { node.deleted_at },
            left,
            right,
            payload: node.payload.clone(),
        })))
    }
}

impl<P> Tree<P> {
    /// Raw position of the first entry live at `time`.
    pub(crate) fn first_existing(&self, time: Timestamp) -> Option<u64> {
        self.first_existing_from(0, time)
    }

    fn first_existing_from(&self, base: u64, time: Timestamp) -> Option<u64> {
        let node = self.node()?;
        if let Some(found) = node.left.first_existing_from(base, time) {
            return Some(found);
        }
        let position = base + node.left.total_size();
        if node.exists(time) {
            return Some(position);
        }
        node.right.first_existing_from(position + 1, time)
    }

    /// Raw position of the last entry live at `time`.
    pub(crate) fn last_existing(&self, time: Timestamp) -> Option<u64> {
        self.last_existing_from(0, time)
    }

    fn last_existing_from(&self, base: u64, time: Timestamp) -> Option<u64> {
        let node = self.node()?;
        let position = base + node.left.total_size();
        if let Some(found) = node.right.last_existing_from(position + 1, time) {
            return Some(found);
        }
        if node.exists(time) {
            return Some(position);
        }
        node.left.last_existing_from(base, time)
    }

    /// Smallest raw position strictly greater than `index` live at `time`.
    pub(crate) fn higher_existing(&self, index: u64, time: Timestamp) -> Option<u64> {
        self.higher_from(0, index, time)
    }

    fn higher_from(&self, base: u64, index: u64, time: Timestamp) -> Option<u64> {
        let node = self.node()?;
        let position = base + node.left.total_size();
        if position > index {
            if let Some(found) = node.left.higher_from(base, index, time) {
                return Some(found);
            }
            if node.exists(time) {
                return Some(position);
            }
            node.right.first_existing_from(position + 1, time)
        } else {
            node.right.higher_from(position + 1, index, time)
        }
    }

    /// Greatest raw position strictly less than `index` live at `time`.
    pub(crate) fn lower_existing(&self, index: u64, time: Timestamp) -> Option<u64> {
        self.lower_from(0, index, time)
    }

    fn lower_from(&self, base: u64, index: u64, time: Timestamp) -> Option<u64> {
        let node = self.node()?;
        let position = base + node.left.total_size();
        if position < index {
            if let Some(found) = node.right.lower_from(position + 1, index, time) {
                return Some(found);
            }
            if node.exists(time) {
                return Some(position);
            }
            node.left.last_existing_from(base, time)
        } else {
            node.left.lower_from(base, index, time)
        }
    }
}

/// In-order traversal, lazy and restartable: each call to `iter` starts a
/// fresh pass, and entries are visited as the caller pulls them.
pub(crate) struct TreeIter<P> {
    stack: Vec<Arc<Node<P>>>,
}

impl<P> TreeIter<P> {
    fn push_left_spine(&mut self, start: &Tree<P>) {
        let mut current = start.clone();
        while let Some(node) = current.0.clone() {
            self.stack.push(Arc::clone(&node));
            current = node.left.clone();
        }
    }
}

impl<P> Iterator for TreeIter<P> {
    type Item = Arc<Node<P>>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.push_left_spine(&node.right);
        Some(node)
    }
}

#[cfg(test)]
impl<P> Tree<P> {
    /// AA invariants: left child level strictly below, right child level at
    /// most equal, no two consecutive equal-level right links, and
    /// `total_size` consistent throughout.
    pub(crate) fn check_invariants(&self) -> bool {
        let Some(node) = self.node() else {
            return true;
        };
        if node.left.level() >= node.level {
            return false;
        }
        if node.right.level() > node.level {
            return false;
        }
        if let Some(right) = node.right.node() {
            if right.right.level() >= node.level {
                return false;
            }
        }
        if node.total_size != 1 + node.left.total_size() + node.right.total_size() {
            return false;
        }
        node.left.check_invariants() && node.right.check_invariants()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TIME_MAX;

    fn sequential(n: u64) -> Tree<u64> {
        let mut tree = Tree::nil();
        for i in 0..n {
            tree = tree.insert_at(i, i, i as Timestamp, TIME_MAX);
        }
        tree
    }

    #[test]
    fn it_keeps_aa_invariants_on_append() {
        let mut tree: Tree<u64> = Tree::nil();
        for i in 0..300 {
            tree = tree.insert_at(u64::MAX, i, 0, TIME_MAX);
            assert!(tree.check_invariants());
        }
        assert_eq!(tree.total_size(), 300);
    }

    #[test]
    fn it_keeps_aa_invariants_on_prepend() {
        let mut tree: Tree<u64> = Tree::nil();
        for i in 0..300 {
            tree = tree.insert_at(0, i, 0, TIME_MAX);
            assert!(tree.check_invariants());
        }
        // Prepending reverses the order
        let flat: Vec<u64> = tree.iter().map(|n| n.payload).collect();
        assert_eq!(flat, (0..300).rev().collect::<Vec<u64>>());
    }

    #[test]
    fn it_keeps_aa_invariants_on_random_positions() {
        use rand::Rng;
        let mut tree: Tree<u64> = Tree::nil();
        for i in 0..500 {
            let at = rand::thread_rng().gen_range(0..=tree.total_size());
            tree = tree.insert_at(at, i, 0, TIME_MAX);
            assert!(tree.check_invariants());
        }
        assert_eq!(tree.total_size(), 500);
    }

    #[test]
    fn it_finds_entries_by_position() {
        let tree = sequential(64);
        for i in 0..64 {
            assert_eq!(tree.get_at(i).map(|n| n.payload), Some(i));
        }
        assert!(tree.get_at(64).is_none());
    }

    #[test]
    fn it_shares_structure_between_roots() {
        let old = sequential(100);
        let new = old.insert_at(u64::MAX, 100, 100, TIME_MAX);
        assert_eq!(old.total_size(), 100);
        assert_eq!(new.total_size(), 101);
        // The untouched leftmost spine is shared, not copied
        let old_first = old.get_at(0).unwrap() as *const _;
        let new_first = new.get_at(0).unwrap() as *const _;
        assert!(std::ptr::eq(old_first, new_first));
    }

    #[test]
    fn it_returns_identical_root_for_noop_marks() {
        let tree = sequential(10);
        let marked = tree.mark_deleted_at(4, 50);
        assert!(!marked.same_tree(&tree));
        let again = marked.mark_deleted_at(4, 50);
        assert!(again.same_tree(&marked));
        let out_of_range = tree.mark_deleted_at(10, 50);
        assert!(out_of_range.same_tree(&tree));
    }

    #[test]
    fn it_filters_positional_queries_by_time() {
        // Entries created at 0..10, entry 3 and 7 deleted at 20
        let mut tree: Tree<u64> = Tree::nil();
        for i in 0..10 {
            tree = tree.insert_at(i, i, 0, TIME_MAX);
        }
        let tree = tree.mark_deleted_at(3, 20).mark_deleted_at(7, 20);

        assert_eq!(tree.first_existing(25), Some(0));
        assert_eq!(tree.higher_existing(2, 25), Some(4));
        assert_eq!(tree.higher_existing(6, 25), Some(8));
        assert_eq!(tree.lower_existing(4, 25), Some(2));
        assert_eq!(tree.last_existing(25), Some(9));
        // Before the deletion everything is still there
        assert_eq!(tree.higher_existing(2, 10), Some(3));
        assert_eq!(tree.size_at(25), 8);
        assert_eq!(tree.size_at(10), 10);
    }
}
