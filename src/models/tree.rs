//! Block trees and the algebra over them.
//!
//! A [`BlockTree`] is an arbitrarily nested structure of keyed groups and
//! ordered lists whose leaves are blocks or [`BlockTree::Empty`] markers
//! (a block that a rule filtered out). Policies keep the nesting while rules
//! run, so a caller can still tell which source or category each block came
//! from, and flatten only at the end.
//!
//! # Traversal order
//! Depth-first. Lists keep their order; groups are visited in key order.
//! Traversal order is not time order until [`sort`] is applied.
//!
//! # Overlap
//! Intervals are half-open for overlap tests: blocks that only touch at an
//! endpoint do not overlap.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::block::{Block, TimeWindow};

/// A nested collection of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub enum BlockTree {
    /// A filtered-out leaf.
    #[default]
    Empty,
    /// A single block.
    Leaf(Block),
    /// An ordered sequence of subtrees.
    List(Vec<BlockTree>),
    /// Keyed subtrees.
    Group(BTreeMap<String, BlockTree>),
}

impl From<Block> for BlockTree {
    fn from(block: Block) -> Self {
        BlockTree::Leaf(block)
    }
}

impl From<Vec<Block>> for BlockTree {
    fn from(blocks: Vec<Block>) -> Self {
        BlockTree::List(blocks.into_iter().map(BlockTree::Leaf).collect())
    }
}

impl From<Option<Block>> for BlockTree {
    fn from(block: Option<Block>) -> Self {
        block.map_or(BlockTree::Empty, BlockTree::Leaf)
    }
}

impl BlockTree {
    /// Creates an empty group.
    pub fn group() -> Self {
        BlockTree::Group(BTreeMap::new())
    }

    /// Adds a keyed child, turning `self` into a group if needed.
    pub fn with_child(mut self, key: impl Into<String>, child: BlockTree) -> Self {
        self.insert(key, child);
        self
    }

    /// Inserts a keyed child and returns the previous one.
    ///
    /// A non-group tree is replaced by a group holding only the new child,
    /// discarding its blocks; policies reject such layouts up front.
    pub fn insert(&mut self, key: impl Into<String>, child: BlockTree) -> Option<BlockTree> {
        if !matches!(self, BlockTree::Group(_)) {
            *self = BlockTree::group();
        }
        match self {
            BlockTree::Group(map) => map.insert(key.into(), child),
            _ => None,
        }
    }

    /// Looks up a keyed child.
    pub fn get(&self, key: &str) -> Option<&BlockTree> {
        match self {
            BlockTree::Group(map) => map.get(key),
            _ => None,
        }
    }

    /// Looks up a keyed child mutably.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut BlockTree> {
        match self {
            BlockTree::Group(map) => map.get_mut(key),
            _ => None,
        }
    }

    /// Removes and returns a keyed child.
    pub fn take(&mut self, key: &str) -> Option<BlockTree> {
        match self {
            BlockTree::Group(map) => map.remove(key),
            _ => None,
        }
    }

    /// Follows a path of group keys.
    pub fn get_path(&self, path: &[&str]) -> Option<&BlockTree> {
        path.iter().try_fold(self, |node, key| node.get(key))
    }

    /// Keys of a group, in traversal order.
    pub fn keys(&self) -> Vec<&str> {
        match self {
            BlockTree::Group(map) => map.keys().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Visits every block depth-first.
    pub fn for_each<'a>(&'a self, mut f: impl FnMut(&'a Block)) {
        self.visit(&mut f);
    }

    fn visit<'a, F: FnMut(&'a Block)>(&'a self, f: &mut F) {
        match self {
            BlockTree::Empty => {}
            BlockTree::Leaf(b) => f(b),
            BlockTree::List(items) => {
                for item in items {
                    item.visit(f);
                }
            }
            BlockTree::Group(map) => {
                for item in map.values() {
                    item.visit(f);
                }
            }
        }
    }

    /// References to every block, depth-first.
    pub fn blocks(&self) -> Vec<&Block> {
        let mut out = Vec::new();
        self.for_each(|b| out.push(b));
        out
    }

    /// Depth-first copy of every block, dropping empty markers.
    pub fn flatten(&self) -> Vec<Block> {
        self.blocks().into_iter().cloned().collect()
    }

    /// Consumes the tree and returns its blocks depth-first.
    pub fn into_blocks(self) -> Vec<Block> {
        let mut out = Vec::new();
        self.collect_into(&mut out);
        out
    }

    fn collect_into(self, out: &mut Vec<Block>) {
        match self {
            BlockTree::Empty => {}
            BlockTree::Leaf(b) => out.push(b),
            BlockTree::List(items) => {
                for item in items {
                    item.collect_into(out);
                }
            }
            BlockTree::Group(map) => {
                for item in map.into_values() {
                    item.collect_into(out);
                }
            }
        }
    }

    /// Number of blocks in the tree.
    pub fn len(&self) -> usize {
        let mut n = 0;
        self.for_each(|_| n += 1);
        n
    }

    /// Whether the tree holds no block.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuilds the tree, replacing every leaf by `f(block)`.
    ///
    /// `f` returns zero, one or several blocks: no block becomes an empty
    /// marker, one stays a leaf, several become a list in place of the leaf.
    pub fn flat_map(&self, f: &mut impl FnMut(&Block) -> Vec<Block>) -> BlockTree {
        match self {
            BlockTree::Empty => BlockTree::Empty,
            BlockTree::Leaf(b) => {
                let mut pieces = f(b);
                match pieces.len() {
                    0 => BlockTree::Empty,
                    1 => BlockTree::Leaf(pieces.remove(0)),
                    _ => pieces.into(),
                }
            }
            BlockTree::List(items) => {
                BlockTree::List(items.iter().map(|item| item.flat_map(f)).collect())
            }
            BlockTree::Group(map) => BlockTree::Group(
                map.iter()
                    .map(|(k, item)| (k.clone(), item.flat_map(f)))
                    .collect(),
            ),
        }
    }

    /// Applies `f` to every block, preserving structure.
    pub fn map(&self, mut f: impl FnMut(&Block) -> Block) -> BlockTree {
        self.flat_map(&mut |b: &Block| vec![f(b)])
    }

    /// Applies `f` only to blocks satisfying `pred`.
    pub fn map_when(
        &self,
        pred: impl Fn(&Block) -> bool,
        mut f: impl FnMut(&Block) -> Block,
    ) -> BlockTree {
        self.map(|b| if pred(b) { f(b) } else { b.clone() })
    }

    /// Replaces blocks by `f(block)`, turning `None` into empty markers.
    pub fn filter_map(&self, mut f: impl FnMut(&Block) -> Option<Block>) -> BlockTree {
        self.flat_map(&mut |b: &Block| f(b).into_iter().collect())
    }

    /// Keeps blocks satisfying `pred`; others become empty markers.
    pub fn filter(&self, pred: impl Fn(&Block) -> bool) -> BlockTree {
        self.filter_map(|b| pred(b).then(|| b.clone()))
    }

    /// Clips every block to `[t0, t1]`.
    ///
    /// Blocks fully outside the window become empty markers. Truncation is
    /// lossy: the original boundaries are not kept anywhere.
    pub fn trim(&self, t0: DateTime<Utc>, t1: DateTime<Utc>) -> BlockTree {
        let window = TimeWindow::new(t0, t1);
        self.filter_map(|b| b.clipped(&window))
    }

    /// Removes empty markers from lists, recursively. Group keys are kept.
    pub fn drop_empty(self) -> BlockTree {
        match self {
            BlockTree::List(items) => BlockTree::List(
                items
                    .into_iter()
                    .filter(|item| !matches!(item, BlockTree::Empty))
                    .map(BlockTree::drop_empty)
                    .collect(),
            ),
            BlockTree::Group(map) => BlockTree::Group(
                map.into_iter()
                    .map(|(k, item)| (k, item.drop_empty()))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Flattens and sorts by start time.
    pub fn sorted(&self) -> Vec<Block> {
        sort(&self.flatten())
    }
}

/// Stable sort by start time.
pub fn sort(seq: &[Block]) -> Vec<Block> {
    let mut out = seq.to_vec();
    out.sort_by_key(|b| b.t0());
    out
}

/// Flattens both trees, concatenates them and stable-sorts by start time.
///
/// Blocks of `a` come before blocks of `b` on equal start times. No
/// deduplication or overlap resolution happens here.
pub fn merge(a: &BlockTree, b: &BlockTree) -> Vec<Block> {
    let mut out = a.flatten();
    out.extend(b.flatten());
    out.sort_by_key(|blk| blk.t0());
    out
}

/// Structure-preserving merge.
///
/// Groups merge key by key. Lists concatenate; a list holding only leaves
/// and empty markers is then stable-sorted by start time with the markers
/// dropped. Any other pair is combined into a two-element list under the
/// same rule.
pub fn merge_tree(a: BlockTree, b: BlockTree) -> BlockTree {
    match (a, b) {
        (BlockTree::Empty, other) | (other, BlockTree::Empty) => other,
        (BlockTree::Group(mut left), BlockTree::Group(right)) => {
            for (key, sub) in right {
                let merged = match left.remove(&key) {
                    Some(existing) => merge_tree(existing, sub),
                    None => sub,
                };
                left.insert(key, merged);
            }
            BlockTree::Group(left)
        }
        (BlockTree::List(mut left), BlockTree::List(right)) => {
            left.extend(right);
            sort_flat_list(left)
        }
        (BlockTree::List(mut left), other) => {
            left.push(other);
            sort_flat_list(left)
        }
        (other, BlockTree::List(right)) => {
            let mut items = vec![other];
            items.extend(right);
            sort_flat_list(items)
        }
        (left, right) => sort_flat_list(vec![left, right]),
    }
}

fn sort_flat_list(items: Vec<BlockTree>) -> BlockTree {
    let flat = items
        .iter()
        .all(|item| matches!(item, BlockTree::Leaf(_) | BlockTree::Empty));
    if !flat {
        return BlockTree::List(items);
    }
    let blocks: Vec<Block> = items
        .into_iter()
        .filter_map(|item| match item {
            BlockTree::Leaf(b) => Some(b),
            _ => None,
        })
        .collect();
    sort(&blocks).into()
}

/// Whether `candidate` overlaps any block of `seq`.
pub fn has_overlap_with(seq: &[Block], candidate: &Block) -> bool {
    seq.iter().any(|b| b.overlaps(candidate))
}

/// Whether `seq` has non-decreasing start times.
pub fn is_sorted(seq: &[Block]) -> bool {
    seq.windows(2).all(|w| w[0].t0() <= w[1].t0())
}
