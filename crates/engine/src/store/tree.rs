//! Counted, prefix-compressed ordered tree.
//!
//! The tree is persistent: nodes are shared through `Arc` and every mutation
//! copies only the root-to-leaf path it touches. Cloning a tree clones one
//! `Arc`, which is what gives read-only transactions their free snapshots.
//!
//! Every branch caches two totals for its subtree: the number of distinct
//! keys and the number of entries (duplicate values counted individually).
//! Rank lookups, `count_all` and `range_count_keys` all run off these
//! cached totals in O(log n) without scanning.
//!
//! Prefix compression is a leaf-layout concern only: each leaf stores the
//! longest common prefix of its keys once, and suffixes per entry. It never
//! changes comparison results or iteration order.

use std::cmp::Ordering;
use std::sync::Arc;

/// Maximum entries per leaf before it splits.
pub const MAX_LEAF_ENTRIES: usize = 16;
/// Maximum children per branch before it splits.
pub const MAX_BRANCH_CHILDREN: usize = 16;

const MIN_LEAF_ENTRIES: usize = MAX_LEAF_ENTRIES / 2;
const MIN_BRANCH_CHILDREN: usize = MAX_BRANCH_CHILDREN / 2;

/// The values stored under one key.
///
/// Non-DUPSORT databases always hold `Single`. DUPSORT databases hold a
/// sorted, deduplicated list.
#[derive(Debug, Clone)]
pub enum ValueSet {
    Single(Arc<[u8]>),
    Sorted(Vec<Arc<[u8]>>),
}

impl ValueSet {
    pub fn entry_count(&self) -> u64 {
        match self {
            ValueSet::Single(_) => 1,
            ValueSet::Sorted(v) => v.len() as u64,
        }
    }

    pub fn first(&self) -> &[u8] {
        match self {
            ValueSet::Single(v) => v,
            ValueSet::Sorted(v) => &v[0],
        }
    }

    pub fn value_at(&self, idx: usize) -> Option<&[u8]> {
        match self {
            ValueSet::Single(v) => (idx == 0).then(|| v.as_ref()),
            ValueSet::Sorted(v) => v.get(idx).map(|v| v.as_ref()),
        }
    }

    /// Index of the first value `>= probe` (or `> probe` when `exclusive`).
    pub fn seek(&self, probe: &[u8], exclusive: bool) -> usize {
        match self {
            ValueSet::Single(v) => {
                let ord = v.as_ref().cmp(probe);
                if ord == Ordering::Less || (exclusive && ord == Ordering::Equal) {
                    1
                } else {
                    0
                }
            }
            ValueSet::Sorted(vals) => vals.partition_point(|v| {
                let ord = v.as_ref().cmp(probe);
                ord == Ordering::Less || (exclusive && ord == Ordering::Equal)
            }),
        }
    }

    pub(crate) fn arc_at(&self, idx: usize) -> Option<Arc<[u8]>> {
        match self {
            ValueSet::Single(v) => (idx == 0).then(|| v.clone()),
            ValueSet::Sorted(v) => v.get(idx).cloned(),
        }
    }
}

#[derive(Debug)]
struct Leaf {
    /// Longest common prefix of all keys in this leaf (empty when prefix
    /// compression is off).
    prefix: Vec<u8>,
    entries: Vec<LeafEntry>,
}

#[derive(Debug, Clone)]
struct LeafEntry {
    suffix: Vec<u8>,
    values: ValueSet,
}

#[derive(Debug)]
struct Branch {
    /// `seps[i]` is the smallest key reachable under `children[i + 1]`.
    seps: Vec<Vec<u8>>,
    children: Vec<Arc<Node>>,
    key_total: u64,
    entry_total: u64,
}

#[derive(Debug)]
enum Node {
    Leaf(Leaf),
    Branch(Branch),
}

/// Compare the split key `prefix ++ suffix` against `other`.
fn cmp_split_key(prefix: &[u8], suffix: &[u8], other: &[u8]) -> Ordering {
    if other.len() <= prefix.len() {
        match prefix[..other.len()].cmp(other) {
            Ordering::Equal => {
                if prefix.len() > other.len() || !suffix.is_empty() {
                    Ordering::Greater
                } else {
                    Ordering::Equal
                }
            }
            ord => ord,
        }
    } else {
        match prefix.cmp(&other[..prefix.len()]) {
            Ordering::Equal => suffix.cmp(&other[prefix.len()..]),
            ord => ord,
        }
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

impl Leaf {
    fn build(expanded: Vec<(Vec<u8>, ValueSet)>, compress: bool) -> Leaf {
        let prefix = if compress && expanded.len() > 1 {
            let mut lcp = expanded[0].0.clone();
            for (key, _) in &expanded[1..] {
                let n = common_prefix_len(&lcp, key);
                lcp.truncate(n);
                if lcp.is_empty() {
                    break;
                }
            }
            lcp
        } else {
            Vec::new()
        };
        let entries = expanded
            .into_iter()
            .map(|(key, values)| LeafEntry {
                suffix: key[prefix.len()..].to_vec(),
                values,
            })
            .collect();
        Leaf { prefix, entries }
    }

    fn expand(&self) -> Vec<(Vec<u8>, ValueSet)> {
        self.entries
            .iter()
            .map(|e| (self.full_key(e), e.values.clone()))
            .collect()
    }

    fn full_key(&self, entry: &LeafEntry) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.prefix.len() + entry.suffix.len());
        key.extend_from_slice(&self.prefix);
        key.extend_from_slice(&entry.suffix);
        key
    }

    /// Binary search for `key`, comparing against prefix + suffix without
    /// materializing full keys.
    fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries
            .binary_search_by(|e| cmp_split_key(&self.prefix, &e.suffix, key))
    }

    fn key_count(&self) -> u64 {
        self.entries.len() as u64
    }

    fn entry_count(&self) -> u64 {
        self.entries.iter().map(|e| e.values.entry_count()).sum()
    }
}

impl Branch {
    fn build(children: Vec<Arc<Node>>, seps: Vec<Vec<u8>>) -> Branch {
        debug_assert_eq!(seps.len() + 1, children.len());
        let key_total = children.iter().map(|c| c.key_count()).sum();
        let entry_total = children.iter().map(|c| c.entry_count()).sum();
        Branch {
            seps,
            children,
            key_total,
            entry_total,
        }
    }

    /// Index of the child whose key range covers `key`.
    fn child_for(&self, key: &[u8]) -> usize {
        self.seps.partition_point(|s| s.as_slice() <= key)
    }
}

impl Node {
    fn key_count(&self) -> u64 {
        match self {
            Node::Leaf(l) => l.key_count(),
            Node::Branch(b) => b.key_total,
        }
    }

    fn entry_count(&self) -> u64 {
        match self {
            Node::Leaf(l) => l.entry_count(),
            Node::Branch(b) => b.entry_total,
        }
    }

    fn first_key(&self) -> Vec<u8> {
        match self {
            Node::Leaf(l) => l.full_key(&l.entries[0]),
            Node::Branch(b) => b.children[0].first_key(),
        }
    }

    fn is_underfull(&self) -> bool {
        match self {
            Node::Leaf(l) => l.entries.len() < MIN_LEAF_ENTRIES,
            Node::Branch(b) => b.children.len() < MIN_BRANCH_CHILDREN,
        }
    }
}

/// Location of a key in rank space.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyLocation {
    /// Distinct keys strictly less than the probe.
    pub keys_before: u64,
    /// Entries strictly before the probe key's first entry.
    pub entries_before: u64,
    /// Whether the probe key exists.
    pub found: bool,
    /// Entry count under the probe key (0 when absent).
    pub dup_count: u64,
}

enum InsertResult {
    One(Arc<Node>),
    Split(Arc<Node>, Vec<u8>, Arc<Node>),
    Unchanged,
}

enum DeleteResult {
    One(Option<Arc<Node>>),
    Unchanged,
}

/// A persistent counted ordered tree. Cheap to clone; clones share nodes.
#[derive(Debug, Clone)]
pub struct CountedTree {
    root: Option<Arc<Node>>,
    dup_sort: bool,
    prefix_compression: bool,
}

impl CountedTree {
    pub fn new(dup_sort: bool, prefix_compression: bool) -> CountedTree {
        CountedTree {
            root: None,
            dup_sort,
            prefix_compression,
        }
    }

    pub fn dup_sort(&self) -> bool {
        self.dup_sort
    }

    /// Total distinct keys.
    pub fn key_total(&self) -> u64 {
        self.root.as_ref().map_or(0, |r| r.key_count())
    }

    /// Total entries, duplicate values counted individually.
    pub fn entry_total(&self) -> u64 {
        self.root.as_ref().map_or(0, |r| r.entry_count())
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn get(&self, key: &[u8]) -> Option<ValueSet> {
        let mut node = self.root.as_deref()?;
        loop {
            match node {
                Node::Branch(b) => node = &b.children[b.child_for(key)],
                Node::Leaf(l) => {
                    return l.search(key).ok().map(|i| l.entries[i].values.clone());
                }
            }
        }
    }

    /// Rank information for `key`, whether or not it exists.
    pub fn locate_key(&self, key: &[u8]) -> KeyLocation {
        let mut loc = KeyLocation::default();
        let mut node = match self.root.as_deref() {
            Some(n) => n,
            None => return loc,
        };
        loop {
            match node {
                Node::Branch(b) => {
                    let idx = b.child_for(key);
                    for child in &b.children[..idx] {
                        loc.keys_before += child.key_count();
                        loc.entries_before += child.entry_count();
                    }
                    node = &b.children[idx];
                }
                Node::Leaf(l) => {
                    let (idx, found) = match l.search(key) {
                        Ok(i) => (i, true),
                        Err(i) => (i, false),
                    };
                    loc.keys_before += idx as u64;
                    loc.entries_before += l.entries[..idx]
                        .iter()
                        .map(|e| e.values.entry_count())
                        .sum::<u64>();
                    loc.found = found;
                    if found {
                        loc.dup_count = l.entries[idx].values.entry_count();
                    }
                    return loc;
                }
            }
        }
    }

    /// Key at distinct-key rank `rank`, if any.
    pub fn key_at(&self, rank: u64) -> Option<Vec<u8>> {
        let mut node = self.root.as_deref()?;
        if rank >= node.key_count() {
            return None;
        }
        let mut rank = rank;
        loop {
            match node {
                Node::Branch(b) => {
                    for child in &b.children {
                        let n = child.key_count();
                        if rank < n {
                            node = child;
                            break;
                        }
                        rank -= n;
                    }
                }
                Node::Leaf(l) => {
                    let entry = &l.entries[rank as usize];
                    return Some(l.full_key(entry));
                }
            }
        }
    }

    /// Entry at duplicate-counted rank `rank`, if any.
    pub fn entry_at(&self, rank: u64) -> Option<(Vec<u8>, Arc<[u8]>)> {
        let mut node = self.root.as_deref()?;
        if rank >= node.entry_count() {
            return None;
        }
        let mut rank = rank;
        loop {
            match node {
                Node::Branch(b) => {
                    for child in &b.children {
                        let n = child.entry_count();
                        if rank < n {
                            node = child;
                            break;
                        }
                        rank -= n;
                    }
                }
                Node::Leaf(l) => {
                    for entry in &l.entries {
                        let n = entry.values.entry_count();
                        if rank < n {
                            let value = entry.values.arc_at(rank as usize)?;
                            return Some((l.full_key(entry), value));
                        }
                        rank -= n;
                    }
                    unreachable!("entry rank inside leaf bounds");
                }
            }
        }
    }

    /// Insert or replace. Returns `(tree, changed)` where `changed` is false
    /// only when a DUPSORT insert found the exact (key, value) pair present.
    pub fn put(&self, key: &[u8], value: &[u8]) -> (CountedTree, bool) {
        let value: Arc<[u8]> = Arc::from(value);
        let result = match self.root.as_deref() {
            None => {
                let leaf = Leaf::build(
                    vec![(key.to_vec(), self.new_value_set(value))],
                    self.prefix_compression,
                );
                InsertResult::One(Arc::new(Node::Leaf(leaf)))
            }
            Some(node) => self.insert_into(node, key, value),
        };
        match result {
            InsertResult::Unchanged => (self.clone(), false),
            InsertResult::One(root) => (self.with_root(Some(root)), true),
            InsertResult::Split(left, sep, right) => {
                let root = Arc::new(Node::Branch(Branch::build(vec![left, right], vec![sep])));
                (self.with_root(Some(root)), true)
            }
        }
    }

    /// Delete a key (value `None`), or one duplicate value under a key.
    /// Returns `(tree, removed)`.
    pub fn del(&self, key: &[u8], value: Option<&[u8]>) -> (CountedTree, bool) {
        let result = match self.root.as_deref() {
            None => DeleteResult::Unchanged,
            Some(node) => self.delete_from(node, key, value),
        };
        match result {
            DeleteResult::Unchanged => (self.clone(), false),
            DeleteResult::One(root) => {
                // Collapse single-child chains at the root.
                let mut root = root;
                while let Some(node) = root.as_deref() {
                    match node {
                        Node::Branch(b) if b.children.len() == 1 => {
                            root = Some(b.children[0].clone());
                        }
                        _ => break,
                    }
                }
                (self.with_root(root), true)
            }
        }
    }

    /// Drop every entry.
    pub fn clear(&self) -> CountedTree {
        self.with_root(None)
    }

    fn with_root(&self, root: Option<Arc<Node>>) -> CountedTree {
        CountedTree {
            root,
            dup_sort: self.dup_sort,
            prefix_compression: self.prefix_compression,
        }
    }

    fn new_value_set(&self, value: Arc<[u8]>) -> ValueSet {
        if self.dup_sort {
            ValueSet::Sorted(vec![value])
        } else {
            ValueSet::Single(value)
        }
    }

    fn insert_into(&self, node: &Node, key: &[u8], value: Arc<[u8]>) -> InsertResult {
        match node {
            Node::Leaf(leaf) => {
                let mut expanded = leaf.expand();
                match leaf.search(key) {
                    Ok(idx) => {
                        if self.dup_sort {
                            let values = match &mut expanded[idx].1 {
                                ValueSet::Sorted(v) => v,
                                ValueSet::Single(_) => {
                                    unreachable!("dupsort tree holds sorted value sets")
                                }
                            };
                            match values.binary_search_by(|v| v.as_ref().cmp(value.as_ref())) {
                                Ok(_) => return InsertResult::Unchanged,
                                Err(pos) => values.insert(pos, value),
                            }
                        } else {
                            expanded[idx].1 = ValueSet::Single(value);
                        }
                    }
                    Err(idx) => {
                        expanded.insert(idx, (key.to_vec(), self.new_value_set(value)));
                    }
                }
                self.rebuild_leaf(expanded)
            }
            Node::Branch(branch) => {
                let idx = branch.child_for(key);
                match self.insert_into(&branch.children[idx], key, value) {
                    InsertResult::Unchanged => InsertResult::Unchanged,
                    InsertResult::One(child) => {
                        let mut children = branch.children.clone();
                        children[idx] = child;
                        InsertResult::One(Arc::new(Node::Branch(Branch::build(
                            children,
                            branch.seps.clone(),
                        ))))
                    }
                    InsertResult::Split(left, sep, right) => {
                        let mut children = branch.children.clone();
                        let mut seps = branch.seps.clone();
                        children[idx] = left;
                        children.insert(idx + 1, right);
                        seps.insert(idx, sep);
                        self.rebuild_branch(children, seps)
                    }
                }
            }
        }
    }

    fn rebuild_leaf(&self, mut expanded: Vec<(Vec<u8>, ValueSet)>) -> InsertResult {
        if expanded.len() > MAX_LEAF_ENTRIES {
            let mid = expanded.len() / 2;
            let right_half = expanded.split_off(mid);
            let sep = right_half[0].0.clone();
            let left = Arc::new(Node::Leaf(Leaf::build(expanded, self.prefix_compression)));
            let right = Arc::new(Node::Leaf(Leaf::build(right_half, self.prefix_compression)));
            InsertResult::Split(left, sep, right)
        } else {
            InsertResult::One(Arc::new(Node::Leaf(Leaf::build(
                expanded,
                self.prefix_compression,
            ))))
        }
    }

    fn rebuild_branch(&self, children: Vec<Arc<Node>>, seps: Vec<Vec<u8>>) -> InsertResult {
        if children.len() > MAX_BRANCH_CHILDREN {
            let mid = children.len() / 2;
            let mut children = children;
            let mut seps = seps;
            let right_children = children.split_off(mid);
            let sep = seps[mid - 1].clone();
            let right_seps = seps.split_off(mid);
            seps.pop(); // the separator promoted upward
            let left = Arc::new(Node::Branch(Branch::build(children, seps)));
            let right = Arc::new(Node::Branch(Branch::build(right_children, right_seps)));
            InsertResult::Split(left, sep, right)
        } else {
            InsertResult::One(Arc::new(Node::Branch(Branch::build(children, seps))))
        }
    }

    fn delete_from(&self, node: &Node, key: &[u8], value: Option<&[u8]>) -> DeleteResult {
        match node {
            Node::Leaf(leaf) => {
                let idx = match leaf.search(key) {
                    Ok(i) => i,
                    Err(_) => return DeleteResult::Unchanged,
                };
                let mut expanded = leaf.expand();
                let remove_entry = match (value, &mut expanded[idx].1) {
                    (Some(v), ValueSet::Sorted(vals)) => {
                        match vals.binary_search_by(|x| x.as_ref().cmp(v)) {
                            Ok(pos) => {
                                vals.remove(pos);
                                vals.is_empty()
                            }
                            Err(_) => return DeleteResult::Unchanged,
                        }
                    }
                    (Some(v), ValueSet::Single(existing)) => {
                        if existing.as_ref() != v {
                            return DeleteResult::Unchanged;
                        }
                        true
                    }
                    (None, _) => true,
                };
                if remove_entry {
                    expanded.remove(idx);
                }
                if expanded.is_empty() {
                    DeleteResult::One(None)
                } else {
                    DeleteResult::One(Some(Arc::new(Node::Leaf(Leaf::build(
                        expanded,
                        self.prefix_compression,
                    )))))
                }
            }
            Node::Branch(branch) => {
                let idx = branch.child_for(key);
                match self.delete_from(&branch.children[idx], key, value) {
                    DeleteResult::Unchanged => DeleteResult::Unchanged,
                    DeleteResult::One(child) => {
                        let mut children = branch.children.clone();
                        let mut seps = branch.seps.clone();
                        match child {
                            Some(child) => {
                                children[idx] = child;
                                self.rebalance(&mut children, &mut seps, idx);
                            }
                            None => {
                                children.remove(idx);
                                if idx == 0 {
                                    if !seps.is_empty() {
                                        seps.remove(0);
                                    }
                                } else {
                                    seps.remove(idx - 1);
                                }
                            }
                        }
                        if children.is_empty() {
                            DeleteResult::One(None)
                        } else {
                            DeleteResult::One(Some(Arc::new(Node::Branch(Branch::build(
                                children, seps,
                            )))))
                        }
                    }
                }
            }
        }
    }

    /// Merge or borrow when `children[idx]` dropped below the minimum fill.
    fn rebalance(&self, children: &mut Vec<Arc<Node>>, seps: &mut Vec<Vec<u8>>, idx: usize) {
        if !children[idx].is_underfull() || children.len() < 2 {
            return;
        }
        let (left_idx, right_idx) = if idx > 0 { (idx - 1, idx) } else { (idx, idx + 1) };
        let merged = self.merge_or_borrow(&children[left_idx], &children[right_idx]);
        match merged {
            Merged::One(node) => {
                children[left_idx] = node;
                children.remove(right_idx);
                seps.remove(left_idx);
            }
            Merged::Two(left, right) => {
                seps[left_idx] = right.first_key();
                children[left_idx] = left;
                children[right_idx] = right;
            }
        }
    }

    fn merge_or_borrow(&self, left: &Arc<Node>, right: &Arc<Node>) -> Merged {
        match (left.as_ref(), right.as_ref()) {
            (Node::Leaf(l), Node::Leaf(r)) => {
                let mut expanded = l.expand();
                expanded.extend(r.expand());
                if expanded.len() <= MAX_LEAF_ENTRIES {
                    Merged::One(Arc::new(Node::Leaf(Leaf::build(
                        expanded,
                        self.prefix_compression,
                    ))))
                } else {
                    let mid = expanded.len() / 2;
                    let right_half = expanded.split_off(mid);
                    Merged::Two(
                        Arc::new(Node::Leaf(Leaf::build(expanded, self.prefix_compression))),
                        Arc::new(Node::Leaf(Leaf::build(right_half, self.prefix_compression))),
                    )
                }
            }
            (Node::Branch(l), Node::Branch(r)) => {
                let mut children = l.children.clone();
                let mut seps = l.seps.clone();
                seps.push(r.children[0].first_key());
                seps.extend(r.seps.iter().cloned());
                children.extend(r.children.iter().cloned());
                if children.len() <= MAX_BRANCH_CHILDREN {
                    Merged::One(Arc::new(Node::Branch(Branch::build(children, seps))))
                } else {
                    let mid = children.len() / 2;
                    let right_children = children.split_off(mid);
                    let right_seps = seps.split_off(mid);
                    seps.pop();
                    Merged::Two(
                        Arc::new(Node::Branch(Branch::build(children, seps))),
                        Arc::new(Node::Branch(Branch::build(right_children, right_seps))),
                    )
                }
            }
            _ => unreachable!("siblings are at the same depth"),
        }
    }
}

enum Merged {
    One(Arc<Node>),
    Two(Arc<Node>, Arc<Node>),
}

// ============================================================================
// Rank-positioned iteration
// ============================================================================

/// In-order entry walker starting at a duplicate-counted rank.
///
/// Holds `Arc` clones of the path, so it stays valid on its snapshot even if
/// the owning tree handle is mutated afterwards.
pub struct EntryWalker {
    stack: Vec<(Arc<Node>, usize)>,
    dup_idx: usize,
}

impl CountedTree {
    /// Walker positioned so that its first `next()` yields the entry at
    /// `rank` (or nothing when `rank >= entry_total`).
    pub fn walk_entries_from(&self, rank: u64) -> EntryWalker {
        let mut walker = EntryWalker {
            stack: Vec::new(),
            dup_idx: 0,
        };
        let root = match &self.root {
            Some(r) => r.clone(),
            None => return walker,
        };
        if rank >= root.entry_count() {
            return walker;
        }
        let mut rank = rank;
        let mut node = root;
        loop {
            match node.as_ref() {
                Node::Branch(b) => {
                    let mut next = None;
                    for (i, child) in b.children.iter().enumerate() {
                        let n = child.entry_count();
                        if rank < n {
                            next = Some((i, child.clone()));
                            break;
                        }
                        rank -= n;
                    }
                    let (i, child) = next.expect("rank inside subtree bounds");
                    walker.stack.push((node.clone(), i));
                    node = child;
                }
                Node::Leaf(l) => {
                    let mut entry_idx = 0;
                    for (i, entry) in l.entries.iter().enumerate() {
                        let n = entry.values.entry_count();
                        if rank < n {
                            entry_idx = i;
                            walker.dup_idx = rank as usize;
                            break;
                        }
                        rank -= n;
                    }
                    walker.stack.push((node, entry_idx));
                    return walker;
                }
            }
        }
    }
}

/// In-order distinct-key walker starting at a key rank.
pub struct KeyWalker {
    stack: Vec<(Arc<Node>, usize)>,
}

impl CountedTree {
    /// Walker positioned so that its first `next()` yields the key at
    /// distinct-key rank `rank`.
    pub fn walk_keys_from(&self, rank: u64) -> KeyWalker {
        let mut walker = KeyWalker { stack: Vec::new() };
        let root = match &self.root {
            Some(r) => r.clone(),
            None => return walker,
        };
        if rank >= root.key_count() {
            return walker;
        }
        let mut rank = rank;
        let mut node = root;
        loop {
            match node.as_ref() {
                Node::Branch(b) => {
                    let mut next = None;
                    for (i, child) in b.children.iter().enumerate() {
                        let n = child.key_count();
                        if rank < n {
                            next = Some((i, child.clone()));
                            break;
                        }
                        rank -= n;
                    }
                    let (i, child) = next.expect("rank inside subtree bounds");
                    walker.stack.push((node.clone(), i));
                    node = child;
                }
                Node::Leaf(_) => {
                    walker.stack.push((node, rank as usize));
                    return walker;
                }
            }
        }
    }
}

impl KeyWalker {
    /// Yield the current key and advance to the next distinct key.
    pub fn next(&mut self) -> Option<Vec<u8>> {
        let key = {
            let (node, entry_idx) = self.stack.last()?;
            let leaf = match node.as_ref() {
                Node::Leaf(l) => l,
                Node::Branch(_) => unreachable!("walker stack bottoms at a leaf"),
            };
            leaf.full_key(leaf.entries.get(*entry_idx)?)
        };
        self.advance();
        Some(key)
    }

    fn advance(&mut self) {
        let (node, entry_idx) = match self.stack.last_mut() {
            Some(top) => top,
            None => return,
        };
        let leaf = match node.as_ref() {
            Node::Leaf(l) => l,
            Node::Branch(_) => unreachable!("walker stack bottoms at a leaf"),
        };
        *entry_idx += 1;
        if *entry_idx < leaf.entries.len() {
            return;
        }
        self.stack.pop();
        while let Some((node, idx)) = self.stack.last_mut() {
            let branch = match node.as_ref() {
                Node::Branch(b) => b,
                Node::Leaf(_) => unreachable!("inner stack frames are branches"),
            };
            *idx += 1;
            if *idx < branch.children.len() {
                let mut child = branch.children[*idx].clone();
                loop {
                    match child.as_ref() {
                        Node::Branch(b) => {
                            let next = b.children[0].clone();
                            self.stack.push((child, 0));
                            child = next;
                        }
                        Node::Leaf(_) => {
                            self.stack.push((child, 0));
                            return;
                        }
                    }
                }
            }
            self.stack.pop();
        }
    }
}

impl EntryWalker {
    /// Yield the current entry and advance one position.
    pub fn next(&mut self) -> Option<(Vec<u8>, Arc<[u8]>)> {
        let (key, value) = {
            let (node, entry_idx) = self.stack.last()?;
            let leaf = match node.as_ref() {
                Node::Leaf(l) => l,
                Node::Branch(_) => unreachable!("walker stack bottoms at a leaf"),
            };
            let entry = &leaf.entries[*entry_idx];
            let value = entry.values.arc_at(self.dup_idx)?;
            (leaf.full_key(entry), value)
        };
        self.advance();
        Some((key, value))
    }

    fn advance(&mut self) {
        let (node, entry_idx) = match self.stack.last_mut() {
            Some(top) => top,
            None => return,
        };
        let leaf = match node.as_ref() {
            Node::Leaf(l) => l,
            Node::Branch(_) => unreachable!("walker stack bottoms at a leaf"),
        };
        self.dup_idx += 1;
        if (self.dup_idx as u64) < leaf.entries[*entry_idx].values.entry_count() {
            return;
        }
        self.dup_idx = 0;
        *entry_idx += 1;
        if *entry_idx < leaf.entries.len() {
            return;
        }
        // Climb until a branch has a next child, then descend to its
        // leftmost leaf.
        self.stack.pop();
        while let Some((node, idx)) = self.stack.last_mut() {
            let branch = match node.as_ref() {
                Node::Branch(b) => b,
                Node::Leaf(_) => unreachable!("inner stack frames are branches"),
            };
            *idx += 1;
            if *idx < branch.children.len() {
                let mut child = branch.children[*idx].clone();
                loop {
                    match child.as_ref() {
                        Node::Branch(b) => {
                            let next = b.children[0].clone();
                            self.stack.push((child, 0));
                            child = next;
                        }
                        Node::Leaf(_) => {
                            self.stack.push((child, 0));
                            return;
                        }
                    }
                }
            }
            self.stack.pop();
        }
    }
}
