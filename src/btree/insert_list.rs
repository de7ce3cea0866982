use std::{
    cmp::Ordering as CmpOrdering,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
};

use rand::Rng;

use crate::{
    btree::update::UpdateChain,
    types::Recno,
    utils::HandyRwLock,
};

/// Maximum skip list depth. Level draws use probability 1/4 per level.
pub const SKIP_MAX_DEPTH: usize = 10;

/// Key of an insert node: raw bytes for row stores, a record number for
/// column stores. The two never mix within one list.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum InsertKey {
    Row(Vec<u8>),
    Recno(Recno),
}

impl InsertKey {
    pub fn as_row(&self) -> &[u8] {
        match self {
            InsertKey::Row(k) => k,
            InsertKey::Recno(_) => panic!("recno key in a row-store context"),
        }
    }

    pub fn as_recno(&self) -> Recno {
        match self {
            InsertKey::Recno(r) => *r,
            InsertKey::Row(_) => panic!("row key in a column-store context"),
        }
    }

    pub fn mem_size(&self) -> usize {
        match self {
            InsertKey::Row(k) => k.len(),
            InsertKey::Recno(_) => std::mem::size_of::<Recno>(),
        }
    }
}

/// A key not present in the on-page image, plus its update chain. The
/// node owns its key bytes; forward pointers are managed by the owning
/// list.
#[derive(Debug)]
pub struct InsertNode {
    pub key: InsertKey,
    pub chain: UpdateChain,
    next: Vec<RwLock<Option<Arc<InsertNode>>>>,
}

impl InsertNode {
    fn new(key: InsertKey, depth: usize) -> Self {
        let mut next = Vec::with_capacity(depth);
        for _ in 0..depth {
            next.push(RwLock::new(None));
        }
        Self {
            key,
            chain: UpdateChain::new(),
            next,
        }
    }

    pub fn depth(&self) -> usize {
        self.next.len()
    }

    /// Next node in key order (level 0 pointer).
    pub fn next_node(&self) -> Option<Arc<InsertNode>> {
        self.next[0].rl().clone()
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<InsertNode>() + self.key.mem_size() + self.chain.mem_size()
    }
}

fn random_depth() -> usize {
    let mut rng = rand::thread_rng();
    let mut depth = 1;
    while depth < SKIP_MAX_DEPTH && rng.gen_ratio(1, 4) {
        depth += 1;
    }
    depth
}

/// Bounded-depth skip list of insert nodes. Structural changes are
/// serialized by `write_lock`; readers follow forward pointers without
/// it. Nodes are linked bottom-up so a partially linked node is already
/// reachable in key order.
#[derive(Debug)]
pub struct InsertList {
    head: Vec<RwLock<Option<Arc<InsertNode>>>>,
    tail: Vec<RwLock<Option<Arc<InsertNode>>>>,
    write_lock: Mutex<()>,
    count: AtomicUsize,
}

impl Default for InsertList {
    fn default() -> Self {
        Self::new()
    }
}

impl InsertList {
    pub fn new() -> Self {
        let mut head = Vec::with_capacity(SKIP_MAX_DEPTH);
        let mut tail = Vec::with_capacity(SKIP_MAX_DEPTH);
        for _ in 0..SKIP_MAX_DEPTH {
            head.push(RwLock::new(None));
            tail.push(RwLock::new(None));
        }
        Self {
            head,
            tail,
            write_lock: Mutex::new(()),
            count: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn first(&self) -> Option<Arc<InsertNode>> {
        self.head[0].rl().clone()
    }

    pub fn last(&self) -> Option<Arc<InsertNode>> {
        self.tail[0].rl().clone()
    }

    /// Exact-match search.
    pub fn find(&self, key: &InsertKey) -> Option<Arc<InsertNode>> {
        let (node, cmp) = self.search_near(key);
        match (node, cmp) {
            (Some(n), CmpOrdering::Equal) => Some(n),
            _ => None,
        }
    }

    /// Find the largest node whose key is <= `key`. Returns the node and
    /// how its key compares to the sought key, or None when every node
    /// is greater (or the list is empty).
    pub fn search_near(&self, key: &InsertKey) -> (Option<Arc<InsertNode>>, CmpOrdering) {
        let mut level = SKIP_MAX_DEPTH;
        let mut prev: Option<Arc<InsertNode>> = None;

        while level > 0 {
            level -= 1;
            loop {
                let next = match &prev {
                    Some(p) if p.depth() > level => p.next[level].rl().clone(),
                    Some(_) => break, // node too shallow, drop a level
                    None => self.head[level].rl().clone(),
                };
                match next {
                    Some(n) => match n.key.cmp(key) {
                        CmpOrdering::Less => prev = Some(n),
                        CmpOrdering::Equal => return (Some(n), CmpOrdering::Equal),
                        CmpOrdering::Greater => break,
                    },
                    None => break,
                }
            }
        }

        match prev {
            Some(n) => (Some(n), CmpOrdering::Less),
            None => (None, CmpOrdering::Greater),
        }
    }

    /// Smallest node with key strictly greater than `key`.
    pub fn next_after(&self, key: &InsertKey) -> Option<Arc<InsertNode>> {
        let (node, cmp) = self.search_near(key);
        match (node, cmp) {
            (Some(n), _) => {
                // n.key <= key, advance along level 0
                let mut cur = n.next_node();
                while let Some(c) = cur {
                    if c.key > *key {
                        return Some(c);
                    }
                    cur = c.next_node();
                }
                None
            }
            (None, _) => {
                // every node is greater, the first one qualifies
                self.first()
            }
        }
    }

    /// Largest node with key strictly less than `key`.
    pub fn prev_before(&self, key: &InsertKey) -> Option<Arc<InsertNode>> {
        let (node, cmp) = self.search_near(key);
        match (node, cmp) {
            (Some(n), CmpOrdering::Less) => Some(n),
            (Some(n), _) => {
                // exact match, walk level 0 from the head to its
                // predecessor; tail pointers only help at the very end
                let mut prev: Option<Arc<InsertNode>> = None;
                let mut cur = self.first();
                while let Some(c) = cur {
                    if Arc::ptr_eq(&c, &n) {
                        return prev;
                    }
                    prev = Some(c.clone());
                    cur = c.next_node();
                }
                None
            }
            (None, _) => None,
        }
    }

    /// Find the node for `key`, creating it if absent. The bool reports
    /// whether the node was created by this call.
    pub fn insert_or_get(&self, key: InsertKey) -> (Arc<InsertNode>, bool) {
        let _guard = self.write_lock.lock().unwrap();

        if let Some(existing) = self.find(&key) {
            return (existing, false);
        }

        let depth = random_depth();
        let node = Arc::new(InsertNode::new(key, depth));

        // collect per-level predecessors
        let mut preds: Vec<Option<Arc<InsertNode>>> = vec![None; SKIP_MAX_DEPTH];
        let mut prev: Option<Arc<InsertNode>> = None;
        let mut level = SKIP_MAX_DEPTH;
        while level > 0 {
            level -= 1;
            loop {
                let next = match &prev {
                    Some(p) if p.depth() > level => p.next[level].rl().clone(),
                    Some(_) => break,
                    None => self.head[level].rl().clone(),
                };
                match next {
                    Some(n) if n.key < node.key => prev = Some(n),
                    _ => break,
                }
            }
            preds[level] = prev.clone();
        }

        // link bottom-up: set the node's forward pointers first, then
        // publish it in predecessor/head pointers
        for level in 0..depth {
            let succ = match &preds[level] {
                Some(p) => p.next[level].rl().clone(),
                None => self.head[level].rl().clone(),
            };
            *node.next[level].wl() = succ.clone();
            if succ.is_none() {
                *self.tail[level].wl() = Some(Arc::clone(&node));
            }
        }
        for level in 0..depth {
            match &preds[level] {
                Some(p) => *p.next[level].wl() = Some(Arc::clone(&node)),
                None => *self.head[level].wl() = Some(Arc::clone(&node)),
            }
        }

        self.count.fetch_add(1, Ordering::AcqRel);
        (node, true)
    }

    /// Unlink and return the last node. Used by the insert split to
    /// migrate the trailing node to a new sibling page.
    pub fn remove_last(&self) -> Option<Arc<InsertNode>> {
        let _guard = self.write_lock.lock().unwrap();

        let last = self.tail[0].rl().clone()?;

        for level in 0..SKIP_MAX_DEPTH {
            // find the predecessor of `last` on this level
            let mut prev: Option<Arc<InsertNode>> = None;
            let mut cur = self.head[level].rl().clone();
            let mut found = false;
            while let Some(c) = cur {
                if Arc::ptr_eq(&c, &last) {
                    found = true;
                    break;
                }
                cur = if c.depth() > level {
                    let n = c.next[level].rl().clone();
                    prev = Some(c);
                    n
                } else {
                    None
                };
            }
            if !found {
                continue;
            }
            match &prev {
                Some(p) => *p.next[level].wl() = None,
                None => *self.head[level].wl() = None,
            }
            *self.tail[level].wl() = prev;
        }

        self.count.fetch_sub(1, Ordering::AcqRel);
        Some(last)
    }

    /// Re-home an already-built node into this (empty or small) list.
    /// Used when a split migrates nodes between pages.
    pub fn adopt(&self, node: Arc<InsertNode>) {
        self.insert_node_internal(node);
    }

    fn insert_node_internal(&self, node: Arc<InsertNode>) {
        let _guard = self.write_lock.lock().unwrap();
        let depth = node.depth();

        let mut preds: Vec<Option<Arc<InsertNode>>> = vec![None; SKIP_MAX_DEPTH];
        let mut prev: Option<Arc<InsertNode>> = None;
        let mut level = SKIP_MAX_DEPTH;
        while level > 0 {
            level -= 1;
            loop {
                let next = match &prev {
                    Some(p) if p.depth() > level => p.next[level].rl().clone(),
                    Some(_) => break,
                    None => self.head[level].rl().clone(),
                };
                match next {
                    Some(n) if n.key < node.key => prev = Some(n),
                    _ => break,
                }
            }
            preds[level] = prev.clone();
        }

        for level in 0..depth {
            let succ = match &preds[level] {
                Some(p) => p.next[level].rl().clone(),
                None => self.head[level].rl().clone(),
            };
            *node.next[level].wl() = succ.clone();
            if succ.is_none() {
                *self.tail[level].wl() = Some(Arc::clone(&node));
            }
        }
        for level in 0..depth {
            match &preds[level] {
                Some(p) => *p.next[level].wl() = Some(Arc::clone(&node)),
                None => *self.head[level].wl() = Some(Arc::clone(&node)),
            }
        }

        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// In-order iteration over the level-0 list. Robust against
    /// concurrent inserts: nodes added behind the cursor are skipped,
    /// nodes added ahead are picked up.
    pub fn iter(&self) -> InsertListIterator {
        InsertListIterator {
            next: self.first(),
        }
    }

    pub fn mem_size(&self) -> usize {
        let mut size = std::mem::size_of::<InsertList>();
        let mut cur = self.first();
        while let Some(n) = cur {
            size += n.mem_size();
            cur = n.next_node();
        }
        size
    }
}

pub struct InsertListIterator {
    next: Option<Arc<InsertNode>>,
}

impl Iterator for InsertListIterator {
    type Item = Arc<InsertNode>;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next.take()?;
        self.next = cur.next_node();
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(k: &str) -> InsertKey {
        InsertKey::Row(k.as_bytes().to_vec())
    }

    #[test]
    fn test_insert_and_order() {
        let list = InsertList::new();
        for k in ["m", "c", "x", "a", "t"] {
            list.insert_or_get(row(k));
        }
        assert_eq!(list.len(), 5);

        let keys: Vec<Vec<u8>> = list.iter().map(|n| n.key.as_row().to_vec()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec(), b"m".to_vec(), b"t".to_vec(), b"x".to_vec()]);

        assert_eq!(list.first().unwrap().key, row("a"));
        assert_eq!(list.last().unwrap().key, row("x"));
    }

    #[test]
    fn test_search_near_sides() {
        let list = InsertList::new();
        for k in ["b", "d", "f"] {
            list.insert_or_get(row(k));
        }

        let (n, cmp) = list.search_near(&row("d"));
        assert_eq!(n.unwrap().key, row("d"));
        assert_eq!(cmp, CmpOrdering::Equal);

        let (n, cmp) = list.search_near(&row("e"));
        assert_eq!(n.unwrap().key, row("d"));
        assert_eq!(cmp, CmpOrdering::Less);

        let (n, cmp) = list.search_near(&row("a"));
        assert!(n.is_none());
        assert_eq!(cmp, CmpOrdering::Greater);

        assert_eq!(list.next_after(&row("b")).unwrap().key, row("d"));
        assert_eq!(list.next_after(&row("a")).unwrap().key, row("b"));
        assert!(list.next_after(&row("f")).is_none());

        assert_eq!(list.prev_before(&row("d")).unwrap().key, row("b"));
        assert!(list.prev_before(&row("b")).is_none());
    }

    #[test]
    fn test_remove_last() {
        let list = InsertList::new();
        for k in ["a", "b", "c"] {
            list.insert_or_get(row(k));
        }
        let last = list.remove_last().unwrap();
        assert_eq!(last.key, row("c"));
        assert_eq!(list.len(), 2);
        assert_eq!(list.last().unwrap().key, row("b"));

        list.remove_last();
        list.remove_last();
        assert!(list.remove_last().is_none());
        assert!(list.is_empty());
    }

    #[test]
    fn test_insert_or_get_dedup() {
        let list = InsertList::new();
        let (n1, created1) = list.insert_or_get(row("k"));
        let (n2, created2) = list.insert_or_get(row("k"));
        assert!(created1);
        assert!(!created2);
        assert!(Arc::ptr_eq(&n1, &n2));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_recno_keys() {
        let list = InsertList::new();
        for r in [5u64, 1, 9, 3] {
            list.insert_or_get(InsertKey::Recno(r));
        }
        let recnos: Vec<u64> = list.iter().map(|n| n.key.as_recno()).collect();
        assert_eq!(recnos, vec![1, 3, 5, 9]);
    }
}
