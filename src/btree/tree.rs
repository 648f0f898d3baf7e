//! Disk-resident B+tree over the primary `<table>:<docId>` key space.
//!
//! The tree owns no file handle: it is driven entirely through a [`NodeIo`]
//! callback pair, so the binary file engine and the WAL engine's snapshot
//! builder can both drive the same tree logic against different backing
//! stores (and tests can drive it against an in-memory `Vec<u8>`).

use std::collections::HashMap;

use super::node::{MAX_KEYS, MIN_KEYS, NODE_SIZE, Node, Payload};
use crate::errors::Result;

/// Raw page I/O. Offsets are always multiples of [`NODE_SIZE`].
pub trait NodeIo {
    /// # Errors
    /// Returns an error if the page cannot be read.
    fn read_bytes(&mut self, offset: u32) -> Result<[u8; NODE_SIZE]>;
    /// # Errors
    /// Returns an error if the page cannot be written.
    fn write_bytes(&mut self, offset: u32, bytes: &[u8; NODE_SIZE]) -> Result<()>;
}

const CACHE_EVICT_TRIGGER: f64 = 0.8;

struct CacheEntry {
    node: Node,
    last_used: u64,
}

/// The B+tree over a caller-supplied [`NodeIo`] backend.
pub struct BTree<IO: NodeIo> {
    io: IO,
    root_offset: Option<u32>,
    next_node_offset: u32,
    free_list: Vec<u32>,
    cache: HashMap<u32, CacheEntry>,
    cache_cap: usize,
    clock: u64,
}

impl<IO: NodeIo> BTree<IO> {
    #[must_use]
    pub fn new(io: IO, root_offset: Option<u32>, next_node_offset: u32, cache_cap: usize) -> Self {
        Self {
            io,
            root_offset,
            next_node_offset,
            free_list: Vec::new(),
            cache: HashMap::new(),
            cache_cap: cache_cap.max(1),
            clock: 0,
        }
    }

    #[must_use]
    pub fn root_offset(&self) -> Option<u32> {
        self.root_offset
    }

    #[must_use]
    pub fn next_node_offset(&self) -> u32 {
        self.next_node_offset
    }

    /// Seed the free list (e.g. from a persisted side-channel). Offsets not
    /// aligned to [`NODE_SIZE`] are silently dropped when popped.
    pub fn set_free_list(&mut self, offsets: Vec<u32>) {
        self.free_list = offsets;
    }

    #[must_use]
    pub fn free_list(&self) -> &[u32] {
        &self.free_list
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn into_io(self) -> IO {
        self.io
    }

    pub fn io_mut(&mut self) -> &mut IO {
        &mut self.io
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn cache_put(&mut self, offset: u32, node: Node) {
        let last_used = self.tick();
        self.cache.insert(offset, CacheEntry { node, last_used });
        let trigger = (self.cache_cap as f64 * CACHE_EVICT_TRIGGER) as usize;
        if self.cache.len() >= trigger.max(1) {
            self.evict_to(trigger);
        }
    }

    fn evict_to(&mut self, target: usize) {
        while self.cache.len() > target {
            let Some((&victim, _)) = self.cache.iter().min_by_key(|(_, e)| e.last_used) else {
                break;
            };
            self.cache.remove(&victim);
        }
    }

    fn read(&mut self, offset: u32) -> Result<Node> {
        if let Some(entry) = self.cache.get(&offset) {
            let node = entry.node.clone();
            let last_used = self.tick();
            if let Some(e) = self.cache.get_mut(&offset) {
                e.last_used = last_used;
            }
            return Ok(node);
        }
        let bytes = self.io.read_bytes(offset)?;
        let node = Node::decode(&bytes, u64::from(offset))?;
        self.cache_put(offset, node.clone());
        Ok(node)
    }

    fn write(&mut self, offset: u32, node: &Node) -> Result<()> {
        let bytes = node.encode()?;
        self.io.write_bytes(offset, &bytes)?;
        self.cache_put(offset, node.clone());
        Ok(())
    }

    fn alloc(&mut self) -> u32 {
        while let Some(offset) = self.free_list.pop() {
            if offset % (NODE_SIZE as u32) == 0 {
                return offset;
            }
            // Misaligned free offset: discard and keep popping.
        }
        let offset = self.next_node_offset;
        self.next_node_offset += NODE_SIZE as u32;
        offset
    }

    fn free(&mut self, offset: u32) {
        self.free_list.push(offset);
        self.cache.remove(&offset);
    }

    fn branch_index(keys: &[String], key: &str) -> usize {
        keys.partition_point(|k| k.as_str() <= key)
    }

    /// # Errors
    /// Returns an error on I/O failure or structural corruption.
    pub fn find(&mut self, key: &str) -> Result<Option<Payload>> {
        let Some(root) = self.root_offset else { return Ok(None) };
        let mut offset = root;
        loop {
            match self.read(offset)? {
                Node::Internal { keys, children, .. } => {
                    offset = children[Self::branch_index(&keys, key)];
                }
                Node::Leaf { keys, entries, .. } => {
                    return Ok(keys.binary_search(&key.to_string()).ok().map(|pos| entries[pos]));
                }
            }
        }
    }

    /// # Errors
    /// Returns an error on I/O failure or structural corruption.
    pub fn insert(&mut self, key: &str, payload: Payload) -> Result<()> {
        let Some(root) = self.root_offset else {
            let offset = self.alloc();
            let node = Node::Leaf {
                parent: None,
                next_leaf: None,
                keys: vec![key.to_string()],
                entries: vec![payload],
            };
            self.write(offset, &node)?;
            self.root_offset = Some(offset);
            return Ok(());
        };
        if let Some((promo_key, right_offset)) = self.insert_rec(root, key, payload)? {
            let new_root_offset = self.alloc();
            let mut left = self.read(root)?;
            left.set_parent(Some(new_root_offset));
            self.write(root, &left)?;
            let mut right = self.read(right_offset)?;
            right.set_parent(Some(new_root_offset));
            self.write(right_offset, &right)?;
            let new_root =
                Node::Internal { parent: None, keys: vec![promo_key], children: vec![root, right_offset] };
            self.write(new_root_offset, &new_root)?;
            self.root_offset = Some(new_root_offset);
        }
        Ok(())
    }

    fn insert_rec(&mut self, offset: u32, key: &str, payload: Payload) -> Result<Option<(String, u32)>> {
        let mut node = self.read(offset)?;
        match &mut node {
            Node::Leaf { keys, entries, .. } => {
                match keys.binary_search(&key.to_string()) {
                    Ok(pos) => entries[pos] = payload,
                    Err(pos) => {
                        keys.insert(pos, key.to_string());
                        entries.insert(pos, payload);
                    }
                }
                if node.key_count() > MAX_KEYS {
                    let split = self.split_leaf(&mut node)?;
                    self.write(offset, &node)?;
                    Ok(Some(split))
                } else {
                    self.write(offset, &node)?;
                    Ok(None)
                }
            }
            Node::Internal { keys, children, .. } => {
                let idx = Self::branch_index(keys, key);
                let child_offset = children[idx];
                let promoted = self.insert_rec(child_offset, key, payload)?;
                let Some((promo_key, right_offset)) = promoted else { return Ok(None) };
                if let Node::Internal { keys, children, .. } = &mut node {
                    keys.insert(idx, promo_key);
                    children.insert(idx + 1, right_offset);
                }
                if node.key_count() > MAX_KEYS {
                    let split = self.split_internal(&mut node)?;
                    self.write(offset, &node)?;
                    Ok(Some(split))
                } else {
                    self.write(offset, &node)?;
                    Ok(None)
                }
            }
        }
    }

    fn split_leaf(&mut self, node: &mut Node) -> Result<(String, u32)> {
        let Node::Leaf { parent, next_leaf, keys, entries } = node else {
            unreachable!("split_leaf called on non-leaf")
        };
        let mid = keys.len() / 2;
        let right_keys = keys.split_off(mid);
        let right_entries = entries.split_off(mid);
        let right_offset = self.alloc();
        let promoted_key = right_keys[0].clone();
        let right_node = Node::Leaf { parent: *parent, next_leaf: *next_leaf, keys: right_keys, entries: right_entries };
        *next_leaf = Some(right_offset);
        self.write(right_offset, &right_node)?;
        Ok((promoted_key, right_offset))
    }

    fn split_internal(&mut self, node: &mut Node) -> Result<(String, u32)> {
        let Node::Internal { parent, keys, children } = node else {
            unreachable!("split_internal called on non-internal")
        };
        let mid = keys.len() / 2;
        let promoted = keys.remove(mid);
        let right_keys = keys.split_off(mid);
        let right_children = children.split_off(mid + 1);
        let right_offset = self.alloc();
        for &child_offset in &right_children {
            let mut child = self.read(child_offset)?;
            child.set_parent(Some(right_offset));
            self.write(child_offset, &child)?;
        }
        let right_node = Node::Internal { parent: *parent, keys: right_keys, children: right_children };
        self.write(right_offset, &right_node)?;
        Ok((promoted, right_offset))
    }

    /// Insert a sorted (or to-be-sorted) batch via bottom-up bulk load,
    /// replacing whatever tree currently exists.
    ///
    /// # Errors
    /// Returns an error on I/O failure.
    pub fn bulk_insert(&mut self, mut entries: Vec<(String, Payload)>) -> Result<()> {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        self.clear_cache();
        if entries.is_empty() {
            self.root_offset = None;
            return Ok(());
        }
        let fill = ((MAX_KEYS as f64) * 0.7).floor().max(1.0) as usize;

        let mut level_offsets = Vec::new();
        let mut level_first_keys = Vec::new();
        let mut i = 0;
        while i < entries.len() {
            let end = (i + fill).min(entries.len());
            let chunk_keys: Vec<String> = entries[i..end].iter().map(|(k, _)| k.clone()).collect();
            let chunk_entries: Vec<Payload> = entries[i..end].iter().map(|(_, p)| *p).collect();
            let offset = self.alloc();
            level_first_keys.push(chunk_keys[0].clone());
            let node = Node::Leaf { parent: None, next_leaf: None, keys: chunk_keys, entries: chunk_entries };
            self.write(offset, &node)?;
            level_offsets.push(offset);
            i = end;
        }
        for w in 0..level_offsets.len().saturating_sub(1) {
            let (cur, next) = (level_offsets[w], level_offsets[w + 1]);
            let mut node = self.read(cur)?;
            if let Node::Leaf { next_leaf, .. } = &mut node {
                *next_leaf = Some(next);
            }
            self.write(cur, &node)?;
        }

        while level_offsets.len() > 1 {
            let mut parent_offsets = Vec::new();
            let mut parent_first_keys = Vec::new();
            let mut i = 0;
            while i < level_offsets.len() {
                let end = (i + fill + 1).min(level_offsets.len());
                let children: Vec<u32> = level_offsets[i..end].to_vec();
                let keys: Vec<String> = level_first_keys[(i + 1)..end].to_vec();
                let offset = self.alloc();
                for &c in &children {
                    let mut child = self.read(c)?;
                    child.set_parent(Some(offset));
                    self.write(c, &child)?;
                }
                parent_first_keys.push(level_first_keys[i].clone());
                self.write(offset, &Node::Internal { parent: None, keys, children })?;
                parent_offsets.push(offset);
                i = end;
            }
            level_offsets = parent_offsets;
            level_first_keys = parent_first_keys;
        }
        self.root_offset = level_offsets.first().copied();
        Ok(())
    }

    /// # Errors
    /// Returns an error on I/O failure or structural corruption.
    pub fn get_all_entries(&mut self) -> Result<Vec<(String, Payload)>> {
        let Some(root) = self.root_offset else { return Ok(Vec::new()) };
        let mut offset = root;
        loop {
            match self.read(offset)? {
                Node::Internal { children, .. } => offset = children[0],
                Node::Leaf { .. } => break,
            }
        }
        let mut out = Vec::new();
        let mut cur = Some(offset);
        while let Some(off) = cur {
            let Node::Leaf { keys, entries, next_leaf, .. } = self.read(off)? else {
                return Err(crate::errors::Error::StructuralCorruption {
                    offset: u64::from(off),
                    reason: "leaf chain pointed at a non-leaf node".to_string(),
                });
            };
            out.extend(keys.into_iter().zip(entries));
            cur = next_leaf;
        }
        Ok(out)
    }

    /// # Errors
    /// Returns an error on I/O failure or structural corruption.
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        let Some(root) = self.root_offset else { return Ok(false) };
        let mut path: Vec<(u32, usize)> = Vec::new();
        let mut offset = root;
        loop {
            match self.read(offset)? {
                Node::Internal { keys, children, .. } => {
                    let idx = Self::branch_index(&keys, key);
                    path.push((offset, idx));
                    offset = children[idx];
                }
                Node::Leaf { .. } => break,
            }
        }
        let leaf_offset = offset;
        let mut leaf = self.read(leaf_offset)?;
        let removed = {
            let Node::Leaf { keys, entries, .. } = &mut leaf else { unreachable!() };
            match keys.binary_search(&key.to_string()) {
                Ok(pos) => {
                    keys.remove(pos);
                    entries.remove(pos);
                    true
                }
                Err(_) => false,
            }
        };
        if !removed {
            return Ok(false);
        }
        self.write(leaf_offset, &leaf)?;

        if path.is_empty() || leaf.key_count() >= MIN_KEYS {
            return Ok(true);
        }

        let mut deficient_offset = leaf_offset;
        while let Some((parent_offset, child_idx)) = path.pop() {
            let mut parent = self.read(parent_offset)?;
            let resolved = self.rebalance_at(&mut parent, child_idx, deficient_offset)?;
            self.write(parent_offset, &parent)?;
            if resolved {
                return Ok(true);
            }
            if path.is_empty() {
                let Node::Internal { children, .. } = &parent else { unreachable!() };
                if parent.key_count() == 0 {
                    let only_child = children[0];
                    self.root_offset = Some(only_child);
                    let mut child = self.read(only_child)?;
                    child.set_parent(None);
                    self.write(only_child, &child)?;
                }
                return Ok(true);
            }
            if parent.key_count() >= MIN_KEYS {
                return Ok(true);
            }
            deficient_offset = parent_offset;
        }
        Ok(true)
    }

    /// Resolve a deficiency in the child of `parent` at `child_idx` (currently
    /// stored at `deficient_offset`), via borrow-left, borrow-right, or merge.
    /// Returns `true` if the parent's own key count is unaffected (borrow) or
    /// there is nothing further to propagate, `false` if the caller must check
    /// the parent (now one key shorter after a merge) for its own deficiency.
    fn rebalance_at(&mut self, parent: &mut Node, child_idx: usize, deficient_offset: u32) -> Result<bool> {
        let Node::Internal { keys: pkeys, children: pchildren, .. } = parent else {
            unreachable!("rebalance_at called on non-internal parent")
        };

        if child_idx > 0 {
            let left_offset = pchildren[child_idx - 1];
            let mut left = self.read(left_offset)?;
            if left.key_count() > MIN_KEYS {
                let mut deficient = self.read(deficient_offset)?;
                Self::borrow_from_left(&mut left, &mut deficient, pkeys, child_idx - 1, deficient_offset)?;
                self.write(left_offset, &left)?;
                self.write(deficient_offset, &deficient)?;
                return Ok(true);
            }
        }
        if child_idx + 1 < pchildren.len() {
            let right_offset = pchildren[child_idx + 1];
            let mut right = self.read(right_offset)?;
            if right.key_count() > MIN_KEYS {
                let mut deficient = self.read(deficient_offset)?;
                Self::borrow_from_right(&mut right, &mut deficient, pkeys, child_idx, deficient_offset)?;
                self.write(right_offset, &right)?;
                self.write(deficient_offset, &deficient)?;
                return Ok(true);
            }
        }

        if child_idx > 0 {
            let left_offset = pchildren[child_idx - 1];
            let mut left = self.read(left_offset)?;
            let deficient = self.read(deficient_offset)?;
            Self::merge_into_left(&mut left, deficient, pkeys, child_idx - 1)?;
            self.write(left_offset, &left)?;
            self.free(deficient_offset);
            pkeys.remove(child_idx - 1);
            pchildren.remove(child_idx);
        } else {
            let right_offset = pchildren[child_idx + 1];
            let right = self.read(right_offset)?;
            let mut deficient = self.read(deficient_offset)?;
            Self::merge_into_left(&mut deficient, right, pkeys, child_idx)?;
            self.write(deficient_offset, &deficient)?;
            self.free(right_offset);
            pkeys.remove(child_idx);
            pchildren.remove(child_idx + 1);
        }
        Ok(false)
    }

    fn borrow_from_left(
        left: &mut Node,
        deficient: &mut Node,
        parent_keys: &mut [String],
        sep_idx: usize,
        deficient_offset: u32,
    ) -> Result<()> {
        match (left, deficient) {
            (Node::Leaf { keys: lk, entries: le, .. }, Node::Leaf { keys: dk, entries: de, .. }) => {
                let moved_key = lk.pop().expect("lender has keys");
                let moved_entry = le.pop().expect("lender has entries");
                dk.insert(0, moved_key);
                de.insert(0, moved_entry);
                parent_keys[sep_idx] = dk[0].clone();
                Ok(())
            }
            (
                Node::Internal { keys: lk, children: lc, .. },
                Node::Internal { keys: dk, children: dc, .. },
            ) => {
                let moved_child = lc.pop().expect("lender has children");
                let moved_key = lk.pop().expect("lender has keys");
                dk.insert(0, parent_keys[sep_idx].clone());
                dc.insert(0, moved_child);
                parent_keys[sep_idx] = moved_key;
                let _ = deficient_offset;
                Ok(())
            }
            _ => unreachable!("sibling node type mismatch"),
        }
    }

    fn borrow_from_right(
        right: &mut Node,
        deficient: &mut Node,
        parent_keys: &mut [String],
        sep_idx: usize,
        deficient_offset: u32,
    ) -> Result<()> {
        match (right, deficient) {
            (Node::Leaf { keys: rk, entries: re, .. }, Node::Leaf { keys: dk, entries: de, .. }) => {
                dk.push(rk.remove(0));
                de.push(re.remove(0));
                parent_keys[sep_idx] = rk[0].clone();
                Ok(())
            }
            (
                Node::Internal { keys: rk, children: rc, .. },
                Node::Internal { keys: dk, children: dc, .. },
            ) => {
                let moved_child = rc.remove(0);
                let moved_key = rk.remove(0);
                dk.push(parent_keys[sep_idx].clone());
                dc.push(moved_child);
                parent_keys[sep_idx] = moved_key;
                let _ = deficient_offset;
                Ok(())
            }
            _ => unreachable!("sibling node type mismatch"),
        }
    }

    /// Absorb `right` into `left`, pulling down `parent_keys[sep_idx]` for
    /// internal merges.
    fn merge_into_left(left: &mut Node, right: Node, parent_keys: &[String], sep_idx: usize) -> Result<()> {
        match (left, right) {
            (
                Node::Leaf { keys: lk, entries: le, next_leaf, .. },
                Node::Leaf { keys: rk, entries: re, next_leaf: right_next, .. },
            ) => {
                lk.extend(rk);
                le.extend(re);
                *next_leaf = right_next;
                Ok(())
            }
            (Node::Internal { keys: lk, children: lc, .. }, Node::Internal { keys: rk, children: rc, .. }) => {
                lk.push(parent_keys[sep_idx].clone());
                lk.extend(rk);
                lc.extend(rc);
                Ok(())
            }
            _ => unreachable!("merge between mismatched node types"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap as Map;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct MemIo(Rc<RefCell<Map<u32, [u8; NODE_SIZE]>>>);

    impl NodeIo for MemIo {
        fn read_bytes(&mut self, offset: u32) -> Result<[u8; NODE_SIZE]> {
            Ok(self.0.borrow().get(&offset).copied().unwrap_or([0u8; NODE_SIZE]))
        }
        fn write_bytes(&mut self, offset: u32, bytes: &[u8; NODE_SIZE]) -> Result<()> {
            self.0.borrow_mut().insert(offset, *bytes);
            Ok(())
        }
    }

    fn new_tree() -> BTree<MemIo> {
        BTree::new(MemIo::default(), None, 0, 64)
    }

    #[test]
    fn insert_and_find_round_trips() {
        let mut tree = new_tree();
        for i in 0..200u32 {
            tree.insert(&format!("users:{i:05}"), (i, i + 1)).unwrap();
        }
        for i in 0..200u32 {
            assert_eq!(tree.find(&format!("users:{i:05}")).unwrap(), Some((i, i + 1)));
        }
        assert_eq!(tree.find("users:99999").unwrap(), None);
    }

    #[test]
    fn get_all_entries_is_sorted_and_complete() {
        let mut tree = new_tree();
        let mut ids: Vec<u32> = (0..150).collect();
        ids.reverse();
        for i in &ids {
            tree.insert(&format!("t:{i:05}"), (*i, 1)).unwrap();
        }
        let all = tree.get_all_entries().unwrap();
        assert_eq!(all.len(), 150);
        let sorted_keys: Vec<&str> = all.iter().map(|(k, _)| k.as_str()).collect();
        let mut expected = sorted_keys.clone();
        expected.sort_unstable();
        assert_eq!(sorted_keys, expected);
    }

    #[test]
    fn remove_shrinks_tree_and_keeps_remaining_lookups() {
        let mut tree = new_tree();
        for i in 0..300u32 {
            tree.insert(&format!("d:{i:05}"), (i, 1)).unwrap();
        }
        for i in (0..300u32).step_by(2) {
            assert!(tree.remove(&format!("d:{i:05}")).unwrap());
        }
        for i in 0..300u32 {
            let expected = if i % 2 == 0 { None } else { Some((i, 1)) };
            assert_eq!(tree.find(&format!("d:{i:05}")).unwrap(), expected);
        }
        assert!(!tree.remove("d:99999").unwrap());
    }

    #[test]
    fn remove_all_leaves_empty_tree() {
        let mut tree = new_tree();
        for i in 0..40u32 {
            tree.insert(&format!("x:{i:03}"), (i, 1)).unwrap();
        }
        for i in 0..40u32 {
            assert!(tree.remove(&format!("x:{i:03}")).unwrap());
        }
        assert_eq!(tree.get_all_entries().unwrap().len(), 0);
    }

    #[test]
    fn bulk_insert_matches_individual_inserts() {
        let mut bulk = new_tree();
        let entries: Vec<(String, Payload)> =
            (0..500u32).map(|i| (format!("b:{i:05}"), (i, i))).collect();
        bulk.bulk_insert(entries.clone()).unwrap();

        let mut incremental = new_tree();
        for (k, p) in &entries {
            incremental.insert(k, *p).unwrap();
        }
        assert_eq!(bulk.get_all_entries().unwrap(), incremental.get_all_entries().unwrap());
    }

    #[test]
    fn cache_eviction_keeps_working_tree_correct() {
        let mut tree = BTree::new(MemIo::default(), None, 0, 4); // tiny cache forces eviction
        for i in 0..500u32 {
            tree.insert(&format!("c:{i:05}"), (i, 1)).unwrap();
        }
        for i in 0..500u32 {
            assert_eq!(tree.find(&format!("c:{i:05}")).unwrap(), Some((i, 1)));
        }
    }
}
