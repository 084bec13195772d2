//! Ordered maps over pooled [`MetadataNode`]s.
//!
//! We can't use `BTreeMap`, its nodes come from the global allocator. Instead
//! the tree links live inside the metadata records themselves (an AVL tree),
//! so an index never allocates anything: inserting a node just threads it
//! into the tree. The same node type is keyed by user pointer while live and
//! by page count while cached, which is what [`IndexKey`] abstracts.

use std::{cmp::Ordering, marker::PhantomData};

use crate::{
    error::{Error, Result},
    node::{Links, MetadataNode, NodePtr},
};

/// How an index orders its nodes
pub trait IndexKey {
    fn key(node: &MetadataNode) -> usize;
}

/// Live blocks, by the pointer we handed out
pub enum ByUserPtr {}

impl IndexKey for ByUserPtr {
    fn key(node: &MetadataNode) -> usize {
        node.user_ptr
    }
}

/// Cached mappings, by their total page count
pub enum ByPageCount {}

impl IndexKey for ByPageCount {
    fn key(node: &MetadataNode) -> usize {
        node.page_count
    }
}

/// What `insert` did with a node whose key was already present
enum Inserted {
    Fresh,
    Replaced(NodePtr),
    Rejected,
}

/// An AVL tree of nodes, ordered by `K`. Every node reachable from `root`
/// is owned by this tree until it is removed again.
pub struct OrderedIndex<K> {
    root: Option<NodePtr>,
    len: usize,
    _key: PhantomData<K>,
}

// SAFETY: the tree owns the nodes linked into it, and they're only touched
// through `&mut self` (or `&self` for reads), so moving the tree moves that
// ownership with it.
unsafe impl<K> Send for OrderedIndex<K> {}

impl<K> Default for OrderedIndex<K> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY (for all the helpers below): callers only ever pass nodes that are
// linked into a tree they have `&mut` access to, or a node they own and are
// about to link in. Nodes live in the pool region, which outlives the tree.
unsafe fn node<'a>(n: NodePtr) -> &'a MetadataNode {
    unsafe { &*n.as_ptr() }
}

unsafe fn links<'a>(n: NodePtr) -> &'a mut Links {
    unsafe { &mut (*n.as_ptr()).links }
}

fn height(n: Option<NodePtr>) -> u32 {
    n.map_or(0, |n| unsafe { links(n).height })
}

unsafe fn update_height(n: NodePtr) {
    unsafe {
        let l = links(n);
        l.height = 1 + height(l.left).max(height(l.right));
    }
}

unsafe fn rotate_right(n: NodePtr) -> NodePtr {
    unsafe {
        let l = links(n).left.expect("rotate_right() needs a left child");
        links(n).left = links(l).right;
        links(l).right = Some(n);
        update_height(n);
        update_height(l);
        l
    }
}

unsafe fn rotate_left(n: NodePtr) -> NodePtr {
    unsafe {
        let r = links(n).right.expect("rotate_left() needs a right child");
        links(n).right = links(r).left;
        links(r).left = Some(n);
        update_height(n);
        update_height(r);
        r
    }
}

/// Restore the AVL property at `n`, whose subtrees are balanced but may
/// differ in height by 2. Returns the new subtree root.
unsafe fn rebalance(n: NodePtr) -> NodePtr {
    unsafe {
        update_height(n);
        let (left, right) = (links(n).left, links(n).right);
        let balance = height(left) as i64 - height(right) as i64;
        if balance > 1 {
            let l = left.expect("left-heavy implies a left child");
            if height(links(l).left) < height(links(l).right) {
                links(n).left = Some(rotate_left(l));
            }
            rotate_right(n)
        } else if balance < -1 {
            let r = right.expect("right-heavy implies a right child");
            if height(links(r).right) < height(links(r).left) {
                links(n).right = Some(rotate_right(r));
            }
            rotate_left(n)
        } else {
            n
        }
    }
}

unsafe fn insert_at<K: IndexKey>(
    at: Option<NodePtr>,
    new: NodePtr,
    replace: bool,
    outcome: &mut Inserted,
) -> NodePtr {
    unsafe {
        let Some(cur) = at else {
            *links(new) = Links {
                left: None,
                right: None,
                height: 1,
            };
            return new;
        };
        match K::key(node(new)).cmp(&K::key(node(cur))) {
            Ordering::Less => {
                links(cur).left = Some(insert_at::<K>(links(cur).left, new, replace, outcome));
                rebalance(cur)
            }
            Ordering::Greater => {
                links(cur).right = Some(insert_at::<K>(links(cur).right, new, replace, outcome));
                rebalance(cur)
            }
            Ordering::Equal if replace => {
                // `new` steps into `cur`'s position, the shape doesn't change
                *links(new) = *links(cur);
                *links(cur) = Links::default();
                *outcome = Inserted::Replaced(cur);
                new
            }
            Ordering::Equal => {
                *outcome = Inserted::Rejected;
                cur
            }
        }
    }
}

/// Unlink the leftmost node under `n`. Returns (new subtree root, the
/// unlinked node).
unsafe fn remove_min(n: NodePtr) -> (Option<NodePtr>, NodePtr) {
    unsafe {
        match links(n).left {
            None => (links(n).right, n),
            Some(l) => {
                let (rest, min) = remove_min(l);
                links(n).left = rest;
                (Some(rebalance(n)), min)
            }
        }
    }
}

unsafe fn remove_at<K: IndexKey>(
    at: Option<NodePtr>,
    key: usize,
    removed: &mut Option<NodePtr>,
) -> Option<NodePtr> {
    unsafe {
        let cur = at?;
        match key.cmp(&K::key(node(cur))) {
            Ordering::Less => {
                links(cur).left = remove_at::<K>(links(cur).left, key, removed);
                Some(rebalance(cur))
            }
            Ordering::Greater => {
                links(cur).right = remove_at::<K>(links(cur).right, key, removed);
                Some(rebalance(cur))
            }
            Ordering::Equal => {
                *removed = Some(cur);
                let Links { left, right, .. } = std::mem::take(links(cur));
                match (left, right) {
                    (None, only) | (only, None) => only,
                    (Some(left), Some(right)) => {
                        let (right, successor) = remove_min(right);
                        links(successor).left = Some(left);
                        links(successor).right = right;
                        Some(rebalance(successor))
                    }
                }
            }
        }
    }
}

/// Post-order walk that unlinks every node before handing it to `f`
unsafe fn drain_at(at: Option<NodePtr>, f: &mut impl FnMut(NodePtr)) {
    unsafe {
        if let Some(n) = at {
            let Links { left, right, .. } = std::mem::take(links(n));
            drain_at(left, f);
            drain_at(right, f);
            f(n);
        }
    }
}

unsafe fn for_each_at(at: Option<NodePtr>, f: &mut impl FnMut(&MetadataNode)) {
    unsafe {
        if let Some(n) = at {
            for_each_at(links(n).left, f);
            f(node(n));
            for_each_at(links(n).right, f);
        }
    }
}

/// Check ordering, balance and stored heights below `at`, with every key
/// strictly inside `(lo, hi)`. Returns (node count, height).
unsafe fn verify_at<K: IndexKey>(
    at: Option<NodePtr>,
    lo: Option<usize>,
    hi: Option<usize>,
) -> Result<(usize, u32)> {
    unsafe {
        let Some(n) = at else { return Ok((0, 0)) };
        let key = K::key(node(n));
        if lo.is_some_and(|lo| key <= lo) || hi.is_some_and(|hi| key >= hi) {
            return Err(Error::Corrupt("keys out of order or duplicated"));
        }
        let (lcount, lheight) = verify_at::<K>(links(n).left, lo, Some(key))?;
        let (rcount, rheight) = verify_at::<K>(links(n).right, Some(key), hi)?;
        if lheight.abs_diff(rheight) > 1 {
            return Err(Error::Corrupt("tree out of balance"));
        }
        let h = 1 + lheight.max(rheight);
        if links(n).height != h {
            return Err(Error::Corrupt("stale node height"));
        }
        Ok((lcount + rcount + 1, h))
    }
}

impl<K> OrderedIndex<K> {
    pub const fn new() -> Self {
        Self {
            root: None,
            len: 0,
            _key: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<K: IndexKey> OrderedIndex<K> {
    /// # Safety
    ///
    /// `new` must point to an initialized node that is not in any index, and
    /// must stay valid for as long as it is linked into this one.
    unsafe fn insert_with(&mut self, new: NodePtr, replace: bool) -> Inserted {
        let mut outcome = Inserted::Fresh;
        self.root = Some(unsafe { insert_at::<K>(self.root, new, replace, &mut outcome) });
        if let Inserted::Fresh = outcome {
            self.len += 1;
        }
        outcome
    }

    pub fn find(&self, key: usize) -> Option<&MetadataNode> {
        let mut at = self.root;
        while let Some(n) = at {
            // SAFETY: `n` is linked into this tree
            let cur = unsafe { node(n) };
            at = match key.cmp(&K::key(cur)) {
                Ordering::Less => cur.links.left,
                Ordering::Greater => cur.links.right,
                Ordering::Equal => return Some(cur),
            };
        }
        None
    }

    /// Unlink and return the node with `key`. The caller owns it afterwards.
    pub fn remove(&mut self, key: usize) -> Option<NodePtr> {
        let mut removed = None;
        // SAFETY: only nodes of this tree are touched
        self.root = unsafe { remove_at::<K>(self.root, key, &mut removed) };
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Unlink and return the node with the smallest key
    pub fn pop_first(&mut self) -> Option<NodePtr> {
        let mut at = self.root?;
        // SAFETY: walking our own nodes
        while let Some(l) = unsafe { links(at).left } {
            at = l;
        }
        // SAFETY: as above
        let key = K::key(unsafe { node(at) });
        self.remove(key)
    }

    /// Unlink every node, handing each to `f`. The tree is empty afterwards.
    pub fn drain(&mut self, mut f: impl FnMut(NodePtr)) {
        let root = self.root.take();
        self.len = 0;
        // SAFETY: we own every node under `root`, and nothing else can see
        // them once `root` is taken
        unsafe { drain_at(root, &mut f) }
    }

    /// Visit every node in key order
    pub fn for_each(&self, mut f: impl FnMut(&MetadataNode)) {
        // SAFETY: read-only walk of our own nodes
        unsafe { for_each_at(self.root, &mut f) }
    }

    /// Check the tree invariants: strict key order (so no duplicates), AVL
    /// balance, cached heights, and that `len` matches the nodes reachable.
    pub fn verify(&self) -> Result<usize> {
        // SAFETY: read-only walk of our own nodes
        let (count, _) = unsafe { verify_at::<K>(self.root, None, None)? };
        if count != self.len {
            return Err(Error::Corrupt("node count does not match len"));
        }
        Ok(count)
    }
}

/// Live allocations, keyed by the user pointer
#[derive(Default)]
pub struct AllocationIndex {
    tree: OrderedIndex<ByUserPtr>,
}

impl AllocationIndex {
    pub const fn new() -> Self {
        Self {
            tree: OrderedIndex::new(),
        }
    }

    /// Track a new live block. A second block at the same user pointer means
    /// the indices are out of sync with the mappings, and is refused.
    ///
    /// # Safety
    ///
    /// `node` must be initialized, in no other index, and stay valid until
    /// it is removed again.
    pub unsafe fn insert(&mut self, node: NodePtr) -> Result<()> {
        match unsafe { self.tree.insert_with(node, false) } {
            Inserted::Fresh => Ok(()),
            Inserted::Rejected | Inserted::Replaced(_) => {
                Err(Error::Corrupt("two live blocks share a user pointer"))
            }
        }
    }

    pub fn find(&self, ptr: usize) -> Option<&MetadataNode> {
        self.tree.find(ptr)
    }

    pub fn find_and_remove(&mut self, ptr: usize) -> Option<NodePtr> {
        self.tree.remove(ptr)
    }

    pub fn for_each(&self, f: impl FnMut(&MetadataNode)) {
        self.tree.for_each(f)
    }

    pub fn drain(&mut self, f: impl FnMut(NodePtr)) {
        self.tree.drain(f)
    }

    pub fn verify(&self) -> Result<usize> {
        self.tree.verify()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

/// Freed, re-guarded mappings waiting to be handed out again, keyed by page
/// count. This is a single-slot cache: there is at most one node per page
/// count, and a newer node pushes the older one out.
#[derive(Default)]
pub struct ReuseIndex {
    tree: OrderedIndex<ByPageCount>,
}

impl ReuseIndex {
    pub const fn new() -> Self {
        Self {
            tree: OrderedIndex::new(),
        }
    }

    /// Cache `node`. If a node with the same page count was already cached,
    /// it is displaced and returned; the caller has to dispose of it.
    ///
    /// # Safety
    ///
    /// Same as [`AllocationIndex::insert()`].
    #[must_use = "a displaced node still owns a mapping"]
    pub unsafe fn insert(&mut self, node: NodePtr) -> Option<NodePtr> {
        match unsafe { self.tree.insert_with(node, true) } {
            Inserted::Replaced(old) => Some(old),
            Inserted::Fresh | Inserted::Rejected => None,
        }
    }

    /// Remove and return the cached node of exactly `page_count` pages
    pub fn take(&mut self, page_count: usize) -> Option<NodePtr> {
        self.tree.remove(page_count)
    }

    /// Remove and return the smallest cached node, if any
    pub fn pop_first(&mut self) -> Option<NodePtr> {
        self.tree.pop_first()
    }

    pub fn drain(&mut self, f: impl FnMut(NodePtr)) {
        self.tree.drain(f)
    }

    pub fn verify(&self) -> Result<usize> {
        self.tree.verify()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
