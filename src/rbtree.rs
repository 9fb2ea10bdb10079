use std::alloc::AllocError;
use std::cmp::Ordering;
use std::ptr::NonNull;

use log::trace;

// PROVE: any node with height `h` has black height at least `h/2`
// PROVE: the subtree located at any node `x` contains at least `2^bh(x) - 1` nodes (use induction)
// LEMMA: An RBTree with `n` internal nodes has height at most `2*log₂(n+1)`

/// The key type stored in an [`RBTree`]. Duplicates are allowed.
pub type Key = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

// Every link is non-null: an absent child (and the root's parent) points at
// the tree's sentinel node instead. That keeps the rebalancing code free of
// any "is there even a node here" branching.
struct Node {
    key: Key,
    color: Color,
    left: NonNull<Node>,
    right: NonNull<Node>,
    parent: NonNull<Node>,
}

/// An opaque handle to one node of an [`RBTree`].
///
/// Equality is identity: two handles compare equal iff they name the same
/// allocation, so duplicate keys stay distinguishable. A handle is a
/// capability token: it stays usable exactly until the node it names is
/// erased or its tree is dropped, and the tree does not defend against stale
/// handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef(NonNull<Node>);

/// An ordered multiset of [`Key`]s backed by a red-black tree.
///
/// All four search-tree invariants plus the red-black coloring rules hold
/// whenever a public method returns, which bounds the height (and therefore
/// every operation below) at O(log(n)).
///
/// One sentinel node per tree stands in for every absent child and for the
/// parent of the root. Its color is black forever; its `parent` link is the
/// only field that gets rewritten (erase leans on that to walk back up from
/// a removed node's position).
pub struct RBTree {
    root: NonNull<Node>,
    nil: NonNull<Node>,
    len: usize,
}

// SAFETY: the tree exclusively owns its sentinel and every node reachable
//         from `root`, so moving it to another thread moves the whole
//         structure. It is deliberately *not* `Sync`: every operation assumes
//         exclusive access for its full duration.
unsafe impl Send for RBTree {}

fn alloc_node(key: Key, color: Color, link: NonNull<Node>) -> Result<NonNull<Node>, AllocError> {
    let node = Box::try_new(Node {
        key,
        color,
        left: link,
        right: link,
        parent: link,
    })?;
    #[cfg(test)]
    alloc_gauge::ALLOCS.with(|n| n.set(n.get() + 1));
    Ok(Box::leak(node).into())
}

/// SAFETY: `node` must have come out of `alloc_node`, and nothing may touch
/// it after this call; the allocation is gone.
unsafe fn release_node(node: NonNull<Node>) {
    #[cfg(test)]
    alloc_gauge::RELEASES.with(|n| n.set(n.get() + 1));
    // SAFETY: guaranteed by caller; the box takes ownership back and frees it.
    drop(unsafe { Box::from_raw(node.as_ptr()) });
}

impl RBTree {
    /// Create an empty tree.
    ///
    /// The only allocation is the sentinel; on failure nothing is left
    /// behind.
    pub fn try_new() -> Result<Self, AllocError> {
        let nil = alloc_node(0, Color::Black, NonNull::dangling())?;
        // SAFETY: `nil` is live, we just allocated it. Pointing its links back
        //         at itself means no reachable link is ever dangling, the
        //         sentinel's own included.
        unsafe {
            (*nil.as_ptr()).left = nil;
            (*nil.as_ptr()).right = nil;
            (*nil.as_ptr()).parent = nil;
        }
        Ok(RBTree { root: nil, nil, len: 0 })
    }

    /// Number of live nodes. Duplicates count individually.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.root == self.nil
    }

    /// Whether `node` is this tree's sentinel, the "no such node" answer
    /// that [`RBTree::min`] and [`RBTree::max`] give on an empty tree.
    pub fn is_nil(&self, node: NodeRef) -> bool {
        node.0 == self.nil
    }

    /// Read the key behind a handle.
    ///
    /// SAFETY: `node` must be a handle into *this* tree naming a node that is
    /// still live (not erased since, tree not dropped). The sentinel handle is
    /// allowed; its key is unspecified.
    pub unsafe fn key(&self, node: NodeRef) -> Key {
        // SAFETY: liveness guaranteed by the caller.
        unsafe { (*node.0.as_ptr()).key }
    }

    /// Insert `key` and return the handle of its freshly allocated node.
    ///
    /// Never rejects duplicates: an equal key descends right, so among equal
    /// keys the newest ends up rightmost. The new node starts red (that can
    /// break the no-red-red rule, which is local and repairable, but never
    /// the black-height rule) and the fixup pass repairs the coloring.
    ///
    /// Complexity: O(log(n))
    pub fn insert(&mut self, key: Key) -> Result<NodeRef, AllocError> {
        let z = alloc_node(key, Color::Red, self.nil)?;

        // ordinary BST descent, remembering the last real node as the parent
        let mut parent = self.nil;
        let mut cur = self.root;
        while cur != self.nil {
            parent = cur;
            // SAFETY: `cur` is not the sentinel, so it is a live node of this tree.
            cur = unsafe {
                if key < (*cur.as_ptr()).key {
                    (*cur.as_ptr()).left
                } else {
                    (*cur.as_ptr()).right
                }
            };
        }

        // SAFETY: `z` is fresh and `parent` is live (or the sentinel, in
        //         which case the tree was empty and `z` becomes the root).
        unsafe {
            (*z.as_ptr()).parent = parent;
            if parent == self.nil {
                self.root = z;
            } else if key < (*parent.as_ptr()).key {
                (*parent.as_ptr()).left = z;
            } else {
                (*parent.as_ptr()).right = z;
            }
        }

        self.len += 1;
        trace!("insert key={key}, len={}", self.len);

        // SAFETY: `z` is a live red node we just linked in.
        unsafe { self.insert_fixup(z) };
        Ok(NodeRef(z))
    }

    /// Repair the coloring after `insert` attached the red node `z`.
    ///
    /// The only possible violation is a red-red edge at `z`; each iteration
    /// either fixes it in place (at most two rotations) or recolors and
    /// pushes it two levels up. The loop stops at the root because the root's
    /// parent is the (black) sentinel.
    ///
    /// SAFETY: `z` must be a live red node of this tree.
    unsafe fn insert_fixup(&mut self, mut z: NonNull<Node>) {
        // SAFETY (whole body): every link followed here stays inside this
        //         tree, and rotations require the child they pivot on to be
        //         real, which each call site establishes just before.
        unsafe {
            while (*(*z.as_ptr()).parent.as_ptr()).color == Color::Red {
                let parent = (*z.as_ptr()).parent;
                let grandparent = (*parent.as_ptr()).parent;
                if parent == (*grandparent.as_ptr()).left {
                    let uncle = (*grandparent.as_ptr()).right;
                    if (*uncle.as_ptr()).color == Color::Red {
                        // red uncle: recolor, violation moves to the grandparent
                        (*parent.as_ptr()).color = Color::Black;
                        (*uncle.as_ptr()).color = Color::Black;
                        (*grandparent.as_ptr()).color = Color::Red;
                        z = grandparent;
                    } else {
                        if z == (*parent.as_ptr()).right {
                            // triangle: rotate it into the line case below
                            z = parent;
                            self.rotate_left(z);
                        }
                        let parent = (*z.as_ptr()).parent;
                        let grandparent = (*parent.as_ptr()).parent;
                        (*parent.as_ptr()).color = Color::Black;
                        (*grandparent.as_ptr()).color = Color::Red;
                        self.rotate_right(grandparent);
                    }
                } else {
                    // mirror image: parent hangs off grandparent's right
                    let uncle = (*grandparent.as_ptr()).left;
                    if (*uncle.as_ptr()).color == Color::Red {
                        (*parent.as_ptr()).color = Color::Black;
                        (*uncle.as_ptr()).color = Color::Black;
                        (*grandparent.as_ptr()).color = Color::Red;
                        z = grandparent;
                    } else {
                        if z == (*parent.as_ptr()).left {
                            z = parent;
                            self.rotate_right(z);
                        }
                        let parent = (*z.as_ptr()).parent;
                        let grandparent = (*parent.as_ptr()).parent;
                        (*parent.as_ptr()).color = Color::Black;
                        (*grandparent.as_ptr()).color = Color::Red;
                        self.rotate_left(grandparent);
                    }
                }
            }
            // the red-uncle case can bubble a red color all the way into
            // the root; the root must be black, so force it
            (*self.root.as_ptr()).color = Color::Black;
        }
    }

    /// Look up a node holding exactly `key`.
    ///
    /// With duplicates present this returns whichever match the descent hits
    /// first, not a particular one; handle identity is what tells copies
    /// apart.
    ///
    /// Complexity: O(log(n))
    pub fn find(&self, key: Key) -> Option<NodeRef> {
        let mut cur = self.root;
        while cur != self.nil {
            // SAFETY: `cur` is not the sentinel, so it is a live node of this tree.
            let node = unsafe { cur.as_ref() };
            cur = match key.cmp(&node.key) {
                Ordering::Less => node.left,
                Ordering::Greater => node.right,
                Ordering::Equal => return Some(NodeRef(cur)),
            };
        }
        None
    }

    /// Handle of the smallest key, or the sentinel handle if the tree is
    /// empty; check with [`RBTree::is_nil`] before trusting it. Returning
    /// the sentinel instead of an `Option` is part of the contract, not an
    /// accident.
    pub fn min(&self) -> NodeRef {
        NodeRef(self.min_from(self.root))
    }

    /// Handle of the largest key, or the sentinel handle if the tree is
    /// empty. Same contract as [`RBTree::min`].
    pub fn max(&self) -> NodeRef {
        let mut cur = self.root;
        // SAFETY: the walk follows live links and stops at the sentinel.
        unsafe {
            while cur != self.nil && (*cur.as_ptr()).right != self.nil {
                cur = (*cur.as_ptr()).right;
            }
        }
        NodeRef(cur)
    }

    /// Leftmost node of the subtree under `cur`, or `cur` itself when it is
    /// the sentinel. For a node with a real right child,
    /// `min_from(node.right)` is its in-order successor.
    fn min_from(&self, mut cur: NonNull<Node>) -> NonNull<Node> {
        // SAFETY: the walk follows live links and stops at the sentinel.
        unsafe {
            while cur != self.nil && (*cur.as_ptr()).left != self.nil {
                cur = (*cur.as_ptr()).left;
            }
        }
        cur
    }

    /// Left rotation around `x`: `x`'s right child takes `x`'s place, `x`
    /// becomes its left child, and the child's former left subtree moves
    /// under `x`. O(1), search order preserved by construction.
    ///
    /// SAFETY: `x` must be a live node of this tree whose right child is not
    /// the sentinel.
    unsafe fn rotate_left(&mut self, x: NonNull<Node>) {
        // SAFETY: guaranteed by caller; every other link touched is a live
        //         node or the sentinel, and the sentinel's fields may be read.
        unsafe {
            let y = (*x.as_ptr()).right;
            debug_assert!(y != self.nil);

            (*x.as_ptr()).right = (*y.as_ptr()).left;
            if (*y.as_ptr()).left != self.nil {
                (*(*y.as_ptr()).left.as_ptr()).parent = x;
            }

            (*y.as_ptr()).parent = (*x.as_ptr()).parent;
            let xp = (*x.as_ptr()).parent;
            if xp == self.nil {
                self.root = y;
            } else if x == (*xp.as_ptr()).left {
                (*xp.as_ptr()).left = y;
            } else {
                (*xp.as_ptr()).right = y;
            }

            (*y.as_ptr()).left = x;
            (*x.as_ptr()).parent = y;
        }
    }

    /// Mirror image of [`rotate_left`].
    ///
    /// SAFETY: `x` must be a live node of this tree whose left child is not
    /// the sentinel.
    ///
    /// [`rotate_left`]: RBTree::rotate_left
    unsafe fn rotate_right(&mut self, x: NonNull<Node>) {
        // SAFETY: see `rotate_left`.
        unsafe {
            let y = (*x.as_ptr()).left;
            debug_assert!(y != self.nil);

            (*x.as_ptr()).left = (*y.as_ptr()).right;
            if (*y.as_ptr()).right != self.nil {
                (*(*y.as_ptr()).right.as_ptr()).parent = x;
            }

            (*y.as_ptr()).parent = (*x.as_ptr()).parent;
            let xp = (*x.as_ptr()).parent;
            if xp == self.nil {
                self.root = y;
            } else if x == (*xp.as_ptr()).right {
                (*xp.as_ptr()).right = y;
            } else {
                (*xp.as_ptr()).left = y;
            }

            (*y.as_ptr()).right = x;
            (*x.as_ptr()).parent = y;
        }
    }

    /// Rewire `u`'s parent to point at `v` in `u`'s slot (root link included)
    /// and set `v`'s parent accordingly. `u`'s own links are left untouched.
    ///
    /// `v`'s parent pointer is written even when `v` is the sentinel; the
    /// erase fixup reads it to find where the missing black now sits.
    ///
    /// SAFETY: `u` must be a live node of this tree; `v` a live node or the
    /// sentinel.
    unsafe fn transplant(&mut self, u: NonNull<Node>, v: NonNull<Node>) {
        // SAFETY: guaranteed by caller.
        unsafe {
            let up = (*u.as_ptr()).parent;
            if up == self.nil {
                self.root = v;
            } else if u == (*up.as_ptr()).left {
                (*up.as_ptr()).left = v;
            } else {
                (*up.as_ptr()).right = v;
            }
            (*v.as_ptr()).parent = up;
        }
    }

    /// Remove the node named by `node`, rebalance, and free it. Returns
    /// `true` on success (which, with the preconditions below upheld, is
    /// always).
    ///
    /// Erasure is by identity, not key: with duplicates in the tree the
    /// caller picks the exact copy to remove by holding its handle. When the
    /// target has two real children, the in-order successor's *allocation* is
    /// the one that is actually freed; its key is copied into the target
    /// node first. Any other handle that happened to name the successor is
    /// dead afterwards, while `node` itself stays live under the successor's
    /// key. Handles obtained fresh from [`RBTree::find`] are immune to this
    /// subtlety.
    ///
    /// Complexity: O(log(n))
    ///
    /// SAFETY: `node` must be a handle into *this* tree naming a live,
    /// non-sentinel node. Stale or foreign handles are not detected.
    pub unsafe fn erase(&mut self, node: NodeRef) -> bool {
        let z = node.0;
        debug_assert!(z != self.nil);

        // SAFETY (whole body): the caller guarantees `z` is live in this
        //         tree, so everything reachable from it is live too.
        unsafe {
            // `y` is the node that physically leaves the tree, `x` the node
            // (or sentinel) that inherits its position and any black deficit.
            let mut y = z;
            let mut removed_color = (*y.as_ptr()).color;
            let x;

            if (*z.as_ptr()).left == self.nil {
                x = (*z.as_ptr()).right;
                self.transplant(z, x);
            } else if (*z.as_ptr()).right == self.nil {
                x = (*z.as_ptr()).left;
                self.transplant(z, x);
            } else {
                // two real children: splice out the in-order successor and
                // move its key into `z` instead of moving `z` anywhere
                y = self.min_from((*z.as_ptr()).right);
                removed_color = (*y.as_ptr()).color;
                x = (*y.as_ptr()).right; // the successor has no left child
                self.transplant(y, x);
                (*z.as_ptr()).key = (*y.as_ptr()).key;
                trace!("erase: spliced successor, key={} lives on", (*z.as_ptr()).key);
            }

            if removed_color == Color::Black {
                // a black node left the tree, so one path is short a black;
                // rebalance around the node that took its place
                self.erase_fixup(x);
            }

            self.len -= 1;
            trace!("erase done, len={}", self.len);
            release_node(y);
        }
        true
    }

    /// Rebalance after a black node was unlinked. `x` sits in the removed
    /// node's position carrying the "double black" deficit; each iteration
    /// either settles it with recolors and at most two rotations, or moves
    /// it one level up.
    ///
    /// SAFETY: `x` must be a live node of this tree or the sentinel, with its
    /// parent link pointing at the deficit position's parent.
    unsafe fn erase_fixup(&mut self, mut x: NonNull<Node>) {
        // SAFETY (whole body): links only lead to live nodes or the sentinel,
        //         and a black `x` below the root always has a real sibling
        //         (the removed black's path had black-height ≥ 1).
        unsafe {
            while x != self.root && (*x.as_ptr()).color == Color::Black {
                let parent = (*x.as_ptr()).parent;
                if x == (*parent.as_ptr()).left {
                    let mut sibling = (*parent.as_ptr()).right;
                    if (*sibling.as_ptr()).color == Color::Red {
                        // red sibling: rotate it above, leaving a black one
                        (*sibling.as_ptr()).color = Color::Black;
                        (*parent.as_ptr()).color = Color::Red;
                        self.rotate_left(parent);
                        sibling = (*parent.as_ptr()).right;
                    }
                    if (*(*sibling.as_ptr()).left.as_ptr()).color == Color::Black
                        && (*(*sibling.as_ptr()).right.as_ptr()).color == Color::Black
                    {
                        // both nephews black: take a black off the sibling
                        // side and hand the deficit to the parent
                        (*sibling.as_ptr()).color = Color::Red;
                        x = parent;
                    } else {
                        if (*(*sibling.as_ptr()).right.as_ptr()).color == Color::Black {
                            // red nephew on the near side only: rotate the
                            // sibling so the red ends up far
                            (*(*sibling.as_ptr()).left.as_ptr()).color = Color::Black;
                            (*sibling.as_ptr()).color = Color::Red;
                            self.rotate_right(sibling);
                            sibling = (*parent.as_ptr()).right;
                        }
                        // far nephew red: one rotation pays off the deficit
                        (*sibling.as_ptr()).color = (*parent.as_ptr()).color;
                        (*parent.as_ptr()).color = Color::Black;
                        (*(*sibling.as_ptr()).right.as_ptr()).color = Color::Black;
                        self.rotate_left(parent);
                        x = self.root;
                    }
                } else {
                    // mirror image: `x` is a right child
                    let mut sibling = (*parent.as_ptr()).left;
                    if (*sibling.as_ptr()).color == Color::Red {
                        (*sibling.as_ptr()).color = Color::Black;
                        (*parent.as_ptr()).color = Color::Red;
                        self.rotate_right(parent);
                        sibling = (*parent.as_ptr()).left;
                    }
                    if (*(*sibling.as_ptr()).right.as_ptr()).color == Color::Black
                        && (*(*sibling.as_ptr()).left.as_ptr()).color == Color::Black
                    {
                        (*sibling.as_ptr()).color = Color::Red;
                        x = parent;
                    } else {
                        if (*(*sibling.as_ptr()).left.as_ptr()).color == Color::Black {
                            (*(*sibling.as_ptr()).right.as_ptr()).color = Color::Black;
                            (*sibling.as_ptr()).color = Color::Red;
                            self.rotate_left(sibling);
                            sibling = (*parent.as_ptr()).left;
                        }
                        (*sibling.as_ptr()).color = (*parent.as_ptr()).color;
                        (*parent.as_ptr()).color = Color::Black;
                        (*(*sibling.as_ptr()).left.as_ptr()).color = Color::Black;
                        self.rotate_right(parent);
                        x = self.root;
                    }
                }
            }
            // either the deficit reached the root (where it is absorbed) or a
            // red-and-black `x` terminated the loop; both end painted black,
            // which also keeps the root black when it was `x`
            (*x.as_ptr()).color = Color::Black;
        }
    }

    /// Write the keys in ascending order into `out`, stopping at its
    /// capacity. Returns how many keys were written; truncation is silent,
    /// so size the buffer from [`RBTree::len`] to get everything.
    ///
    /// Complexity: O(keys written) time, O(log(n)) auxiliary space
    pub fn flatten_into(&self, out: &mut [Key]) -> usize {
        let mut written = 0;
        let mut stack: Vec<NonNull<Node>> = Vec::new();
        let mut cur = self.root;
        while written < out.len() {
            // SAFETY: the traversal only touches live nodes of this tree.
            unsafe {
                while cur != self.nil {
                    stack.push(cur);
                    cur = (*cur.as_ptr()).left;
                }
                let Some(node) = stack.pop() else { break };
                out[written] = (*node.as_ptr()).key;
                written += 1;
                cur = (*node.as_ptr()).right;
            }
        }
        written
    }
}

impl Drop for RBTree {
    /// Releases every real node in post-order (children strictly before
    /// their parent), then the sentinel, exactly once each. Iterative on an
    /// explicit stack so the destructor's call depth stays flat no matter
    /// how tall the tree got.
    fn drop(&mut self) {
        let mut visit = Vec::new();
        if self.root != self.nil {
            visit.push(self.root);
        }
        // the reverse of a (node, right, left) pre-order is a post-order
        let mut postorder = Vec::with_capacity(self.len);
        while let Some(node) = visit.pop() {
            // SAFETY: every node reachable from the root is live, and the
            //         tree shape means each is visited exactly once.
            unsafe {
                if (*node.as_ptr()).left != self.nil {
                    visit.push((*node.as_ptr()).left);
                }
                if (*node.as_ptr()).right != self.nil {
                    visit.push((*node.as_ptr()).right);
                }
            }
            postorder.push(node);
        }
        for node in postorder.into_iter().rev() {
            // SAFETY: owned by this tree and never touched again.
            unsafe { release_node(node) };
        }
        // SAFETY: allocated in `try_new`, unreachable once the tree is gone,
        //         freed exactly once and last.
        unsafe { release_node(self.nil) };
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn init_logging() {
        // Err here just means another test already installed the logger
        let _ = simplelog::TermLogger::init(
            simplelog::LevelFilter::Warn,
            simplelog::Config::default(),
            simplelog::TerminalMode::Mixed,
            simplelog::ColorChoice::Auto,
        );
    }

    /// Walk the whole tree and assert every structural invariant: root and
    /// sentinel black, no red-red edge, consistent parent links, search
    /// order with ties to the right, and equal black-height along every
    /// path. Returns the tree's black-height.
    fn assert_invariants(tree: &RBTree) -> usize {
        unsafe {
            assert_eq!(
                (*tree.nil.as_ptr()).color,
                Color::Black,
                "sentinel must stay black"
            );
            if tree.root != tree.nil {
                assert_eq!((*tree.root.as_ptr()).color, Color::Black, "root must be black");
                assert_eq!(
                    (*tree.root.as_ptr()).parent,
                    tree.nil,
                    "root's parent must be the sentinel"
                );
            }
            let (black_height, count) = check_subtree(tree, tree.root, None, None);
            assert_eq!(count, tree.len(), "len must match the reachable node count");
            black_height
        }
    }

    /// Returns (black-height, node count) of the subtree at `node`, where
    /// every key must lie in `lo..hi`, `lo` inclusive (equal keys live in
    /// right subtrees) and `hi` exclusive.
    unsafe fn check_subtree(
        tree: &RBTree,
        node: NonNull<Node>,
        lo: Option<Key>,
        hi: Option<Key>,
    ) -> (usize, usize) {
        if node == tree.nil {
            return (0, 0);
        }
        unsafe {
            let n = node.as_ref();
            if let Some(lo) = lo {
                assert!(n.key >= lo, "key {} must be >= ancestor bound {lo}", n.key);
            }
            if let Some(hi) = hi {
                assert!(n.key < hi, "key {} must be < ancestor bound {hi}", n.key);
            }
            if n.color == Color::Red {
                assert_eq!((*n.left.as_ptr()).color, Color::Black, "red-red edge (left)");
                assert_eq!((*n.right.as_ptr()).color, Color::Black, "red-red edge (right)");
            }
            if n.left != tree.nil {
                assert_eq!((*n.left.as_ptr()).parent, node, "broken parent link (left)");
            }
            if n.right != tree.nil {
                assert_eq!((*n.right.as_ptr()).parent, node, "broken parent link (right)");
            }
            let (lh, lc) = check_subtree(tree, n.left, lo, Some(n.key));
            let (rh, rc) = check_subtree(tree, n.right, Some(n.key), hi);
            assert_eq!(lh, rh, "unequal black-heights below key {}", n.key);
            (lh + usize::from(n.color == Color::Black), lc + rc + 1)
        }
    }

    fn flattened(tree: &RBTree) -> Vec<Key> {
        let mut out = vec![0; tree.len()];
        let written = tree.flatten_into(&mut out);
        assert_eq!(written, tree.len());
        out
    }

    #[test]
    fn empty_tree() {
        let tree = RBTree::try_new().unwrap();
        assert!(tree.is_empty());
        assert_eq!(tree.len(), 0);
        assert!(tree.is_nil(tree.min()));
        assert!(tree.is_nil(tree.max()));
        assert_eq!(tree.find(42), None);
        assert_eq!(tree.flatten_into(&mut [0; 4]), 0);
        assert_invariants(&tree);
    }

    #[test]
    fn flatten_is_sorted() {
        let mut tree = RBTree::try_new().unwrap();
        for key in [10, 20, 30, 15, 25, 5] {
            tree.insert(key).unwrap();
            assert_invariants(&tree);
        }
        assert_eq!(flattened(&tree), [5, 10, 15, 20, 25, 30]);
    }

    #[test]
    fn flatten_truncates_silently() {
        let mut tree = RBTree::try_new().unwrap();
        for key in [10, 20, 30, 15, 25, 5] {
            tree.insert(key).unwrap();
        }
        let mut small = [0; 3];
        assert_eq!(tree.flatten_into(&mut small), 3);
        assert_eq!(small, [5, 10, 15]);
        assert_eq!(tree.flatten_into(&mut []), 0);
    }

    #[test]
    fn duplicates_are_distinct_nodes() {
        let mut tree = RBTree::try_new().unwrap();
        let a = tree.insert(5).unwrap();
        let b = tree.insert(5).unwrap();
        let c = tree.insert(5).unwrap();
        assert!(a != b && b != c && a != c);
        assert_eq!(flattened(&tree), [5, 5, 5]);
        assert_invariants(&tree);

        // erasing one particular copy leaves the other two
        let (_, released_before) = alloc_gauge::snapshot();
        assert!(unsafe { tree.erase(b) });
        let (_, released_after) = alloc_gauge::snapshot();
        assert_eq!(released_after - released_before, 1);
        assert_eq!(tree.len(), 2);
        assert_eq!(flattened(&tree), [5, 5]);
        assert_invariants(&tree);
    }

    #[test]
    fn find_returns_some_match() {
        let mut tree = RBTree::try_new().unwrap();
        let handles: Vec<_> = [8, 3, 12, 3].iter().map(|&k| tree.insert(k).unwrap()).collect();
        let found = tree.find(3).expect("3 is present twice");
        assert!(handles.contains(&found));
        assert_eq!(unsafe { tree.key(found) }, 3);
        assert_eq!(tree.find(7), None);
    }

    #[test]
    fn min_max_single_node() {
        let mut tree = RBTree::try_new().unwrap();
        let only = tree.insert(7).unwrap();
        assert_eq!(tree.min(), only);
        assert_eq!(tree.max(), only);
        assert_eq!(unsafe { tree.key(tree.min()) }, 7);
    }

    #[test]
    fn min_max_track_extremes() {
        let mut tree = RBTree::try_new().unwrap();
        for key in [4, -9, 17, 0, 17, -3] {
            tree.insert(key).unwrap();
        }
        assert_eq!(unsafe { tree.key(tree.min()) }, -9);
        assert_eq!(unsafe { tree.key(tree.max()) }, 17);
    }

    #[test]
    fn erase_root_of_two_node_tree() {
        let mut tree = RBTree::try_new().unwrap();
        let root = tree.insert(10).unwrap();
        tree.insert(20).unwrap();
        assert!(unsafe { tree.erase(root) });
        assert_eq!(tree.len(), 1);
        assert_eq!(unsafe { tree.key(NodeRef(tree.root)) }, 20);
        unsafe {
            assert_eq!((*tree.root.as_ptr()).color, Color::Black);
        }
        assert_invariants(&tree);
    }

    #[test]
    fn erase_to_empty() {
        let mut tree = RBTree::try_new().unwrap();
        let only = tree.insert(1).unwrap();
        assert!(unsafe { tree.erase(only) });
        assert!(tree.is_empty());
        assert!(tree.is_nil(tree.min()));
        assert_invariants(&tree);
    }

    #[test]
    fn two_child_erase_frees_the_successor() {
        init_logging();
        let mut tree = RBTree::try_new().unwrap();
        tree.insert(10).unwrap();
        let target = tree.insert(20).unwrap();
        tree.insert(30).unwrap();
        // 20 sits at the root with both children real
        assert_eq!(target.0, tree.root);

        let (_, released_before) = alloc_gauge::snapshot();
        assert!(unsafe { tree.erase(target) });
        let (_, released_after) = alloc_gauge::snapshot();

        // the successor's allocation died; the erased handle lives on,
        // now carrying the successor's key
        assert_eq!(released_after - released_before, 1);
        assert_eq!(unsafe { tree.key(target) }, 30);
        assert_eq!(tree.find(30), Some(target));
        assert_eq!(flattened(&tree), [10, 30]);
        assert_invariants(&tree);
    }

    #[test]
    fn ascending_and_descending_insertions_stay_balanced() {
        for keys in [
            (0..64).collect::<Vec<Key>>(),
            (0..64).rev().collect::<Vec<Key>>(),
        ] {
            let mut tree = RBTree::try_new().unwrap();
            for (i, &key) in keys.iter().enumerate() {
                tree.insert(key).unwrap();
                assert_eq!(tree.len(), i + 1);
                assert_invariants(&tree);
            }
            assert_eq!(flattened(&tree), (0..64).collect::<Vec<Key>>());
        }
    }

    #[test]
    fn erase_by_key_in_every_order() {
        // delete each element first, middle, and last in a few fixed orders
        let orders: [&[Key]; 4] = [
            &[1, 2, 3, 4, 5, 6, 7],
            &[7, 6, 5, 4, 3, 2, 1],
            &[4, 1, 7, 2, 6, 3, 5],
            &[2, 7, 1, 5, 3, 6, 4],
        ];
        for order in orders {
            let mut tree = RBTree::try_new().unwrap();
            for key in 1..=7 {
                tree.insert(key).unwrap();
            }
            for (i, &key) in order.iter().enumerate() {
                let handle = tree.find(key).expect("key still present");
                assert!(unsafe { tree.erase(handle) });
                assert_eq!(tree.len(), 7 - i - 1);
                assert_invariants(&tree);
            }
            assert!(tree.is_empty());
        }
    }

    #[test]
    fn destroy_releases_every_node_exactly_once() {
        const N: usize = 137;
        let (allocs_before, releases_before) = alloc_gauge::snapshot();
        {
            let mut tree = RBTree::try_new().unwrap();
            for key in 0..N as Key {
                tree.insert(key % 31).unwrap();
            }
            assert_eq!(tree.len(), N);
        }
        let (allocs_after, releases_after) = alloc_gauge::snapshot();
        // N real nodes plus the sentinel, each allocated and released once
        assert_eq!(allocs_after - allocs_before, N + 1);
        assert_eq!(releases_after - releases_before, N + 1);
    }

    #[test]
    fn randomized_insert_erase_stress() {
        init_logging();
        let mut rng = StdRng::seed_from_u64(0x5EED_CAFE);
        let mut tree = RBTree::try_new().unwrap();
        // the model is a plain sorted multiset of keys
        let mut model: Vec<Key> = Vec::new();

        for step in 0..4000 {
            let key = rng.gen_range(0..48);
            if model.is_empty() || rng.gen_bool(0.6) {
                tree.insert(key).unwrap();
                let at = model.partition_point(|&k| k <= key);
                model.insert(at, key);
            } else if let Some(handle) = tree.find(key) {
                assert!(unsafe { tree.erase(handle) });
                let at = model.partition_point(|&k| k < key);
                model.remove(at);
            }
            assert_eq!(tree.len(), model.len());
            if step % 97 == 0 {
                assert_invariants(&tree);
                assert_eq!(flattened(&tree), model);
            }
        }

        assert_invariants(&tree);
        assert_eq!(flattened(&tree), model);

        // drain whatever is left, checking balance the whole way down
        while let Some(&key) = model.last() {
            let handle = tree.find(key).expect("model and tree agree");
            assert!(unsafe { tree.erase(handle) });
            model.pop();
            assert_invariants(&tree);
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn black_heights_agree_after_heavy_mixing() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut tree = RBTree::try_new().unwrap();
        for _ in 0..2000 {
            tree.insert(rng.gen_range(0..16)).unwrap();
        }
        for _ in 0..1000 {
            let key = rng.gen_range(0..16);
            if let Some(handle) = tree.find(key) {
                unsafe { tree.erase(handle) };
            }
        }
        // `assert_invariants` recomputes the black-height independently
        // along every root-to-sentinel path and demands they all agree
        let bh = assert_invariants(&tree);
        assert!(bh > 0);
        let keys = flattened(&tree);
        assert!(keys.is_sorted());
    }
}
