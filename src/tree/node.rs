//! The directory tree node and its per-process handle.
//!
//! A tree is a graph of [`RawNode`]s living entirely inside one arena.
//! Ownership runs strictly child-ward: a parent's child map holds the
//! owning reference to each child, and the tree meta object anchors the
//! root. Parent links are plain offsets that own nothing; a dying parent
//! nulls them first, so they behave like weak pointers without needing
//! control blocks in shared memory.
//!
//! # Layout
//!
//! ```text
//! RawNode
//! ┌───────────────┬────────┬─────────┬───────┬───────────┬──────────┐
//! │ refs (atomic) │ flags  │ parent  │ name  │ children  │ payload  │
//! └───────────────┴────────┴─────────┴───────┴───────────┴──────────┘
//!                              │          │        │
//!                              ▼          ▼        ▼
//!                        parent node   arena     sorted [u64] of
//!                        offset (weak) bytes     child offsets
//! ```
//!
//! The child array is kept sorted under ASCII case folding, so lookup is a
//! binary search and iteration yields case-insensitively sorted names.
//!
//! # Handles and reference counting
//!
//! [`NodeRef`] is the per-process handle: an arena mapping plus an offset.
//! Clone/drop adjust the node's in-arena atomic refcount, which counts the
//! owning map slot (or root anchor) plus every live handle in any process.
//! A node a caller still holds therefore survives being overwritten or
//! cleared out of the tree; its storage is reclaimed when the last handle
//! goes away.
//!
//! Structural mutation (insert/remove) is not synchronized here; the
//! deployment serializes writers above this crate. Reads tolerate that by
//! construction: nodes are fully built before they become reachable.

use crate::error::{Error, Result};
use crate::path::{self, components};
use crate::shm::Arena;
use crate::tree::data::{ShmBytes, TreeData};
use crate::tree::{TreeFlags, FLAG_DIRECTORY, FLAG_DUMMY};
use crate::wildcard;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// One path component stored in the arena.
#[repr(C)]
pub(crate) struct RawNode<D> {
    /// Strong references: owning map slot / root anchor + live handles.
    pub(crate) refs: AtomicU32,
    /// Flag bits, see [`crate::tree::FLAG_DIRECTORY`] and friends.
    pub(crate) flags: AtomicU8,
    _pad: [u8; 3],
    /// Weak back-reference: arena offset of the parent, 0 when detached.
    pub(crate) parent: AtomicU64,
    /// One path segment, never containing separators. Empty for the root.
    pub(crate) name: ShmBytes,
    /// Case-insensitively sorted child map.
    pub(crate) children: ChildList,
    /// User payload.
    pub(crate) data: D,
}

/// Sorted array of child node offsets.
#[repr(C)]
pub(crate) struct ChildList {
    entries: u64,
    len: u32,
    cap: u32,
}

/// Construct a node in the arena, fully initialized and unreachable.
///
/// The returned offset carries a refcount of 1 on behalf of the owning
/// reference about to be stored (a parent slot or the root anchor). On
/// failure the payload and any partial storage are released.
pub(crate) fn construct_node<D: TreeData>(
    arena: &Arena,
    name: &[u8],
    flags: TreeFlags,
    mut data: D,
    parent: u64,
) -> Result<u64> {
    debug_assert!(std::mem::align_of::<RawNode<D>>() <= crate::shm::ALLOC_ALIGN);
    let name_bytes = match ShmBytes::from_slice(name, arena) {
        Ok(b) => b,
        Err(e) => {
            data.destroy(arena);
            return Err(e);
        }
    };
    let off = match arena.alloc(std::mem::size_of::<RawNode<D>>()) {
        Ok(off) => off,
        Err(e) => {
            let mut name_bytes = name_bytes;
            name_bytes.free(arena);
            data.destroy(arena);
            return Err(e);
        }
    };
    // SAFETY: off is a fresh allocation sized for RawNode<D>.
    unsafe {
        std::ptr::write(
            arena.at(off) as *mut RawNode<D>,
            RawNode {
                refs: AtomicU32::new(1),
                flags: AtomicU8::new(flags),
                _pad: [0; 3],
                parent: AtomicU64::new(parent),
                name: name_bytes,
                children: ChildList {
                    entries: 0,
                    len: 0,
                    cap: 0,
                },
                data,
            },
        );
    }
    Ok(off)
}

/// Bump a node's refcount on behalf of a new owner or handle.
///
/// # Safety
///
/// `off` must be a live node of payload type `D` in `arena`.
pub(crate) unsafe fn inc_ref<D: TreeData>(arena: &Arena, off: u64) {
    let node = arena.at(off) as *const RawNode<D>;
    // SAFETY: caller guarantees a live node.
    let old = unsafe { (*node).refs.fetch_add(1, Ordering::AcqRel) };
    if old > i32::MAX as u32 {
        // SAFETY: same node as above.
        unsafe { (*node).refs.fetch_sub(1, Ordering::AcqRel) };
        panic!("node refcount overflow");
    }
}

/// Drop one strong reference; the last one destroys the node.
///
/// # Safety
///
/// `off` must be a live node of payload type `D` in `arena`, and the
/// caller must own the reference being released.
pub(crate) unsafe fn release_ref<D: TreeData>(arena: &Arena, off: u64) {
    let node = arena.at(off) as *const RawNode<D>;
    // SAFETY: caller guarantees a live node.
    let old = unsafe { (*node).refs.fetch_sub(1, Ordering::AcqRel) };
    debug_assert!(old > 0, "node refcount underflow");
    if old == 1 {
        // SAFETY: refcount reached zero; nothing else references the node.
        unsafe { destroy_node::<D>(arena, off) };
    }
}

/// Tear a node down: detach children, free name/payload/map storage.
unsafe fn destroy_node<D: TreeData>(arena: &Arena, off: u64) {
    let node = arena.at(off) as *mut RawNode<D>;
    // SAFETY: exclusive access — the refcount hit zero.
    unsafe {
        let len = (*node).children.len as usize;
        let entries = (*node).children.entries;
        for i in 0..len {
            let child = *(arena.at(entries) as *const u64).add(i);
            // Weak parent links of surviving children must not dangle.
            (*(arena.at(child) as *const RawNode<D>))
                .parent
                .store(0, Ordering::Release);
            release_ref::<D>(arena, child);
        }
        if entries != 0 {
            arena.free(entries);
        }
        (*node).name.free(arena);
        (*node).data.destroy(arena);
        arena.free(off);
    }
}

/// View the sorted child offsets of a node.
///
/// # Safety
///
/// `node` must point at a live `RawNode<D>` inside `arena`.
pub(crate) unsafe fn child_slots<'a, D: TreeData>(
    arena: &'a Arena,
    node: *const RawNode<D>,
) -> &'a [u64] {
    // SAFETY: entries/len describe a live allocation of this node.
    unsafe {
        let cl = &(*node).children;
        if cl.len == 0 {
            &[]
        } else {
            std::slice::from_raw_parts(arena.at(cl.entries) as *const u64, cl.len as usize)
        }
    }
}

/// Binary search a node's children by case-insensitive name.
///
/// Returns `Ok((index, child_offset))` or `Err(insertion_index)`.
///
/// # Safety
///
/// `parent` must be a live node of payload type `D` in `arena`.
pub(crate) unsafe fn lookup_child<D: TreeData>(
    arena: &Arena,
    parent: u64,
    name: &[u8],
) -> std::result::Result<(usize, u64), usize> {
    let node = arena.at(parent) as *const RawNode<D>;
    // SAFETY: caller guarantees a live node; slots hold live children.
    unsafe {
        let slots = child_slots::<D>(arena, node);
        slots
            .binary_search_by(|&coff| {
                let child = arena.at(coff) as *const RawNode<D>;
                path::icmp((*child).name.as_slice(arena), name)
            })
            .map(|idx| (idx, slots[idx]))
    }
}

/// Insert a child offset at a known position in the sorted array.
///
/// The only node operation that allocates, and only for the array itself;
/// failure leaves the map unchanged.
///
/// # Safety
///
/// `parent` must be a live node of payload type `D`, `index` the insertion
/// point reported by [`lookup_child`], and `child` a live node.
pub(crate) unsafe fn insert_child_at<D: TreeData>(
    arena: &Arena,
    parent: u64,
    index: usize,
    child: u64,
) -> Result<()> {
    let node = arena.at(parent) as *mut RawNode<D>;
    // SAFETY: caller contract; growth copies stay inside allocations.
    unsafe {
        let cl = &mut (*node).children;
        if cl.len == cl.cap {
            let new_cap = if cl.cap == 0 { 8 } else { cl.cap * 2 };
            let new_entries = arena.alloc(new_cap as usize * std::mem::size_of::<u64>())?;
            if cl.len > 0 {
                std::ptr::copy_nonoverlapping(
                    arena.at(cl.entries) as *const u64,
                    arena.at(new_entries) as *mut u64,
                    cl.len as usize,
                );
            }
            if cl.entries != 0 {
                arena.free(cl.entries);
            }
            cl.entries = new_entries;
            cl.cap = new_cap;
        }
        let len = cl.len as usize;
        let slots = std::slice::from_raw_parts_mut(arena.at(cl.entries) as *mut u64, len + 1);
        slots.copy_within(index..len, index + 1);
        slots[index] = child;
        cl.len += 1;
    }
    Ok(())
}

/// Swap the child stored at `index`, returning the previous offset.
///
/// # Safety
///
/// `parent` must be a live node of payload type `D` and `index` in bounds.
pub(crate) unsafe fn replace_child_at<D: TreeData>(
    arena: &Arena,
    parent: u64,
    index: usize,
    child: u64,
) -> u64 {
    let node = arena.at(parent) as *mut RawNode<D>;
    // SAFETY: caller contract.
    unsafe {
        let cl = &(*node).children;
        let slots =
            std::slice::from_raw_parts_mut(arena.at(cl.entries) as *mut u64, cl.len as usize);
        std::mem::replace(&mut slots[index], child)
    }
}

/// Remove the child at `index` from the sorted array, returning its offset.
///
/// # Safety
///
/// `parent` must be a live node of payload type `D` and `index` in bounds.
pub(crate) unsafe fn remove_child_at<D: TreeData>(
    arena: &Arena,
    parent: u64,
    index: usize,
) -> u64 {
    let node = arena.at(parent) as *mut RawNode<D>;
    // SAFETY: caller contract.
    unsafe {
        let cl = &mut (*node).children;
        let len = cl.len as usize;
        let slots = std::slice::from_raw_parts_mut(arena.at(cl.entries) as *mut u64, len);
        let old = slots[index];
        slots.copy_within(index + 1..len, index);
        cl.len -= 1;
        old
    }
}

/// A borrowed view of one tree node.
///
/// Holding a `NodeRef` keeps the node (and its arena mapping) alive even
/// if the tree drops or overwrites it, and even across a migration to a
/// successor arena. It does *not* track migrations: handles always view
/// the arena generation they were created from, which is exactly the
/// borrowed-reference semantics the container documents.
pub struct NodeRef<D: TreeData> {
    arena: Arena,
    off: u64,
    _marker: PhantomData<fn() -> D>,
}

impl<D: TreeData> NodeRef<D> {
    /// Wrap an offset, taking a new strong reference.
    pub(crate) fn adopt(arena: &Arena, off: u64) -> Self {
        // SAFETY: callers only adopt offsets of live nodes.
        unsafe { inc_ref::<D>(arena, off) };
        Self {
            arena: arena.clone(),
            off,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn raw(&self) -> *mut RawNode<D> {
        self.arena.at(self.off) as *mut RawNode<D>
    }

    /// The arena this node lives in, usable to read arena-backed payloads.
    #[inline]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    fn name_bytes(&self) -> &[u8] {
        // SAFETY: the handle keeps the node alive.
        unsafe { (*(self.raw() as *const RawNode<D>)).name.as_slice(&self.arena) }
    }

    /// This node's path component.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }

    /// Full path from the root, `/`-joined; the root itself is `/`.
    pub fn path(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        let mut cur = self.off;
        // SAFETY: each hop keeps to live nodes; parent links are nulled
        // before a parent can die.
        unsafe {
            loop {
                let node = self.arena.at(cur) as *const RawNode<D>;
                let name = (*node).name.as_slice(&self.arena);
                if !name.is_empty() {
                    parts.push(String::from_utf8_lossy(name).into_owned());
                }
                let parent = (*node).parent.load(Ordering::Acquire);
                if parent == 0 {
                    break;
                }
                cur = parent;
            }
        }
        if parts.is_empty() {
            return String::from(path::SEPARATOR);
        }
        let mut out = String::new();
        for part in parts.iter().rev() {
            out.push(path::SEPARATOR);
            out.push_str(part);
        }
        out
    }

    /// Parent node, or `None` for the root and for detached nodes.
    pub fn parent(&self) -> Option<NodeRef<D>> {
        // SAFETY: the handle keeps the node alive.
        let p = unsafe { (*(self.raw() as *const RawNode<D>)).parent.load(Ordering::Acquire) };
        (p != 0).then(|| NodeRef::adopt(&self.arena, p))
    }

    /// Current flag bits.
    pub fn flags(&self) -> TreeFlags {
        // SAFETY: the handle keeps the node alive.
        unsafe { (*(self.raw() as *const RawNode<D>)).flags.load(Ordering::Acquire) }
    }

    /// Whether the given flag is set.
    #[inline]
    pub fn has_flag(&self, flag: TreeFlags) -> bool {
        self.flags() & flag != 0
    }

    /// Set or clear a flag.
    pub fn set_flag(&self, flag: TreeFlags, enabled: bool) {
        // SAFETY: the handle keeps the node alive.
        let flags = unsafe { &(*(self.raw() as *const RawNode<D>)).flags };
        if enabled {
            flags.fetch_or(flag, Ordering::AcqRel);
        } else {
            flags.fetch_and(!flag, Ordering::AcqRel);
        }
    }

    /// Whether this node is a directory.
    #[inline]
    pub fn is_directory(&self) -> bool {
        self.has_flag(FLAG_DIRECTORY)
    }

    /// Borrow the payload.
    pub fn data(&self) -> &D {
        // SAFETY: the handle keeps the node alive; payload mutation goes
        // through the container's writer discipline.
        unsafe { &(*(self.raw() as *const RawNode<D>)).data }
    }

    /// Number of direct children.
    pub fn num_children(&self) -> usize {
        // SAFETY: the handle keeps the node alive.
        unsafe { (*(self.raw() as *const RawNode<D>)).children.len as usize }
    }

    /// Number of nodes in this subtree, including this one.
    pub fn num_nodes_recursive(&self) -> usize {
        // SAFETY: the handle keeps the subtree alive.
        unsafe { count_recursive::<D>(&self.arena, self.off) }
    }

    /// Child with the given name, compared case-insensitively.
    pub fn child_by_name(&self, name: &str) -> Option<NodeRef<D>> {
        // SAFETY: the handle keeps the node alive.
        match unsafe { lookup_child::<D>(&self.arena, self.off, name.as_bytes()) } {
            Ok((_, child)) => Some(NodeRef::adopt(&self.arena, child)),
            Err(_) => None,
        }
    }

    /// Like [`NodeRef::child_by_name`], but a missing child is an error.
    pub fn child_by_name_required(&self, name: &str) -> Result<NodeRef<D>> {
        self.child_by_name(name)
            .ok_or_else(|| Error::NodeMissing(name.to_string()))
    }

    /// Whether a child with the given name exists.
    pub fn exists(&self, name: &str) -> bool {
        // SAFETY: the handle keeps the node alive.
        unsafe { lookup_child::<D>(&self.arena, self.off, name.as_bytes()).is_ok() }
    }

    /// Descend `path` component by component.
    ///
    /// Accepts both separator flavors, skips empty components, and returns
    /// `None` at the first miss. The empty path resolves to this node.
    pub fn find_by_path(&self, path: &str) -> Option<NodeRef<D>> {
        let mut cur = self.clone();
        for comp in components(path) {
            cur = cur.child_by_name(comp)?;
        }
        Some(cur)
    }

    /// Call `visitor` for each node along `path`, in descent order,
    /// stopping quietly at the first missing component.
    pub fn visit_path(&self, path: &str, mut visitor: impl FnMut(&NodeRef<D>)) {
        let mut cur = self.clone();
        for comp in components(path) {
            match cur.child_by_name(comp) {
                Some(next) => {
                    visitor(&next);
                    cur = next;
                }
                None => break,
            }
        }
    }

    /// All descendants whose path matches a glob pattern.
    ///
    /// The longest literal prefix ending at the last separator before the
    /// first wildcard anchors the search at a descendant directory; the
    /// residual pattern then walks the anchored subtree one component at a
    /// time (see [`crate::wildcard::partial_match`]). `*` followed by a
    /// separator matches exactly one directory level. Results come back in
    /// case-insensitive sorted map order.
    pub fn find(&self, pattern: &str) -> Vec<NodeRef<D>> {
        let pat = pattern.as_bytes();
        let mut out = Vec::new();
        let wild = pat.iter().position(|&b| b == b'*' || b == b'?');
        let anchor = match wild {
            None | Some(0) => None,
            Some(w) => pat[..w].iter().rposition(|&b| path::is_separator(b)),
        };
        match anchor {
            Some(sep) => {
                if let Some(node) = self.find_by_path(&pattern[..sep]) {
                    node.find_local(&pat[sep + 1..], &mut out);
                }
            }
            None => self.find_local(pat, &mut out),
        }
        out
    }

    fn find_local(&self, pattern: &[u8], out: &mut Vec<NodeRef<D>>) {
        for child in self.children() {
            // `*` before a separator may stand for one directory level
            // (one, not several).
            if pattern.len() > 1
                && pattern[0] == b'*'
                && path::is_separator(pattern[1])
                && child.is_directory()
            {
                child.find_local(&pattern[2..], out);
                continue;
            }
            let rest = wildcard::partial_match(child.name_bytes(), pattern);
            if let Some(rest) = rest {
                if rest.is_empty() || rest == &b"*"[..] {
                    out.push(child.clone());
                }
                if !rest.is_empty() && child.is_directory() {
                    child.find_local(rest, out);
                }
            }
        }
    }

    /// Iterate the children in case-insensitive sorted order.
    ///
    /// The iterator reads the live map; removing entries while iterating
    /// skips or repeats neighbors the way any index-based walk would.
    pub fn children(&self) -> Children<D> {
        Children {
            parent: self.clone(),
            index: 0,
        }
    }

    /// Remove the named child. Returns whether anything was removed.
    ///
    /// The child's subtree is destroyed unless handles keep parts alive.
    pub fn remove_child(&self, name: &str) -> bool {
        // SAFETY: the handle keeps the node alive; removal follows the
        // owning-slot protocol (null the weak parent, drop the reference).
        unsafe {
            match lookup_child::<D>(&self.arena, self.off, name.as_bytes()) {
                Ok((idx, child)) => {
                    let removed = remove_child_at::<D>(&self.arena, self.off, idx);
                    debug_assert_eq!(removed, child);
                    (*(self.arena.at(removed) as *const RawNode<D>))
                        .parent
                        .store(0, Ordering::Release);
                    release_ref::<D>(&self.arena, removed);
                    true
                }
                Err(_) => false,
            }
        }
    }

    /// Remove all children. The node itself persists.
    pub fn clear(&self) {
        // SAFETY: the handle keeps the node alive; children are detached
        // before their owning references drop.
        unsafe {
            let node = self.raw();
            let len = (*node).children.len as usize;
            let entries = (*node).children.entries;
            let offs: Vec<u64> = (0..len)
                .map(|i| *(self.arena.at(entries) as *const u64).add(i))
                .collect();
            (*node).children.len = 0;
            for off in offs {
                (*(self.arena.at(off) as *const RawNode<D>))
                    .parent
                    .store(0, Ordering::Release);
                release_ref::<D>(&self.arena, off);
            }
        }
    }

    /// Write an indented dump of this subtree, one node per line.
    pub fn dump(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        self.dump_level(w, 0)
    }

    fn dump_level(&self, w: &mut dyn fmt::Write, level: usize) -> fmt::Result {
        let name = self.name();
        let shown = if name.is_empty() { "/" } else { name.as_str() };
        let marker = if self.has_flag(FLAG_DUMMY) {
            " [dummy]"
        } else if self.is_directory() {
            " [dir]"
        } else {
            ""
        };
        writeln!(w, "{:indent$}{shown}{marker}", "", indent = level * 2)?;
        for child in self.children() {
            child.dump_level(w, level + 1)?;
        }
        Ok(())
    }
}

unsafe fn count_recursive<D: TreeData>(arena: &Arena, off: u64) -> usize {
    let node = arena.at(off) as *const RawNode<D>;
    let mut total = 1;
    // SAFETY: caller guarantees a live subtree.
    unsafe {
        for &child in child_slots::<D>(arena, node) {
            total += count_recursive::<D>(arena, child);
        }
    }
    total
}

impl<D: TreeData> Clone for NodeRef<D> {
    fn clone(&self) -> Self {
        Self::adopt(&self.arena, self.off)
    }
}

impl<D: TreeData> Drop for NodeRef<D> {
    fn drop(&mut self) {
        // SAFETY: this handle owns exactly one strong reference.
        unsafe { release_ref::<D>(&self.arena, self.off) };
    }
}

impl<D: TreeData> PartialEq for NodeRef<D> {
    /// Identity comparison: same node through the same mapping.
    fn eq(&self, other: &Self) -> bool {
        self.off == other.off && self.arena.same_mapping(&other.arena)
    }
}

impl<D: TreeData> Eq for NodeRef<D> {}

impl<D: TreeData> fmt::Debug for NodeRef<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SAFETY: the handle keeps the node alive.
        let refs = unsafe { (*(self.raw() as *const RawNode<D>)).refs.load(Ordering::Acquire) };
        f.debug_struct("NodeRef")
            .field("path", &self.path())
            .field("flags", &self.flags())
            .field("refs", &refs)
            .finish()
    }
}

/// Iterator over a node's children, see [`NodeRef::children`].
pub struct Children<D: TreeData> {
    parent: NodeRef<D>,
    index: usize,
}

impl<D: TreeData> Iterator for Children<D> {
    type Item = NodeRef<D>;

    fn next(&mut self) -> Option<NodeRef<D>> {
        // SAFETY: the parent handle keeps the map alive; the bounds check
        // re-reads the live length.
        unsafe {
            let node = self.parent.raw() as *const RawNode<D>;
            let slots = child_slots::<D>(&self.parent.arena, node);
            let off = *slots.get(self.index)?;
            self.index += 1;
            Some(NodeRef::adopt(&self.parent.arena, off))
        }
    }
}
