//! The per-process tree container: attach, mutate, grow-and-migrate.
//!
//! A [`TreeContainer`] binds one process to one generation of the shared
//! tree. Arena names carry a `<base>_<generation>` suffix; when an
//! insertion runs out of space the container opens (or creates) the
//! successor name at double the size, deep-copies the tree into it, marks
//! the old generation outdated, and retries. Other processes notice the
//! outdated flag on their next operation and walk the successor chain to
//! the current generation.
//!
//! Concurrent migrations resolve through the named-arena creation
//! primitive: both processes race to create `<base>_<N+1>`, exactly one
//! wins and copies, the other attaches to the result.

use crate::error::{Error, Result};
use crate::path::components;
use crate::shm::Arena;
use crate::tree::data::TreeData;
use crate::tree::node::{self, NodeRef, RawNode};
use crate::tree::{TreeFlags, FLAG_DIRECTORY, FLAG_DUMMY};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Smallest arena the container will create. Callers normally pass 64 KiB
/// or more; requests below one page are clamped to this.
pub const MIN_INITIAL_SIZE: usize = 4096;

/// How many successor generations to chase before giving up. Sizes double
/// each step, so this is far beyond any real chain.
const MAX_GENERATIONS: usize = 64;

/// How many grow-and-retry rounds one insertion may trigger.
const MAX_GROW_RETRIES: usize = 32;

/// Name of the single well-known object inside each arena.
const META_NAME: &str = "Meta";

/// The named root object of each arena generation.
///
/// Same layout in every process: the tree root anchor, the container
/// refcount with its cross-process mutex, and the one-way outdated flag.
#[repr(C)]
struct TreeMeta {
    /// Owning offset of the root node.
    root: u64,
    /// Number of containers attached to this arena, process-wide.
    refs: spin::Mutex<i64>,
    /// Set exactly once, when a successor arena supersedes this one.
    outdated: AtomicBool,
}

/// Per-process handle to the shared directory tree.
///
/// Operations take `&mut self` because any of them may rebind the handle
/// to a successor arena. Structural writes are not synchronized across
/// processes by the container itself — deployments serialize writers above
/// this layer (the hook layer of a VFS overlay holds a process-global
/// lock); readers are safe against the documented write discipline.
pub struct TreeContainer<D: TreeData> {
    arena: Arena,
    meta: u64,
    name: String,
    _marker: PhantomData<fn() -> D>,
}

impl<D: TreeData> TreeContainer<D> {
    /// Attach to the named shared tree, creating it if needed.
    ///
    /// A name without a `_<digits>` suffix gets `_1` appended. The initial
    /// size should be a power of two; it is clamped to
    /// [`MIN_INITIAL_SIZE`] and only matters when this call creates the
    /// first generation.
    pub fn new(name: &str, initial_size: usize) -> Result<Self> {
        let name = normalize_name(name);
        let size = initial_size.max(MIN_INITIAL_SIZE);
        let (arena, meta) = Self::attach(&name, size, None)?;
        let container = Self {
            arena,
            meta,
            name,
            _marker: PhantomData,
        };
        let root = NodeRef::<D>::adopt(&container.arena, container.root_off());
        info!(
            name = %container.name,
            nodes = root.num_nodes_recursive(),
            size = container.arena.size(),
            "attached to shared directory tree"
        );
        Ok(container)
    }

    /// Current arena name; changes after migrations.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle to the current arena, for constructing payload values.
    pub fn arena(&self) -> Arena {
        self.arena.clone()
    }

    /// Borrow the root node, rebinding first if this arena is outdated.
    pub fn root(&mut self) -> Result<NodeRef<D>> {
        self.ensure_current()?;
        Ok(NodeRef::adopt(&self.arena, self.root_off()))
    }

    /// Insert a leaf at `path`, creating dummy directories along the way.
    ///
    /// Returns the inserted node, or `None` when a node already exists at
    /// `path` and `overwrite` is false. Allocation pressure is handled
    /// internally by migrating to a doubled arena and retrying.
    pub fn add_file(
        &mut self,
        path: &str,
        source: &D::Source,
        flags: TreeFlags,
        overwrite: bool,
    ) -> Result<Option<NodeRef<D>>> {
        self.add_node(path, source, flags, overwrite)
    }

    /// Insert an interior node at `path`; implies [`FLAG_DIRECTORY`].
    pub fn add_directory(
        &mut self,
        path: &str,
        source: &D::Source,
        flags: TreeFlags,
        overwrite: bool,
    ) -> Result<Option<NodeRef<D>>> {
        self.add_node(path, source, flags | FLAG_DIRECTORY, overwrite)
    }

    /// Remove all children of the root. The root itself persists.
    pub fn clear(&mut self) -> Result<()> {
        self.root()?.clear();
        Ok(())
    }

    /// Find a node by path; see [`NodeRef::find_by_path`].
    pub fn find_by_path(&mut self, path: &str) -> Result<Option<NodeRef<D>>> {
        Ok(self.root()?.find_by_path(path))
    }

    /// Find all nodes matching a glob pattern; see [`NodeRef::find`].
    pub fn find(&mut self, pattern: &str) -> Result<Vec<NodeRef<D>>> {
        Ok(self.root()?.find(pattern))
    }

    /// Visit nodes along a path; see [`NodeRef::visit_path`].
    pub fn visit_path(&mut self, path: &str, visitor: impl FnMut(&NodeRef<D>)) -> Result<()> {
        self.root()?.visit_path(path, visitor);
        Ok(())
    }

    fn meta_ptr(&self) -> *const TreeMeta {
        self.arena.at(self.meta) as *const TreeMeta
    }

    fn root_off(&self) -> u64 {
        // SAFETY: meta points at the TreeMeta constructed at attach; root
        // is written once before the meta is published.
        unsafe { (*self.meta_ptr()).root }
    }

    /// Re-bind to the current generation if ours has been superseded.
    fn ensure_current(&mut self) -> Result<()> {
        // SAFETY: meta stays valid while we hold the arena mapping.
        let outdated = unsafe { (*self.meta_ptr()).outdated.load(Ordering::Acquire) };
        if outdated {
            self.reassign()?;
        }
        Ok(())
    }

    fn add_node(
        &mut self,
        path: &str,
        source: &D::Source,
        flags: TreeFlags,
        overwrite: bool,
    ) -> Result<Option<NodeRef<D>>> {
        for _ in 0..MAX_GROW_RETRIES {
            self.ensure_current()?;
            match self.try_insert(path, source, flags, overwrite) {
                Ok(result) => return Ok(result),
                Err(Error::OutOfArena) => {
                    debug!(name = %self.name, path, "arena full during insert, migrating");
                    self.reassign()?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::OutOfArena)
    }

    /// One insertion attempt against the current arena.
    fn try_insert(
        &self,
        path: &str,
        source: &D::Source,
        flags: TreeFlags,
        overwrite: bool,
    ) -> Result<Option<NodeRef<D>>> {
        let comps: Vec<&str> = components(path).collect();
        let Some((&last, dirs)) = comps.split_last() else {
            return Ok(None);
        };
        let arena = &self.arena;
        // SAFETY: offsets walked here come from the live tree; new nodes
        // are fully constructed before they are attached.
        unsafe {
            let mut cur = self.root_off();
            for comp in dirs {
                cur = match node::lookup_child::<D>(arena, cur, comp.as_bytes()) {
                    Ok((_, child)) => child,
                    Err(pos) => {
                        let data = D::empty(arena)?;
                        let fresh = node::construct_node::<D>(
                            arena,
                            comp.as_bytes(),
                            FLAG_DIRECTORY | FLAG_DUMMY,
                            data,
                            cur,
                        )?;
                        if let Err(e) = node::insert_child_at::<D>(arena, cur, pos, fresh) {
                            node::release_ref::<D>(arena, fresh);
                            return Err(e);
                        }
                        fresh
                    }
                };
            }
            match node::lookup_child::<D>(arena, cur, last.as_bytes()) {
                Ok((idx, existing)) => {
                    if !overwrite {
                        return Ok(None);
                    }
                    let raw = arena.at(existing) as *mut RawNode<D>;
                    let was_dummy = (*raw).flags.load(Ordering::Acquire) & FLAG_DUMMY != 0;
                    if was_dummy && flags & FLAG_DIRECTORY != 0 {
                        // Upgrade the dummy in place: new payload, explicit
                        // flags, children preserved.
                        let data = D::construct(source, arena)?;
                        (*raw).data.destroy(arena);
                        std::ptr::write(&mut (*raw).data, data);
                        (*raw).flags.store(flags, Ordering::Release);
                        return Ok(Some(NodeRef::adopt(arena, existing)));
                    }
                    let data = D::construct(source, arena)?;
                    let fresh = node::construct_node::<D>(arena, last.as_bytes(), flags, data, cur)?;
                    let old = node::replace_child_at::<D>(arena, cur, idx, fresh);
                    (*(arena.at(old) as *const RawNode<D>))
                        .parent
                        .store(0, Ordering::Release);
                    node::release_ref::<D>(arena, old);
                    Ok(Some(NodeRef::adopt(arena, fresh)))
                }
                Err(pos) => {
                    let data = D::construct(source, arena)?;
                    let fresh = node::construct_node::<D>(arena, last.as_bytes(), flags, data, cur)?;
                    if let Err(e) = node::insert_child_at::<D>(arena, cur, pos, fresh) {
                        node::release_ref::<D>(arena, fresh);
                        return Err(e);
                    }
                    Ok(Some(NodeRef::adopt(arena, fresh)))
                }
            }
        }
    }

    /// Open or create `name`, find or construct its meta object, and take
    /// one container reference on it. When this call constructs the meta
    /// and `prev` names a predecessor, the whole tree is deep-copied in
    /// before the meta becomes visible to anyone else.
    fn attach(name: &str, size: usize, prev: Option<(&Arena, u64)>) -> Result<(Arena, u64)> {
        let (arena, _created) = Arena::open_or_create(name, size)?;
        let (meta, _constructed) = arena.find_or_construct(META_NAME, || {
            let data = D::empty(&arena)?;
            let root = node::construct_node::<D>(&arena, b"", FLAG_DIRECTORY, data, 0)?;
            if let Some((src_arena, src_meta)) = prev {
                // SAFETY: src_meta is the predecessor's live meta object.
                let src_root = unsafe { (*(src_arena.at(src_meta) as *const TreeMeta)).root };
                // SAFETY: both roots are live, freshly constructed dst.
                unsafe { copy_tree::<D>(&arena, root, src_arena, src_root)? };
            }
            let meta = arena.alloc(std::mem::size_of::<TreeMeta>())?;
            // SAFETY: fresh allocation sized for TreeMeta.
            unsafe {
                std::ptr::write(
                    arena.at(meta) as *mut TreeMeta,
                    TreeMeta {
                        root,
                        refs: spin::Mutex::new(0),
                        outdated: AtomicBool::new(false),
                    },
                );
            }
            Ok(meta)
        })?;
        // SAFETY: meta is live from here on.
        unsafe {
            let mut refs = (*(arena.at(meta) as *const TreeMeta)).refs.lock();
            *refs += 1;
        }
        Ok((arena, meta))
    }

    /// Drop one container reference; the last one unlinks the arena.
    ///
    /// # Safety
    ///
    /// `meta` must be the live meta object of `arena` and the caller must
    /// own one reference on it.
    unsafe fn release(arena: &Arena, meta: u64, name: &str) {
        // SAFETY: caller contract.
        unsafe {
            let meta_ptr = arena.at(meta) as *const TreeMeta;
            let remaining = {
                let mut refs = (*meta_ptr).refs.lock();
                *refs -= 1;
                *refs
            };
            if remaining == 0 {
                node::release_ref::<D>(arena, (*meta_ptr).root);
                arena.free(meta);
                let _ = Arena::unlink(name);
                debug!(name, "last user detached, arena unlinked");
            }
        }
    }

    /// Walk successor names until a current generation is reached,
    /// creating (and populating) the next one when it does not exist yet.
    fn reassign(&mut self) -> Result<()> {
        // SAFETY: our meta is live; the flag is one-way.
        unsafe { (*self.meta_ptr()).outdated.store(true, Ordering::Release) };
        for _ in 0..MAX_GENERATIONS {
            let next = successor_name(&self.name)?;
            let size = self.arena.size().saturating_mul(2);
            let (arena, meta) = Self::attach(&next, size, Some((&self.arena, self.meta)))?;

            let old_arena = std::mem::replace(&mut self.arena, arena);
            let old_meta = std::mem::replace(&mut self.meta, meta);
            let old_name = std::mem::replace(&mut self.name, next);
            // SAFETY: we owned one reference on the old meta.
            unsafe { Self::release(&old_arena, old_meta, &old_name) };

            // SAFETY: the new meta is live.
            let outdated = unsafe { (*self.meta_ptr()).outdated.load(Ordering::Acquire) };
            if !outdated {
                info!(
                    name = %self.name,
                    size = self.arena.size(),
                    "rebound to successor arena"
                );
                return Ok(());
            }
        }
        Err(Error::OutOfArena)
    }
}

impl<D: TreeData> Drop for TreeContainer<D> {
    fn drop(&mut self) {
        // SAFETY: the container owns one reference on its meta.
        unsafe { Self::release(&self.arena, self.meta, &self.name) };
    }
}

/// Deep-copy a subtree into another arena.
///
/// The destination node exists with empty payload and children; flags,
/// name bytes and payload are copied over, then children are constructed
/// with their parent offset known before descent, which is what keeps
/// invariant "parent's map slot points back at each child" intact in the
/// copy.
///
/// # Safety
///
/// `dst`/`src` must be live nodes of payload type `D` in their respective
/// arenas, with `dst` not yet reachable by other processes.
unsafe fn copy_tree<D: TreeData>(
    dst_arena: &Arena,
    dst: u64,
    src_arena: &Arena,
    src: u64,
) -> Result<()> {
    // SAFETY: caller contract; the source tree is not mutated while the
    // copy runs (writers are serialized above this crate).
    unsafe {
        let dst_node = dst_arena.at(dst) as *mut RawNode<D>;
        let src_node = src_arena.at(src) as *const RawNode<D>;
        (*dst_node)
            .flags
            .store((*src_node).flags.load(Ordering::Acquire), Ordering::Release);
        (*dst_node)
            .name
            .assign((*src_node).name.as_slice(src_arena), dst_arena)?;
        (*dst_node)
            .data
            .assign(&(*src_node).data, dst_arena, src_arena)?;
        let src_children: Vec<u64> = node::child_slots::<D>(src_arena, src_node).to_vec();
        for (index, child) in src_children.into_iter().enumerate() {
            let data = D::empty(dst_arena)?;
            let fresh = node::construct_node::<D>(dst_arena, b"", 0, data, dst)?;
            if let Err(e) = copy_tree::<D>(dst_arena, fresh, src_arena, child) {
                node::release_ref::<D>(dst_arena, fresh);
                return Err(e);
            }
            // Source order is already sorted under the same comparator.
            if let Err(e) = node::insert_child_at::<D>(dst_arena, dst, index, fresh) {
                node::release_ref::<D>(dst_arena, fresh);
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Append `_1` when the name lacks a generation suffix.
fn normalize_name(name: &str) -> String {
    match name.rsplit_once('_') {
        Some((_, digits)) if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
            name.to_string()
        }
        _ => format!("{name}_1"),
    }
}

/// `<base>_<N>` → `<base>_<N+1>`.
fn successor_name(name: &str) -> Result<String> {
    let (base, digits) = name
        .rsplit_once('_')
        .ok_or_else(|| Error::InvalidName(name.to_string()))?;
    let generation: u64 = digits
        .parse()
        .map_err(|_| Error::InvalidName(name.to_string()))?;
    Ok(format!("{base}_{}", generation + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("svc"), "svc_1");
        assert_eq!(normalize_name("svc_1"), "svc_1");
        assert_eq!(normalize_name("svc_42"), "svc_42");
        assert_eq!(normalize_name("svc_"), "svc__1");
        assert_eq!(normalize_name("svc_a1"), "svc_a1_1");
    }

    #[test]
    fn test_successor_name() {
        assert_eq!(successor_name("svc_1").unwrap(), "svc_2");
        assert_eq!(successor_name("svc_9").unwrap(), "svc_10");
        assert_eq!(successor_name("a_b_3").unwrap(), "a_b_4");
        assert!(matches!(
            successor_name("nosuffix").unwrap_err(),
            Error::InvalidName(_)
        ));
        assert!(matches!(
            successor_name("svc_x").unwrap_err(),
            Error::InvalidName(_)
        ));
    }
}
