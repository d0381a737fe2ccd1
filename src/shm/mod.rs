//! Named shared memory arenas.
//!
//! An [`Arena`] is a named shared memory segment with an embedded
//! allocator and a tiny named-object table. It is the storage substrate for
//! one generation of the directory tree: every node, name and payload byte
//! lives inside it, addressed by base-relative offsets so that processes
//! mapping it at different addresses agree on every reference.
//!
//! Arenas are created with `open_or_create`: whichever process creates the
//! name first initializes the header, everyone else opens and waits for the
//! magic word. That creation primitive is also what resolves concurrent
//! migrations — both processes race to create the successor name, exactly
//! one wins, and the loser simply attaches.

mod alloc;
mod segment;

use crate::error::{Error, Result};
use alloc::{ArenaHeader, NamedLookup};
use rustix::io::Errno;
use segment::Segment;
use std::sync::Arc;
use tracing::{debug, trace};

pub use alloc::ALLOC_ALIGN;

/// How long to spin waiting for a creator or constructor in another
/// process before declaring the arena unavailable.
const INIT_SPIN_LIMIT: usize = 1_000_000;

/// A handle to a named shared memory arena.
///
/// Cloning is cheap (the mapping is shared within the process). The
/// mapping stays valid until the last clone drops, even after the name has
/// been unlinked — borrowed references into an outdated arena therefore
/// outlive its replacement safely.
#[derive(Clone, Debug)]
pub struct Arena {
    seg: Arc<Segment>,
}

impl Arena {
    /// Create the named arena, initializing its header.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        if size < alloc::align_up(std::mem::size_of::<ArenaHeader>(), ALLOC_ALIGN) + 64 {
            return Err(Error::ArenaUnavailable {
                name: name.into(),
                reason: format!("initial size {size} cannot hold the arena header"),
            });
        }
        let seg = Segment::create(name, size).map_err(|e| map_errno(name, e))?;
        // SAFETY: we created the object; no other process treats it as
        // initialized until the magic is published below.
        unsafe { ArenaHeader::init(seg.base() as *mut ArenaHeader, size as u64) };
        debug!(name, size, "created arena");
        Ok(Self { seg: Arc::new(seg) })
    }

    /// Open an existing named arena, waiting for its creator if needed.
    pub fn open(name: &str) -> Result<Self> {
        let seg = Segment::open(name).map_err(|e| map_errno(name, e))?;
        let arena = Self { seg: Arc::new(seg) };
        let mut spins = 0usize;
        while !arena.header().is_ready() {
            spins += 1;
            if spins > INIT_SPIN_LIMIT {
                return Err(Error::ArenaUnavailable {
                    name: name.into(),
                    reason: "creator never finished initializing".into(),
                });
            }
            // The creator may be descheduled mid-init; give it the CPU.
            std::thread::yield_now();
        }
        arena
            .header()
            .validate(arena.seg.len())
            .map_err(|reason| Error::ArenaUnavailable {
                name: name.into(),
                reason,
            })?;
        debug!(name, size = arena.size(), "opened arena");
        Ok(arena)
    }

    /// Open the named arena, creating it with `size` bytes if absent.
    ///
    /// Returns the arena and whether this call created it. Open-first, so
    /// a lost creation race degrades into a plain open.
    pub fn open_or_create(name: &str, size: usize) -> Result<(Self, bool)> {
        loop {
            match Self::open(name) {
                Ok(arena) => return Ok((arena, false)),
                Err(Error::System(e)) if e == Errno::NOENT => {}
                Err(e) => return Err(e),
            }
            match Self::create(name, size) {
                Ok(arena) => return Ok((arena, true)),
                // Someone else created it between our open and create.
                Err(Error::System(e)) if e == Errno::EXIST => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove the arena name from the OS namespace.
    pub fn unlink(name: &str) -> Result<()> {
        Segment::unlink(name).map_err(Error::System)?;
        debug!(name, "unlinked arena");
        Ok(())
    }

    /// Total size of the arena in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.header().size() as usize
    }

    /// Allocate `size` bytes of arena storage, 16-aligned.
    ///
    /// Fails with [`Error::OutOfArena`] when neither the free list nor the
    /// bump region can satisfy the request.
    pub fn alloc(&self, size: usize) -> Result<u64> {
        // SAFETY: base is this arena's own mapping.
        let off = unsafe { self.header().alloc(self.seg.base(), size)? };
        trace!(off, size, "arena alloc");
        Ok(off)
    }

    /// Return previously allocated storage to the arena.
    ///
    /// # Safety
    ///
    /// `off` must come from [`Arena::alloc`] on this arena (any mapping of
    /// it) and must not be freed twice or used afterwards.
    pub unsafe fn free(&self, off: u64) {
        // SAFETY: forwarded caller contract.
        unsafe { self.header().free(self.seg.base(), off) };
    }

    /// Resolve an offset to a pointer inside this mapping.
    ///
    /// The returned pointer is only as valid as the offset is: callers
    /// dereference it under the crate's internal ownership rules.
    #[inline]
    pub(crate) fn at(&self, off: u64) -> *mut u8 {
        debug_assert!((off as usize) < self.seg.len());
        // Pointer arithmetic stays inside the mapping per the assert above.
        unsafe { self.seg.base().add(off as usize) }
    }

    /// Look up a ready named object.
    pub fn find_named(&self, name: &str) -> Option<u64> {
        self.header().named_find(name.as_bytes())
    }

    /// Find the named object, constructing it with `init` if absent.
    ///
    /// Idempotent across processes: exactly one caller runs `init` (outside
    /// the arena lock), everyone else waits for the published offset.
    /// Returns the offset and whether this call constructed the object.
    pub fn find_or_construct(
        &self,
        name: &str,
        init: impl FnOnce() -> Result<u64>,
    ) -> Result<(u64, bool)> {
        let key = name.as_bytes();
        let mut spins = 0usize;
        loop {
            match self.header().named_lookup_or_reserve(key)? {
                NamedLookup::Ready(off) => return Ok((off, false)),
                NamedLookup::Reserved => {
                    spins += 1;
                    if spins > INIT_SPIN_LIMIT {
                        return Err(Error::ArenaUnavailable {
                            name: name.into(),
                            reason: "named object construction never completed".into(),
                        });
                    }
                    // Construction may include a whole-tree copy; yield
                    // rather than burn the constructor's CPU.
                    std::thread::yield_now();
                }
                NamedLookup::Claimed => break,
            }
        }
        match init() {
            Ok(off) => {
                self.header().named_publish(key, off);
                Ok((off, true))
            }
            Err(e) => {
                self.header().named_clear(key);
                Err(e)
            }
        }
    }

    /// Whether two handles view the same mapping.
    #[inline]
    pub(crate) fn same_mapping(&self, other: &Arena) -> bool {
        std::ptr::eq(self.seg.base(), other.seg.base())
    }

    fn header(&self) -> &ArenaHeader {
        // SAFETY: offset 0 of every arena holds an initialized header; for
        // freshly opened segments is_ready() gates all other access.
        unsafe { &*(self.seg.base() as *const ArenaHeader) }
    }
}

fn map_errno(name: &str, e: Errno) -> Error {
    if e == Errno::NOENT || e == Errno::EXIST {
        Error::System(e)
    } else {
        Error::ArenaUnavailable {
            name: name.into(),
            reason: e.to_string(),
        }
    }
}
