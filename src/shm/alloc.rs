//! The arena header and its offset-based allocator.
//!
//! Every arena starts with an [`ArenaHeader`] at offset 0. The header is
//! initialized by the creating process, which publishes the magic word
//! last; openers spin until they see it. Behind the header sits one flat
//! heap managed by a first-fit free list plus a bump pointer, all under a
//! single cross-process spin lock.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ ArenaHeader                                              │
//! │   magic / version / size                                 │
//! │   ctrl: spin::Mutex<ArenaCtrl>                           │
//! │     free_head ── first free block, 0 = none              │
//! │     brk ─────── start of the never-allocated tail        │
//! │     named[] ─── tiny name → offset table ("Meta")        │
//! ├──────────────────────────────────────────────────────────┤
//! │ blocks: [size: u64][pad: u64][payload ...] repeated      │
//! │ free blocks reuse their payload for {size, next}         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Offsets handed out point at block payloads and are 16-byte aligned.
//! The free list does not coalesce: trees mostly grow, and exhaustion is
//! answered by migration to a doubled arena, which compacts everything.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// Magic word identifying an initialized canopy arena.
pub(super) const ARENA_MAGIC: u64 = 0x43414e_4f50_5901; // "CANOPY", v1 tag

/// Current arena format version.
pub(super) const ARENA_VERSION: u32 = 1;

/// Alignment of every allocation (covers u64s, atomics and payloads).
pub const ALLOC_ALIGN: usize = 16;

/// Per-block bookkeeping that precedes each payload.
const BLOCK_HEADER: usize = 16;

/// Don't split a free block if the leftover would be smaller than this.
const MIN_SPLIT: usize = BLOCK_HEADER + 16;

/// Capacity of the named-object table. Only "Meta" is used today.
const MAX_NAMED: usize = 4;

/// Longest name the table accepts.
const MAX_NAME_LEN: usize = 24;

const NAMED_EMPTY: u32 = 0;
const NAMED_RESERVED: u32 = 1;
const NAMED_READY: u32 = 2;

#[inline]
pub(super) const fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

/// One entry of the named-object table.
#[repr(C)]
#[derive(Clone, Copy)]
struct NamedSlot {
    name: [u8; MAX_NAME_LEN],
    name_len: u32,
    state: u32,
    offset: u64,
}

impl NamedSlot {
    const fn empty() -> Self {
        Self {
            name: [0; MAX_NAME_LEN],
            name_len: 0,
            state: NAMED_EMPTY,
            offset: 0,
        }
    }

    fn matches(&self, name: &[u8]) -> bool {
        self.state != NAMED_EMPTY && &self.name[..self.name_len as usize] == name
    }
}

/// Mutable arena state, guarded by the header's spin lock.
#[repr(C)]
pub(super) struct ArenaCtrl {
    free_head: u64,
    brk: u64,
    named: [NamedSlot; MAX_NAMED],
}

/// Free blocks reuse their payload bytes for the list link.
#[repr(C)]
struct FreeBlock {
    size: u64,
    next: u64,
}

/// Header at offset 0 of every arena.
///
/// All processes map this through the same compiled crate, so the field
/// layout (including the `spin::Mutex` internals) is identical in every
/// mapping.
#[repr(C)]
pub(super) struct ArenaHeader {
    magic: AtomicU64,
    version: u32,
    _pad: u32,
    size: u64,
    ctrl: spin::Mutex<ArenaCtrl>,
}

/// Outcome of one locked pass over the named table.
pub(super) enum NamedLookup {
    /// Object exists; here is its offset.
    Ready(u64),
    /// Another process reserved the name and is still constructing.
    Reserved,
    /// The caller now owns the reservation and must construct or clear it.
    Claimed,
}

impl ArenaHeader {
    /// Initialize a fresh header in zeroed memory and publish the magic.
    ///
    /// # Safety
    ///
    /// `ptr` must point at the base of a writable mapping of at least
    /// `size` bytes that no other process considers initialized yet.
    pub(super) unsafe fn init(ptr: *mut ArenaHeader, size: u64) {
        let heap_start = align_up(std::mem::size_of::<ArenaHeader>(), ALLOC_ALIGN) as u64;
        // SAFETY: caller guarantees exclusive access to uninitialized memory.
        unsafe {
            std::ptr::write(
                ptr,
                ArenaHeader {
                    magic: AtomicU64::new(0),
                    version: ARENA_VERSION,
                    _pad: 0,
                    size,
                    ctrl: spin::Mutex::new(ArenaCtrl {
                        free_head: 0,
                        brk: heap_start,
                        named: [NamedSlot::empty(); MAX_NAMED],
                    }),
                },
            );
            (*ptr).magic.store(ARENA_MAGIC, Ordering::Release);
        }
    }

    /// Whether the creator has finished initializing this header.
    pub(super) fn is_ready(&self) -> bool {
        self.magic.load(Ordering::Acquire) == ARENA_MAGIC
    }

    /// Validate magic and version after the ready flag is up.
    pub(super) fn validate(&self, mapped_len: usize) -> std::result::Result<(), String> {
        let magic = self.magic.load(Ordering::Acquire);
        if magic != ARENA_MAGIC {
            return Err(format!("bad magic {magic:#x}"));
        }
        if self.version != ARENA_VERSION {
            return Err(format!(
                "unsupported version {} (expected {})",
                self.version, ARENA_VERSION
            ));
        }
        if self.size as usize != mapped_len {
            return Err(format!(
                "size mismatch: header says {}, mapped {}",
                self.size, mapped_len
            ));
        }
        Ok(())
    }

    /// Total arena size recorded at creation.
    #[inline]
    pub(super) fn size(&self) -> u64 {
        self.size
    }

    /// Allocate `size` bytes, 16-aligned, from the free list or the bump
    /// region. Fails with [`Error::OutOfArena`], never a bogus offset.
    ///
    /// # Safety
    ///
    /// `base` must be the base of the mapping containing this header.
    pub(super) unsafe fn alloc(&self, base: *mut u8, size: usize) -> Result<u64> {
        debug_assert!(size > 0);
        let need = align_up(size, ALLOC_ALIGN) + BLOCK_HEADER;
        let mut ctrl = self.ctrl.lock();

        // First fit over the free list.
        let mut prev: u64 = 0;
        let mut cur = ctrl.free_head;
        while cur != 0 {
            // SAFETY: list offsets were produced by this allocator and stay
            // inside the mapping.
            let block = unsafe { &mut *(base.add(cur as usize) as *mut FreeBlock) };
            let bsize = block.size as usize;
            let next = block.next;
            if bsize >= need {
                let link = if bsize - need >= MIN_SPLIT {
                    let leftover = cur + need as u64;
                    // SAFETY: leftover stays inside the found block.
                    let lb = unsafe { &mut *(base.add(leftover as usize) as *mut FreeBlock) };
                    lb.size = (bsize - need) as u64;
                    lb.next = next;
                    leftover
                } else {
                    next
                };
                if prev == 0 {
                    ctrl.free_head = link;
                } else {
                    // SAFETY: prev is a live free block.
                    unsafe { (*(base.add(prev as usize) as *mut FreeBlock)).next = link };
                }
                let used = if bsize - need >= MIN_SPLIT { need } else { bsize };
                // SAFETY: writing the block header of the block just claimed.
                unsafe { *(base.add(cur as usize) as *mut u64) = used as u64 };
                return Ok(cur + BLOCK_HEADER as u64);
            }
            prev = cur;
            cur = next;
        }

        // Bump the never-allocated tail.
        let start = ctrl.brk;
        let end = start.checked_add(need as u64).ok_or(Error::OutOfArena)?;
        if end > self.size {
            return Err(Error::OutOfArena);
        }
        ctrl.brk = end;
        // SAFETY: start..end is inside the mapping and owned by us now.
        unsafe { *(base.add(start as usize) as *mut u64) = need as u64 };
        Ok(start + BLOCK_HEADER as u64)
    }

    /// Return a block to the free list.
    ///
    /// # Safety
    ///
    /// `off` must have been returned by [`ArenaHeader::alloc`] on the same
    /// arena and not freed since.
    pub(super) unsafe fn free(&self, base: *mut u8, off: u64) {
        debug_assert!(off as usize >= BLOCK_HEADER);
        let start = off - BLOCK_HEADER as u64;
        let mut ctrl = self.ctrl.lock();
        // SAFETY: the block header was written at allocation time.
        unsafe {
            let size = *(base.add(start as usize) as *const u64);
            let block = &mut *(base.add(start as usize) as *mut FreeBlock);
            block.size = size;
            block.next = ctrl.free_head;
        }
        ctrl.free_head = start;
    }

    /// One locked pass of find-or-reserve over the named table.
    pub(super) fn named_lookup_or_reserve(&self, name: &[u8]) -> Result<NamedLookup> {
        if name.len() > MAX_NAME_LEN {
            return Err(Error::ArenaUnavailable {
                name: String::from_utf8_lossy(name).into_owned(),
                reason: "object name too long".into(),
            });
        }
        let mut ctrl = self.ctrl.lock();
        for slot in ctrl.named.iter() {
            if slot.matches(name) {
                return Ok(match slot.state {
                    NAMED_READY => NamedLookup::Ready(slot.offset),
                    _ => NamedLookup::Reserved,
                });
            }
        }
        for slot in ctrl.named.iter_mut() {
            if slot.state == NAMED_EMPTY {
                slot.name[..name.len()].copy_from_slice(name);
                slot.name_len = name.len() as u32;
                slot.state = NAMED_RESERVED;
                slot.offset = 0;
                return Ok(NamedLookup::Claimed);
            }
        }
        Err(Error::ArenaUnavailable {
            name: String::from_utf8_lossy(name).into_owned(),
            reason: "named object table full".into(),
        })
    }

    /// Publish a previously reserved name.
    pub(super) fn named_publish(&self, name: &[u8], offset: u64) {
        let mut ctrl = self.ctrl.lock();
        for slot in ctrl.named.iter_mut() {
            if slot.matches(name) {
                debug_assert_eq!(slot.state, NAMED_RESERVED);
                slot.offset = offset;
                slot.state = NAMED_READY;
                return;
            }
        }
        debug_assert!(false, "published a name that was never reserved");
    }

    /// Drop a reservation whose construction failed.
    pub(super) fn named_clear(&self, name: &[u8]) {
        let mut ctrl = self.ctrl.lock();
        for slot in ctrl.named.iter_mut() {
            if slot.matches(name) {
                *slot = NamedSlot::empty();
                return;
            }
        }
    }

    /// Offset of a ready named object, if any.
    pub(super) fn named_find(&self, name: &[u8]) -> Option<u64> {
        let ctrl = self.ctrl.lock();
        ctrl.named
            .iter()
            .find(|s| s.matches(name) && s.state == NAMED_READY)
            .map(|s| s.offset)
    }
}
