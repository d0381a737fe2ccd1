//! Arena-backed storage primitives and the node payload contract.

use crate::error::Result;
use crate::shm::Arena;

/// A byte string whose storage lives inside an arena.
///
/// The struct itself is stored inline in arena-resident structures; the
/// bytes it refers to are a separate allocation addressed by offset, so the
/// whole thing is position-independent across process mappings. An empty
/// string owns no allocation.
#[repr(C)]
pub struct ShmBytes {
    off: u64,
    len: u32,
    cap: u32,
}

impl ShmBytes {
    /// An empty byte string (no arena storage).
    pub const fn empty() -> Self {
        Self {
            off: 0,
            len: 0,
            cap: 0,
        }
    }

    /// Copy `bytes` into freshly allocated arena storage.
    pub fn from_slice(bytes: &[u8], arena: &Arena) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::empty());
        }
        let off = arena.alloc(bytes.len())?;
        // SAFETY: off points at a fresh allocation of bytes.len() bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), arena.at(off), bytes.len());
        }
        Ok(Self {
            off,
            len: bytes.len() as u32,
            cap: bytes.len() as u32,
        })
    }

    /// View the bytes through the given arena mapping.
    pub fn as_slice<'a>(&self, arena: &'a Arena) -> &'a [u8] {
        if self.len == 0 {
            &[]
        } else {
            // SAFETY: off/len describe a live allocation in this arena.
            unsafe { std::slice::from_raw_parts(arena.at(self.off), self.len as usize) }
        }
    }

    /// Replace the contents, reusing the existing allocation when it fits.
    ///
    /// Allocates before freeing, so the old contents survive an
    /// out-of-arena failure.
    pub fn assign(&mut self, bytes: &[u8], arena: &Arena) -> Result<()> {
        if bytes.len() <= self.cap as usize {
            if !bytes.is_empty() {
                // SAFETY: capacity check above keeps the copy in bounds.
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), arena.at(self.off), bytes.len());
                }
            }
            self.len = bytes.len() as u32;
            return Ok(());
        }
        let fresh = Self::from_slice(bytes, arena)?;
        self.free(arena);
        *self = fresh;
        Ok(())
    }

    /// Release the backing storage and reset to empty.
    pub fn free(&mut self, arena: &Arena) {
        if self.off != 0 {
            // SAFETY: off came from from_slice()'s allocation on this arena
            // and is dropped exactly once here.
            unsafe { arena.free(self.off) };
        }
        *self = Self::empty();
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the string is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Contract for node payloads stored in the tree.
///
/// Payloads live inline in arena-resident nodes, so a payload that owns
/// variable-sized data must keep it in the arena too (see [`ShmString`]).
/// The four operations are exactly what the tree needs: construction from a
/// caller-side source, empty construction for implicit directories,
/// cross-arena assignment for migration, and teardown.
pub trait TreeData: Sized {
    /// Borrowed source value payloads are constructed from.
    type Source: ?Sized;

    /// Build a payload from `source` with storage in `arena`.
    fn construct(source: &Self::Source, arena: &Arena) -> Result<Self>;

    /// Build the empty payload used by implicitly created directories.
    fn empty(arena: &Arena) -> Result<Self>;

    /// Overwrite `self` (stored in `arena`) from `source` (stored in
    /// `source_arena`). The two arenas differ during migration.
    fn assign(&mut self, source: &Self, arena: &Arena, source_arena: &Arena) -> Result<()>;

    /// Release any arena storage owned by the payload.
    fn destroy(&mut self, arena: &Arena);
}

/// A UTF-8 string payload backed by arena storage.
///
/// The common payload in a VFS overlay: the real on-disk location a virtual
/// path maps to.
#[repr(C)]
pub struct ShmString(ShmBytes);

impl ShmString {
    /// View the string through the given arena mapping.
    ///
    /// Returns an empty string if the stored bytes are not valid UTF-8
    /// (they always are when written through [`TreeData::construct`]).
    pub fn as_str<'a>(&self, arena: &'a Arena) -> &'a str {
        std::str::from_utf8(self.0.as_slice(arena)).unwrap_or("")
    }

    /// Raw bytes of the string.
    pub fn as_bytes<'a>(&self, arena: &'a Arena) -> &'a [u8] {
        self.0.as_slice(arena)
    }

    /// Whether the string is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TreeData for ShmString {
    type Source = str;

    fn construct(source: &str, arena: &Arena) -> Result<Self> {
        Ok(Self(ShmBytes::from_slice(source.as_bytes(), arena)?))
    }

    fn empty(_arena: &Arena) -> Result<Self> {
        Ok(Self(ShmBytes::empty()))
    }

    fn assign(&mut self, source: &Self, arena: &Arena, source_arena: &Arena) -> Result<()> {
        self.0.assign(source.0.as_slice(source_arena), arena)
    }

    fn destroy(&mut self, arena: &Arena) {
        self.0.free(arena);
    }
}

/// Structure-only trees: no payload at all.
impl TreeData for () {
    type Source = ();

    fn construct(_source: &(), _arena: &Arena) -> Result<Self> {
        Ok(())
    }

    fn empty(_arena: &Arena) -> Result<Self> {
        Ok(())
    }

    fn assign(&mut self, _source: &Self, _arena: &Arena, _source_arena: &Arena) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self, _arena: &Arena) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_arena(tag: &str) -> (Arena, String) {
        static N: AtomicU32 = AtomicU32::new(0);
        let name = format!(
            "canopy-data-{}-{}-{}",
            std::process::id(),
            tag,
            N.fetch_add(1, Ordering::Relaxed)
        );
        let (arena, _) = Arena::open_or_create(&name, 65536).unwrap();
        (arena, name)
    }

    #[test]
    fn test_shm_bytes_round_trip() {
        let (arena, name) = test_arena("bytes");
        let s = ShmBytes::from_slice(b"hello world", &arena).unwrap();
        assert_eq!(s.as_slice(&arena), b"hello world");
        assert_eq!(s.len(), 11);
        let _ = Arena::unlink(&name);
    }

    #[test]
    fn test_shm_bytes_assign_reuses_capacity() {
        let (arena, name) = test_arena("assign");
        let mut s = ShmBytes::from_slice(b"longer contents", &arena).unwrap();
        s.assign(b"short", &arena).unwrap();
        assert_eq!(s.as_slice(&arena), b"short");
        s.assign(b"a considerably longer replacement", &arena)
            .unwrap();
        assert_eq!(s.as_slice(&arena), b"a considerably longer replacement");
        s.free(&arena);
        assert!(s.is_empty());
        let _ = Arena::unlink(&name);
    }

    #[test]
    fn test_shm_string_payload_ops() {
        let (arena, name) = test_arena("string");
        let mut a = ShmString::construct("C:/real/location", &arena).unwrap();
        assert_eq!(a.as_str(&arena), "C:/real/location");

        let b = ShmString::construct("elsewhere", &arena).unwrap();
        a.assign(&b, &arena, &arena).unwrap();
        assert_eq!(a.as_str(&arena), "elsewhere");

        let empty = ShmString::empty(&arena).unwrap();
        assert!(empty.is_empty());
        a.destroy(&arena);
        let _ = Arena::unlink(&name);
    }
}
