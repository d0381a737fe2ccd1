//! Named POSIX shared memory segments.
//!
//! A [`Segment`] is a named, fixed-size region created via `shm_open` and
//! mapped with `mmap(MAP_SHARED)`. The name is OS-global: any cooperating
//! process that opens the same name maps the same physical pages, almost
//! certainly at a different virtual address, which is why everything stored
//! inside an arena is offset-relative.

use rustix::fs::Mode;
use rustix::io::Errno;
use rustix::mm::{MapFlags, ProtFlags};
use rustix::shm;
use std::ptr::NonNull;

/// How often to re-stat a freshly created object whose creator has not yet
/// grown it to its final size.
const ZERO_SIZE_RETRIES: usize = 10_000;

/// A named shared memory object mapped into this process.
///
/// Dropping a `Segment` unmaps it; the underlying object lives on until it
/// is unlinked by name *and* the last mapping anywhere goes away. That is
/// exactly what keeps borrowed node references valid while a container
/// migrates away from their arena.
#[derive(Debug)]
pub struct Segment {
    base: NonNull<u8>,
    len: usize,
}

impl Segment {
    /// The OS-level name for a logical arena name.
    ///
    /// POSIX wants a single leading slash and no others; logical names
    /// (`svc_1`) never contain slashes.
    pub(crate) fn os_name(name: &str) -> String {
        format!("/{name}")
    }

    /// Create the named object with `O_CREAT | O_EXCL`, size it, map it.
    ///
    /// Fails with `EEXIST` when another process won the creation race.
    pub(crate) fn create(name: &str, size: usize) -> rustix::io::Result<Self> {
        if size == 0 {
            return Err(Errno::INVAL);
        }
        let os_name = Self::os_name(name);
        let fd = shm::open(
            os_name.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )?;
        if let Err(e) = rustix::fs::ftruncate(&fd, size as u64) {
            // Don't leave a zero-sized husk behind under the name.
            let _ = shm::unlink(os_name.as_str());
            return Err(e);
        }
        // SAFETY: mapping a freshly sized fd at a kernel-chosen address.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };
        let base = NonNull::new(ptr.cast::<u8>()).ok_or(Errno::NOMEM)?;
        Ok(Self { base, len: size })
    }

    /// Open and map an existing named object.
    ///
    /// A concurrent creator may have `shm_open`ed the name but not yet
    /// `ftruncate`d it; a zero-sized object is re-checked a bounded number
    /// of times before giving up with `EAGAIN`.
    pub(crate) fn open(name: &str) -> rustix::io::Result<Self> {
        let os_name = Self::os_name(name);
        let fd = shm::open(os_name.as_str(), shm::OFlags::RDWR, Mode::empty())?;
        let mut size = 0usize;
        for _ in 0..ZERO_SIZE_RETRIES {
            size = rustix::fs::fstat(&fd)?.st_size as usize;
            if size > 0 {
                break;
            }
            std::thread::yield_now();
        }
        if size == 0 {
            return Err(Errno::AGAIN);
        }
        // SAFETY: mapping an object whose size we just read; the creator
        // never shrinks it.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };
        let base = NonNull::new(ptr.cast::<u8>()).ok_or(Errno::NOMEM)?;
        Ok(Self { base, len: size })
    }

    /// Remove the name from the OS namespace.
    ///
    /// Existing mappings stay valid; the memory is reclaimed once the last
    /// one is unmapped.
    pub(crate) fn unlink(name: &str) -> rustix::io::Result<()> {
        shm::unlink(Segment::os_name(name).as_str())
    }

    /// Base address of the mapping in this process.
    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Mapped length in bytes.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: base/len describe exactly the mapping created in
        // create()/open(); nothing else unmaps it.
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: Segment is Send + Sync because the mapping is plain shared memory
// valid for the life of the value; all mutation done through it is governed
// by the atomics and locks stored inside the arena itself.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}
