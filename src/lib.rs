//! # Canopy
//!
//! A shared-memory directory tree for userspace virtual filesystem
//! overlays.
//!
//! Multiple cooperating processes — an injector and the processes it
//! hooks — attach to a named shared-memory arena and resolve virtualized
//! paths against one case-insensitive directory tree. Each node maps a
//! path component to arbitrary payload data (typically the real on-disk
//! location a virtual path redirects to).
//!
//! ## Features
//!
//! - **Cross-process by construction**: every reference inside an arena is
//!   a base-relative offset, so mappings at different addresses agree on
//!   the whole tree.
//! - **Self-relocating**: when an insertion exhausts the arena, the
//!   container migrates the tree into a doubled successor arena and other
//!   processes rebind transparently.
//! - **Reference counted**: arenas are unlinked when the last container
//!   detaches; nodes survive as long as any handle holds them.
//! - **Case-insensitive lookup** with component-wise glob search.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use canopy::prelude::*;
//!
//! let mut tree = TreeContainer::<ShmString>::new("overlay", 64 * 1024)?;
//! tree.add_file("mods/textures/rock.dds", "D:/staging/rock.dds", 0, true)?;
//!
//! let node = tree.find_by_path("MODS/TEXTURES/ROCK.DDS")?.unwrap();
//! println!("{}", node.data().as_str(node.arena()));
//!
//! for hit in tree.find("mods/*.dds")? {
//!     println!("{}", hit.path());
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod path;
pub mod shm;
pub mod tree;
pub mod wildcard;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::shm::Arena;
    pub use crate::tree::{
        NodeRef, ShmString, TreeContainer, TreeData, TreeFlags, FLAG_DIRECTORY, FLAG_DUMMY,
        FLAG_FIRST_USER,
    };
}

pub use error::{Error, Result};
