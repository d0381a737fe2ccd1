//! The shared directory tree: nodes, payloads, and the container.
//!
//! See [`TreeContainer`] for the attach/mutate/migrate lifecycle and
//! [`NodeRef`] for everything you can do with a node.

mod container;
mod data;
mod node;

pub use container::{TreeContainer, MIN_INITIAL_SIZE};
pub use data::{ShmBytes, ShmString, TreeData};
pub use node::{Children, NodeRef};

/// Flag bits attached to every node.
pub type TreeFlags = u8;

/// Marks an interior node; its absence denotes a leaf.
pub const FLAG_DIRECTORY: TreeFlags = 0x01;

/// Marks a directory created implicitly to carry descendants.
/// Always set together with [`FLAG_DIRECTORY`].
pub const FLAG_DUMMY: TreeFlags = 0x02;

/// First bit available for user-defined flags.
pub const FLAG_FIRST_USER: TreeFlags = 0x10;
