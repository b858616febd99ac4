//! Shared objects exposing a directory tree to peers.
//!
//! - `dir`: directory listings
//! - `file`: buffered text files with mirrored change events
//!
//! Both resolve their ids through a [`VirtualRoot`] and execute on the
//! server side.

pub mod dir;
pub mod file;
pub mod root;

pub use dir::{Dir, DirEntry, DIR_TYPE};
pub use file::{File, CHANGE_EVENT, FILE_TYPE};
pub use root::VirtualRoot;

use mirror_wire::ObjectRouter;

/// Register every object type of this crate with `router`.
pub fn register_all(router: &ObjectRouter, root: VirtualRoot) {
    dir::register(router, root.clone());
    file::register(router, root);
}
