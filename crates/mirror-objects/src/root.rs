//! Virtual path translation.
//!
//! Peers address files by virtual id (`/src/main.rs`), always relative to one
//! root directory on the hosting side.

use mirror_types::error::{MirrorError, MirrorResult};
use std::path::{Component, Path, PathBuf};

/// A directory exposed to peers as `/`.
#[derive(Debug, Clone)]
pub struct VirtualRoot {
    root: PathBuf,
}

impl VirtualRoot {
    /// Expose `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a virtual id to a path under the root.
    ///
    /// Any `..` component is rejected, even one that would stay inside.
    pub fn resolve(&self, id: &str) -> MirrorResult<PathBuf> {
        let mut resolved = self.root.clone();
        for component in Path::new(id).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(MirrorError::InvalidParams(format!("Access denied: {id}")));
                }
            }
        }
        Ok(resolved)
    }

    /// Map a path under the root back to its virtual id.
    pub fn to_id(&self, path: &Path) -> MirrorResult<String> {
        let relative = path.strip_prefix(&self.root).map_err(|_| {
            MirrorError::InvalidParams(format!("{} is outside the root", path.display()))
        })?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Ok(format!("/{}", parts.join("/")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_inside_root() {
        let root = VirtualRoot::new("/srv/data");
        assert_eq!(root.resolve("/").unwrap(), PathBuf::from("/srv/data"));
        assert_eq!(
            root.resolve("/a/./b.txt").unwrap(),
            PathBuf::from("/srv/data/a/b.txt")
        );
        assert_eq!(root.resolve("c").unwrap(), PathBuf::from("/srv/data/c"));
    }

    #[test]
    fn test_traversal_rejected() {
        let root = VirtualRoot::new("/srv/data");
        for id in ["/../etc/passwd", "a/../../b", "/a/.."] {
            assert!(
                matches!(root.resolve(id), Err(MirrorError::InvalidParams(_))),
                "{id} should be rejected"
            );
        }
    }

    #[test]
    fn test_to_id() {
        let root = VirtualRoot::new("/srv/data");
        assert_eq!(root.to_id(Path::new("/srv/data/a/b.txt")).unwrap(), "/a/b.txt");
        assert_eq!(root.to_id(Path::new("/srv/data")).unwrap(), "/");
        assert!(root.to_id(Path::new("/etc/passwd")).is_err());
    }
}
