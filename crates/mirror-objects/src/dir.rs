//! `dir` — directory listings, executed on the server.

use crate::root::VirtualRoot;

use async_trait::async_trait;
use mirror_types::error::{MirrorError, MirrorResult};
use mirror_types::object::{Override, Side};
use mirror_wire::{ObjectRouter, SharedObject};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Object type tag.
pub const DIR_TYPE: &str = "dir";

/// One entry of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "isDirectory")]
    pub is_directory: bool,
    /// Virtual id of the entry.
    pub path: String,
}

/// A directory, identified by its virtual id.
pub struct Dir {
    id: String,
    root: VirtualRoot,
}

impl Dir {
    pub fn new(id: impl Into<String>, root: VirtualRoot) -> Self {
        Self {
            id: id.into(),
            root,
        }
    }

    /// List `location` (a virtual id), sorted by name.
    pub async fn list_files(&self, location: &str) -> MirrorResult<Vec<DirEntry>> {
        let path = self.root.resolve(location)?;
        let mut reader = tokio::fs::read_dir(&path).await?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_directory = entry.file_type().await?.is_dir();
            entries.push(DirEntry {
                path: self.root.to_id(&entry.path())?,
                name,
                is_directory,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(location, count = entries.len(), "Listed directory");
        Ok(entries)
    }
}

#[async_trait]
impl SharedObject for Dir {
    async fn call(&self, method: &str, params: Vec<Value>) -> MirrorResult<Value> {
        match method {
            "listFiles" => {
                let location = match params.first() {
                    None | Some(Value::Null) => self.id.clone(),
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => {
                        return Err(MirrorError::InvalidParams(format!(
                            "listFiles expects a path, got {other}"
                        )))
                    }
                };
                let entries = self.list_files(&location).await?;
                serde_json::to_value(entries).map_err(|e| MirrorError::Internal(e.to_string()))
            }
            other => Err(MirrorError::UnknownMethod {
                object_type: DIR_TYPE.to_string(),
                method: other.to_string(),
            }),
        }
    }
}

/// Register `dir` with `router`; listings run on the server.
pub fn register(router: &ObjectRouter, root: VirtualRoot) {
    router.register(
        DIR_TYPE,
        move |id, _events| Arc::new(Dir::new(id, root.clone())),
        vec![Override::method("listFiles").on(Side::SERVER)],
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("b.txt"), "b").unwrap();
        std::fs::write(tmp.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/lib.rs"), "").unwrap();
        tmp
    }

    #[tokio::test]
    async fn test_list_root_sorted() {
        let tmp = fixture();
        let dir = Dir::new("/", VirtualRoot::new(tmp.path()));
        let got = dir.call("listFiles", vec![json!("/")]).await.unwrap();
        assert_eq!(
            got,
            json!([
                { "name": "a.txt", "isDirectory": false, "path": "/a.txt" },
                { "name": "b.txt", "isDirectory": false, "path": "/b.txt" },
                { "name": "src", "isDirectory": true, "path": "/src" },
            ])
        );
    }

    #[tokio::test]
    async fn test_list_defaults_to_own_id() {
        let tmp = fixture();
        let dir = Dir::new("/src", VirtualRoot::new(tmp.path()));
        let got = dir.list_files("/src").await.unwrap();
        let via_call = dir.call("listFiles", vec![]).await.unwrap();
        assert_eq!(serde_json::to_value(&got).unwrap(), via_call);
        assert_eq!(got[0].path, "/src/lib.rs");
    }

    #[tokio::test]
    async fn test_entry_paths_are_normalized_ids() {
        let tmp = fixture();
        let dir = Dir::new("/", VirtualRoot::new(tmp.path()));
        let got = dir.list_files("src/./").await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].path, "/src/lib.rs");
    }

    #[tokio::test]
    async fn test_list_rejects_traversal_and_bad_params() {
        let tmp = fixture();
        let dir = Dir::new("/", VirtualRoot::new(tmp.path()));
        assert!(matches!(
            dir.call("listFiles", vec![json!("/../")]).await,
            Err(MirrorError::InvalidParams(_))
        ));
        assert!(matches!(
            dir.call("listFiles", vec![json!(3)]).await,
            Err(MirrorError::InvalidParams(_))
        ));
        assert!(matches!(
            dir.call("listFiles", vec![json!("/missing")]).await,
            Err(MirrorError::Io(_))
        ));
        assert!(matches!(
            dir.call("rmdir", vec![]).await,
            Err(MirrorError::UnknownMethod { .. })
        ));
    }
}
