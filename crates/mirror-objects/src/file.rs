//! `file` — a text file with an unsaved-edit buffer, hosted by the server.
//!
//! Every content change is emitted as a `"change"` event carrying the
//! current text. The event is mirrored, so every peer holding the file sees
//! edits made through any other peer.

use crate::root::VirtualRoot;

use async_trait::async_trait;
use mirror_types::error::{MirrorError, MirrorResult};
use mirror_types::object::{Override, Side};
use mirror_wire::{ObjectEvents, ObjectRouter, SharedObject};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Object type tag.
pub const FILE_TYPE: &str = "file";
/// Event emitted with the new content.
pub const CHANGE_EVENT: &str = "change";

pub struct File {
    id: String,
    root: VirtualRoot,
    events: ObjectEvents,
    /// Unsaved edits.
    buffer: Mutex<Option<String>>,
}

impl File {
    pub fn new(id: impl Into<String>, root: VirtualRoot, events: ObjectEvents) -> Self {
        Self {
            id: id.into(),
            root,
            events,
            buffer: Mutex::new(None),
        }
    }

    fn buffered(&self) -> Option<String> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_buffer(&self, content: Option<String>) {
        *self.buffer.lock().unwrap_or_else(|e| e.into_inner()) = content;
    }

    /// The unsaved buffer if there is one, else the content on disk.
    pub async fn content(&self) -> MirrorResult<String> {
        if let Some(buffered) = self.buffered() {
            return Ok(buffered);
        }
        let path = self.root.resolve(&self.id)?;
        Ok(tokio::fs::read_to_string(path).await?)
    }

    /// Replace the buffer without touching the disk.
    pub fn set_content(&self, content: String) {
        debug!(id = %self.id, bytes = content.len(), "Buffered edit");
        self.set_buffer(Some(content.clone()));
        self.events.emit(CHANGE_EVENT, vec![json!(content)]);
    }

    /// Write the buffer to disk. A no-op without unsaved edits.
    pub async fn save(&self) -> MirrorResult<()> {
        let Some(content) = self.buffered() else {
            return Ok(());
        };
        let path = self.root.resolve(&self.id)?;
        tokio::fs::write(&path, &content).await?;
        self.set_buffer(None);
        info!(id = %self.id, "Saved file");
        self.events.emit(CHANGE_EVENT, vec![json!(content)]);
        Ok(())
    }

    /// Drop unsaved edits and read the file again.
    pub async fn reload(&self) -> MirrorResult<String> {
        self.set_buffer(None);
        let content = self.content().await?;
        self.events.emit(CHANGE_EVENT, vec![json!(content.clone())]);
        Ok(content)
    }
}

#[async_trait]
impl SharedObject for File {
    async fn call(&self, method: &str, params: Vec<Value>) -> MirrorResult<Value> {
        match method {
            "getContent" => Ok(json!(self.content().await?)),
            "setContent" => match params.into_iter().next() {
                Some(Value::String(content)) => {
                    self.set_content(content);
                    Ok(Value::Null)
                }
                _ => Err(MirrorError::InvalidParams(
                    "setContent expects a string".to_string(),
                )),
            },
            "save" => {
                self.save().await?;
                Ok(Value::Null)
            }
            "reload" => Ok(json!(self.reload().await?)),
            other => Err(MirrorError::UnknownMethod {
                object_type: FILE_TYPE.to_string(),
                method: other.to_string(),
            }),
        }
    }
}

/// Register `file` with `router`. All methods run on the server.
pub fn register(router: &ObjectRouter, root: VirtualRoot) {
    let mut overrides: Vec<Override> = ["getContent", "setContent", "save", "reload"]
        .into_iter()
        .map(|method| Override::method(method).on(Side::SERVER))
        .collect();
    overrides.push(Override::event(CHANGE_EVENT));

    router.register(
        FILE_TYPE,
        move |id, events| Arc::new(File::new(id, root.clone(), events)),
        overrides,
    );
}
