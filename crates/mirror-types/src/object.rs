//! Object identity and routing declarations.
//!
//! A shared object is identified by an [`ObjectKey`] (`type:id`). When a type
//! is registered with the router it carries a list of [`Override`]s that say
//! which methods must run on another [`Side`] and which events are mirrored
//! to peers.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;

/// Event name matching every event emitted by an object.
pub const WILDCARD_EVENT: &str = "*";

/// Composite identity of one logical shared object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// The object type tag, e.g. `"file"`.
    pub object_type: String,
    /// The instance id within the type, e.g. a path.
    pub id: String,
}

impl ObjectKey {
    /// Build a key from a type tag and an instance id.
    pub fn new(object_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.id)
    }
}

/// The logical role a process plays (e.g. `server` or `client`).
///
/// Overridden methods execute on the sides they declare; every other side
/// forwards the call to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Side(Cow<'static, str>);

impl Side {
    /// The process hosting the real resources.
    pub const SERVER: Side = Side(Cow::Borrowed("server"));
    /// A process consuming resources hosted elsewhere.
    pub const CLIENT: Side = Side(Cow::Borrowed("client"));

    /// A custom side label.
    pub fn new(label: impl Into<String>) -> Self {
        Self(Cow::Owned(label.into()))
    }

    /// The label as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Routing policy for an overridden method or event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallProfile {
    /// Execute on exactly one peer and wait for its reply.
    #[default]
    #[serde(alias = "best match")]
    BestMatch,
    /// Fire-and-forget execution on one peer.
    Broadcast,
    /// Execute locally and, as a side effect, on one peer; events are
    /// mirrored to every peer holding the object.
    Sync,
}

impl fmt::Display for CallProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallProfile::BestMatch => write!(f, "best_match"),
            CallProfile::Broadcast => write!(f, "broadcast"),
            CallProfile::Sync => write!(f, "sync"),
        }
    }
}

/// What an override applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideTarget {
    /// A method, by name.
    Method(String),
    /// An event, by name, or [`WILDCARD_EVENT`].
    Event(String),
}

/// One routing declaration attached to an object type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Override {
    /// The method or event this declaration applies to.
    pub target: OverrideTarget,
    /// Sides on which the method executes locally.
    pub sides: BTreeSet<Side>,
    /// Routing policy.
    pub profile: CallProfile,
}

impl Override {
    /// Declare a method. Until [`Override::on`] is called it runs on no side,
    /// so every process forwards it.
    pub fn method(name: impl Into<String>) -> Self {
        Self {
            target: OverrideTarget::Method(name.into()),
            sides: BTreeSet::new(),
            profile: CallProfile::BestMatch,
        }
    }

    /// Declare an event (mirrored with the sync profile by default).
    pub fn event(name: impl Into<String>) -> Self {
        Self {
            target: OverrideTarget::Event(name.into()),
            sides: BTreeSet::new(),
            profile: CallProfile::Sync,
        }
    }

    /// Add a side on which the method executes locally.
    pub fn on(mut self, side: Side) -> Self {
        self.sides.insert(side);
        self
    }

    /// Set the routing profile.
    pub fn profile(mut self, profile: CallProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Whether a process playing `side` executes this method itself.
    pub fn runs_on(&self, side: &Side) -> bool {
        self.sides.contains(side)
    }

    /// Whether this is a sync event declaration covering `event`.
    pub fn mirrors_event(&self, event: &str) -> bool {
        match &self.target {
            OverrideTarget::Event(name) => {
                self.profile == CallProfile::Sync && (name == WILDCARD_EVENT || name == event)
            }
            OverrideTarget::Method(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        let key = ObjectKey::new("file", "/src/main.rs");
        assert_eq!(key.to_string(), "file:/src/main.rs");
    }

    #[test]
    fn test_override_sides() {
        let o = Override::method("listFiles").on(Side::SERVER);
        assert!(o.runs_on(&Side::SERVER));
        assert!(!o.runs_on(&Side::CLIENT));
        assert_eq!(o.profile, CallProfile::BestMatch);
    }

    #[test]
    fn test_event_wildcard() {
        let all = Override::event(WILDCARD_EVENT);
        assert!(all.mirrors_event("change"));
        assert!(all.mirrors_event("output"));

        let one = Override::event("change");
        assert!(one.mirrors_event("change"));
        assert!(!one.mirrors_event("output"));

        let not_sync = Override::event("change").profile(CallProfile::Broadcast);
        assert!(!not_sync.mirrors_event("change"));
        assert!(!Override::method("change").mirrors_event("change"));
    }

    #[test]
    fn test_profile_serde() {
        let p: CallProfile = serde_json::from_str("\"best match\"").unwrap();
        assert_eq!(p, CallProfile::BestMatch);
        let p: CallProfile = serde_json::from_str("\"sync\"").unwrap();
        assert_eq!(p, CallProfile::Sync);
        assert_eq!(serde_json::to_string(&CallProfile::Broadcast).unwrap(), "\"broadcast\"");
    }

    #[test]
    fn test_side_serde() {
        let side: Side = serde_json::from_str("\"server\"").unwrap();
        assert_eq!(side, Side::SERVER);
        assert_eq!(Side::new("client"), Side::CLIENT);
    }
}
