//! Mirror wire — location-transparent shared objects over peer links.
//!
//! A process registers object types with an [`ObjectRouter`] and checks out
//! instances by `type:id`. Each instance lives once per process; methods the
//! local side does not run are forwarded to a connected peer, and events can
//! be mirrored to every peer holding the object.
//!
//! ## Architecture
//!
//! - **EventHub**: synchronous publish/subscribe used by every layer
//! - **Transport**: TCP or in-process duplex carrying JSON envelopes
//! - **PeerSession**: one connection, gated by a credential handshake
//! - **PeerRegistry**: the live sessions and their connect/close events
//! - **ObjectRouter**: canonical instances, proxy handles, call routing,
//!   reply correlation and distributed release
//! - **PeerNode**: TCP listener feeding the registry

pub mod error;
pub mod events;
pub mod message;
pub mod node;
pub mod object;
pub mod registry;
pub mod router;
pub mod session;
pub mod transport;

pub use error::{RouterError, RouterResult, WireError};
pub use events::{EventHub, ListenerId, Subscription};
pub use message::Envelope;
pub use node::{connect, PeerNode};
pub use object::{ObjectEvents, ObjectHandle, SharedObject};
pub use registry::{PeerRegistry, PEER_CLOSE, PEER_CONNECT};
pub use router::{ObjectRouter, RouterConfig};
pub use session::{CredentialValidator, DenyAll, PeerSession, SharedSecret};
pub use transport::{FrameSource, Transport};
