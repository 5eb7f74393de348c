//! A multicast DNS / DNS-SD service discovery engine (RFC 6762, RFC 6763).
//!
//! The crate is organized the way the protocol layers itself: [`wire`] decodes and
//! encodes packets, [`name`] is the DNS name type both of them share, [`cache`] and
//! [`model`] turn a stream of records into [`ServiceInstance`] values, [`scheduler`]
//! paces outgoing queries, and [`client`]/[`manager`]/[`socket`] compose those into a
//! running engine driven by a single `stakker` actor (see [`manager::EventLoop`]).

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod listener;
pub mod manager;
pub mod model;
pub mod name;
pub mod scheduler;
pub mod socket;
pub mod wire;

pub use config::{Config, FeatureToggles, QueryMode, SearchOptions};
pub use error::{ParseError, ParseErrorKind, StartError};
pub use listener::{same_listener, Listener, ListenerHandle};
pub use manager::{EventLoop, Handle};
pub use model::ServiceInstance;
pub use name::Name;
pub use socket::{InterfaceEvent, InterfaceFlags, InterfaceInfo, NetHandle, SocketKey, Transports};

/// Start the engine: spins up the `stakker`-driven discovery manager on the calling
/// thread and returns a cheap, cloneable [`Handle`] for every other thread to reach it
/// through. Callers typically move the returned `EventLoop` onto its own thread and call
/// [`EventLoop::run`] there.
pub fn start(cfg: Config) -> Result<(EventLoop, Handle), StartError> {
	let event_loop = EventLoop::new(cfg)?;
	let handle = event_loop.handle();
	Ok((event_loop, handle))
}
