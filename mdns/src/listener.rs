//! The listener capability (§6). Re-architected per Design Note "Listener interface
//! with many default methods -> a small capability record of function values (or a
//! trait with default no-op methods)": callers implement only the callbacks they care
//! about, and registration/removal identity is the `Arc` pointer, compared with
//! `Arc::ptr_eq` (the source's object-identity equality on listener references).

use std::sync::Arc;

use crate::error::ParseErrorKind;
use crate::model::ServiceInstance;
use crate::name::Name;
use crate::socket::SocketKey;

/// Registered-listener callbacks (§6's Listener API table). Every method has a no-op
/// default; a listener only overrides the events it wants.
pub trait Listener: Send + Sync {
	/// First time a [`ServiceInstance`] becomes complete for this listener.
	fn on_service_found(&self, _info: &ServiceInstance) {}
	/// Any field of a previously-found instance changes.
	fn on_service_updated(&self, _info: &ServiceInstance) {}
	/// Instance expires, receives a TTL-0 goodbye, or its socket is destroyed.
	fn on_service_removed(&self, _info: &ServiceInstance) {}
	/// First PTR seen for an instance, regardless of completeness (opt-in via search options).
	fn on_service_discovered(&self, _info: &ServiceInstance) {}
	fn on_discovery_started(&self, _service_type: &Name) {}
	fn on_discovery_stopped(&self, _service_type: &Name) {}
	fn on_failed_to_parse(&self, _packet_seq: u64, _code: ParseErrorKind) {}
	/// A socket became available for a network this listener requested (§5's ordering
	/// guarantee: precedes any response delivered via that socket).
	fn on_socket_created(&self, _socket: SocketKey) {}
	/// The socket backing a listener's search was torn down.
	fn on_interface_destroyed(&self, _socket: SocketKey) {}
}

pub type ListenerHandle = Arc<dyn Listener>;

/// Pointer-identity comparison for two listener handles, used wherever the engine needs
/// to find "the same listener reference" the caller registered (§4.5/§4.6 `stop_send_and_receive`/
/// `unregister_listener`).
pub fn same_listener(a: &ListenerHandle, b: &ListenerHandle) -> bool {
	Arc::ptr_eq(a, b)
}
