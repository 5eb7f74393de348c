//! The discovery manager (C6): the single `stakker` actor that owns every open socket
//! and every per-(socket, service-type) client, and the cross-thread door into it.
//!
//! Socket receive threads and host interface-change notifications run on their own
//! threads (§5); rather than lean on stakker's own cross-thread actor machinery (never
//! exercised cross-thread anywhere in this pack under `default-features = false`), they
//! post an [`Event`] through a plain `mpsc::Sender` and nudge a `wake` channel, the same
//! contract `runtime::rt::exec` already uses to interrupt its blocking wait.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use stakker::{Actor, ActorOwn, Stakker, CX};

use crate::cache::Millis;
use crate::config::{Config, SearchOptions};
use crate::client::ServiceTypeClient;
use crate::error::{ParseError, StartError};
use crate::listener::{same_listener, ListenerHandle};
use crate::name::Name;
use crate::scheduler::NextQuery;
use crate::socket::{self, Inbound, InterfaceEvent, InterfaceInfo, SocketInfo, SocketKey, Transports};
use crate::wire;

/// What crosses the thread boundary into the manager actor (§5).
pub enum Event {
	RegisterListener { service_type: Name, listener: ListenerHandle, options: SearchOptions },
	UnregisterListener { service_type: Name, listener: ListenerHandle },
	Inbound(Inbound),
	Interface(InterfaceEvent),
	/// A diagnostic query (§10's supplemented parse-failure counters); answered by
	/// invoking the callback from the loop thread rather than blocking the caller.
	ParseFailureCount { socket: SocketKey, callback: Box<dyn FnOnce(u64) + Send> },
	Shutdown,
}

/// A cheap, `Send + Sync`, cloneable handle onto a running engine (§6's public entry
/// points): the only way callers outside the event loop reach the manager.
#[derive(Clone)]
pub struct Handle {
	events: Sender<Event>,
	wake: Sender<()>,
}

impl Handle {
	fn post(&self, event: Event) {
		if self.events.send(event).is_ok() {
			let _ = self.wake.send(());
		}
	}

	/// Begin (or join) discovery of `service_type` on behalf of `listener` (§4.5
	/// `start_send_and_receive`).
	pub fn start_discovery(&self, service_type: Name, listener: ListenerHandle, options: SearchOptions) {
		self.post(Event::RegisterListener { service_type, listener, options });
	}

	/// Stop `listener`'s interest in `service_type` (§4.6 `stop_send_and_receive`).
	pub fn stop_discovery(&self, service_type: Name, listener: ListenerHandle) {
		self.post(Event::UnregisterListener { service_type, listener });
	}

	/// Feed in a host network/interface lifecycle notification (§4.7).
	pub fn notify_interface_event(&self, event: InterfaceEvent) {
		self.post(Event::Interface(event));
	}

	/// Look up how many inbound datagrams on `socket` have failed to parse (§4.6's
	/// `on_parse_failure` forwarding, §10's counters). Answered asynchronously since the
	/// counter only exists on the loop thread.
	pub fn parse_failure_count(&self, socket: SocketKey, callback: impl FnOnce(u64) + Send + 'static) {
		self.post(Event::ParseFailureCount { socket, callback: Box::new(callback) });
	}

	pub fn shutdown(&self) {
		self.post(Event::Shutdown);
	}
}

/// Identity of one service-type client: a service type tracked on a particular socket
/// (§4.3's `CacheKey`, extended with the socket it arrived on since sockets are
/// per-interface).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
	socket: SocketKey,
	service_type: String,
}

struct Interface {
	info: InterfaceInfo,
	socket: Option<SocketInfo>,
}

pub struct Manager {
	cfg: Config,
	interfaces: HashMap<u32, Interface>,
	clients: HashMap<ClientKey, ServiceTypeClient>,
	/// Pending searches not yet backed by an open socket (e.g. a specific network or
	/// interface the caller asked for hasn't appeared yet).
	wanted: Vec<(Name, ListenerHandle, SearchOptions)>,
	parse_failures: HashMap<SocketKey, u64>,
	packet_seq: u64,
	self_actor: Option<Actor<Manager>>,
	/// A clone of the same cross-thread handle callers use, so sockets opened here can
	/// route inbound datagrams back through the one `Event` channel rather than touching
	/// the actor directly from a receiver thread.
	self_handle: Handle,
}

impl Manager {
	pub fn init(cx: CX![], cfg: Config, self_handle: Handle) -> Option<Self> {
		let self_actor = cx.access_actor().clone();

		Some(Manager {
			cfg,
			interfaces: HashMap::new(),
			clients: HashMap::new(),
			wanted: Vec::new(),
			parse_failures: HashMap::new(),
			packet_seq: 0,
			self_actor: Some(self_actor),
			self_handle,
		})
	}

	fn actor(&self) -> Actor<Manager> {
		self.self_actor.clone().expect("manager actor handle initialized in init()")
	}

	fn handle_event(&mut self, cx: CX![], event: Event) {
		match event {
			Event::RegisterListener { service_type, listener, options } => self.register_listener(cx, service_type, listener, options),
			Event::UnregisterListener { service_type, listener } => self.unregister_listener(cx, service_type, listener),
			Event::Inbound(inbound) => self.handle_inbound(cx, inbound),
			Event::Interface(event) => self.handle_interface_event(cx, event),
			Event::ParseFailureCount { socket, callback } => callback(*self.parse_failures.get(&socket).unwrap_or(&0)),
			Event::Shutdown => {}
		}
	}

	// ----------------------------------------------------------------------------
	// Listener lifecycle (§4.5, §4.6)
	// ----------------------------------------------------------------------------

	fn matching_sockets(&self, options: &SearchOptions) -> Vec<SocketKey> {
		self.interfaces
			.values()
			.filter_map(|iface| iface.socket.as_ref())
			.map(|s| s.key)
			.filter(|key| options.network.is_none() || key.network == options.network)
			.filter(|key| options.interface_index.is_none() || Some(key.interface_index) == options.interface_index)
			.collect()
	}

	fn register_listener(&mut self, cx: CX![], service_type: Name, listener: ListenerHandle, options: SearchOptions) {
		let sockets = self.matching_sockets(&options);

		if sockets.is_empty() {
			self.wanted.push((service_type, listener, options));
			return;
		}

		for socket in sockets {
			self.start_client(cx, socket, service_type.clone(), listener.clone(), options.clone());
		}
	}

	fn start_client(&mut self, cx: CX![], socket: SocketKey, service_type: Name, listener: ListenerHandle, options: SearchOptions) {
		let key = ClientKey { socket, service_type: service_type.upper_key() };

		let is_new = !self.clients.contains_key(&key);
		let client = self.clients.entry(key.clone()).or_insert_with(|| ServiceTypeClient::new(service_type.clone()));
		let first = client.register(listener.clone(), options, &self.cfg);

		listener.on_socket_created(socket);

		if first {
			listener.on_discovery_started(&service_type);
		}

		if is_new {
			self.schedule_next_query(cx, key.clone());
			self.schedule_sweep(cx, key.clone());
		}
	}

	fn unregister_listener(&mut self, cx: CX![], service_type: Name, listener: ListenerHandle) {
		self.wanted.retain(|(st, l, _)| !(st.eq_dns(&service_type) && same_listener(l, &listener)));

		let matching: Vec<ClientKey> = self.clients.keys().filter(|k| k.service_type == service_type.upper_key()).cloned().collect();

		for key in matching {
			let Some(client) = self.clients.get_mut(&key) else { continue };
			let last = client.unregister(&listener, &self.cfg);

			if last {
				listener.on_discovery_stopped(&service_type);
				self.retire_client(cx, key);
			}
		}
	}

	/// Keep a now-idle client's cache warm for the retention window before dropping it
	/// (§4.6, §6's `cached_services_retention`). If `cached_services_removal_enabled`
	/// is off, the cache is kept indefinitely until the socket itself is torn down.
	fn retire_client(&mut self, cx: CX![], key: ClientKey) {
		if !self.cfg.features.cached_services_removal_enabled {
			return;
		}

		let retention = self.cfg.cached_services_retention;
		let actor = self.actor();

		cx.after(retention, move |s| {
			actor.apply(s, move |this, _cx| {
				if this.clients.get(&key).is_some_and(ServiceTypeClient::is_idle) {
					this.clients.remove(&key);
				}
			})
		});
	}

	// ----------------------------------------------------------------------------
	// Query scheduling (§4.4)
	// ----------------------------------------------------------------------------

	fn schedule_next_query(&mut self, cx: CX![], key: ClientKey) {
		let actor = self.actor();

		cx.after(Duration::ZERO, move |s| {
			actor.apply(s, move |this, cx| this.send_query(cx, key));
		});
	}

	fn send_query(&mut self, cx: CX![], key: ClientKey) {
		let Some(client) = self.clients.get_mut(&key) else { return };

		if client.is_idle() {
			return;
		}

		let now = now_ms(cx);
		let (packet, decision) = client.build_query(now, &self.cfg);

		self.transmit_query(&key.socket, &packet, &decision);

		let actor = self.actor();
		let delay = decision.delay_until_next;

		cx.after(delay, move |s| {
			actor.apply(s, move |this, cx| this.send_query(cx, key));
		});
	}

	fn transmit_query(&self, socket_key: &SocketKey, packet: &wire::Packet, _decision: &NextQuery) {
		let Some(iface) = self.interfaces.get(&socket_key.interface_index) else { return };
		let Some(socket) = &iface.socket else { return };

		let datagrams = match wire::write_query_packets(packet, 9000) {
			Ok(d) => d,
			Err(err) => {
				warn!("Failed to encode outgoing query: {err}");
				return;
			}
		};

		let dest_v4 = std::net::SocketAddr::new(socket::MDNS_GROUP_V4.into(), socket::MDNS_PORT);
		let dest_v6 = std::net::SocketAddr::new(socket::MDNS_GROUP_V6.into(), socket::MDNS_PORT);

		for datagram in datagrams {
			socket.enqueue(datagram.clone(), dest_v4);
			socket.enqueue(datagram, dest_v6);
		}
	}

	fn schedule_sweep(&mut self, cx: CX![], key: ClientKey) {
		let actor = self.actor();
		let period = self.cfg.time_between_queries_in_burst.max(Duration::from_millis(500));

		cx.after(period, move |s| {
			actor.apply(s, move |this, cx| this.run_sweep(cx, key));
		});
	}

	fn run_sweep(&mut self, cx: CX![], key: ClientKey) {
		let now = now_ms(cx);
		let cfg = self.cfg.clone();

		if let Some(client) = self.clients.get_mut(&key) {
			for removed in client.sweep_expired(now, &cfg) {
				client.deliver(&removed, crate::client::InstanceEvent::Removed);
			}

			for removed in client.reap_goodbyes(now) {
				client.deliver(&removed, crate::client::InstanceEvent::Removed);
			}

			if !client.is_idle() {
				self.schedule_sweep(cx, key);
			}
		}
	}

	// ----------------------------------------------------------------------------
	// Inbound packets (§4.1, §4.2, §7)
	// ----------------------------------------------------------------------------

	fn handle_inbound(&mut self, cx: CX![], inbound: Inbound) {
		self.packet_seq += 1;
		let seq = self.packet_seq;

		let packet = match wire::parse_packet(&inbound.datagram) {
			Ok(packet) => packet,
			Err(err) => {
				self.on_parse_failure(inbound.key, seq, err);
				return;
			}
		};

		let now = now_ms(cx);
		let cfg = self.cfg.clone();

		// §4.2's three passes run over "the union of answer/authority/additional
		// records": DNS-SD responders commonly place PTR in the answer section and the
		// SRV/TXT/address records that complete an instance in the additional section
		// (RFC 6763 §12), but the authority section is fair game too.
		let records: Vec<wire::Record> = packet.answers.iter().chain(&packet.authorities).chain(&packet.additionals).cloned().collect();

		let matching: Vec<ClientKey> = self.clients.keys().filter(|k| k.socket == inbound.key).cloned().collect();

		for key in matching {
			let Some(client) = self.clients.get_mut(&key) else { continue };
			let events = client.process_response(&records, now, &cfg);

			for (instance, kind) in events {
				client.deliver(&instance, kind);
			}
		}
	}

	fn on_parse_failure(&mut self, socket: SocketKey, seq: u64, err: ParseError) {
		*self.parse_failures.entry(socket).or_insert(0) += 1;
		debug!("Failed to parse inbound mDNS packet on interface {}: {err}", socket.interface_index);

		for client in self.clients.values() {
			for listener in client.listeners() {
				listener.on_failed_to_parse(seq, err.kind());
			}
		}
	}

	// ----------------------------------------------------------------------------
	// Interface lifecycle (§4.7)
	// ----------------------------------------------------------------------------

	fn handle_interface_event(&mut self, cx: CX![], event: InterfaceEvent) {
		match event {
			InterfaceEvent::NetworkAvailable(info) => self.bring_up(cx, info),
			InterfaceEvent::CapabilitiesChanged { network, transports } => self.update_transports(cx, network, transports),
			InterfaceEvent::LinkPropertiesChanged { network, addresses } => self.update_addresses_by_network(network, addresses),
			InterfaceEvent::NetworkLost(network) => self.tear_down_by_network(cx, network),
			InterfaceEvent::LocalInterfacesChanged(infos) => {
				for info in infos {
					self.bring_up(cx, info);
				}
			}
			InterfaceEvent::LocalAddressChanged { interface_index, addresses } => {
				if let Some(iface) = self.interfaces.get_mut(&interface_index) {
					iface.info.addresses = addresses.clone();

					if let Some(socket) = &mut iface.socket {
						socket.update_addresses(addresses);
					}
				}
			}
		}
	}

	fn bring_up(&mut self, cx: CX![], info: InterfaceInfo) {
		if !socket::is_eligible(info.flags, info.transports) {
			debug!("Interface {} ({}) is not eligible for mDNS", info.index, info.name);
			return;
		}

		let index = info.index;
		self.interfaces.insert(index, Interface { info: info.clone(), socket: None });

		self.maybe_open_socket(cx, index);
	}

	fn maybe_open_socket(&mut self, cx: CX![], interface_index: u32) {
		let Some(iface) = self.interfaces.get(&interface_index) else { return };
		if iface.socket.is_some() {
			return;
		}

		let key = SocketKey { network: iface.info.network, interface_index };
		let addresses = iface.info.addresses.clone();
		let handle = self.self_handle.clone();

		let max_queue = self.cfg.packet_queue_max_size;
		let thread_join_timeout = self.cfg.thread_join_timeout;

		match SocketInfo::open(key, addresses, max_queue, thread_join_timeout, move |inbound| handle.post(Event::Inbound(inbound))) {
			Ok(socket_info) => {
				if let Some(iface) = self.interfaces.get_mut(&interface_index) {
					iface.socket = Some(socket_info);
				}

				self.activate_wanted(cx, key);
			}
			Err(err) => warn!("Failed to open mDNS socket on interface {interface_index}: {err}"),
		}
	}

	/// After a new socket comes up, start any search that was waiting on it (§4.7's
	/// ordering guarantee: `on_socket_created` fires before any response on that socket).
	fn activate_wanted(&mut self, cx: CX![], key: SocketKey) {
		let matches: Vec<(Name, ListenerHandle, SearchOptions)> = self
			.wanted
			.iter()
			.filter(|(_, _, options)| {
				(options.network.is_none() || options.network == key.network) && (options.interface_index.is_none() || options.interface_index == Some(key.interface_index))
			})
			.cloned()
			.collect();

		for (service_type, listener, options) in matches {
			self.start_client(cx, key, service_type, listener, options);
		}
	}

	fn update_transports(&mut self, cx: CX![], network: crate::socket::NetHandle, transports: Transports) {
		let Some((&index, _)) = self.interfaces.iter().find(|(_, i)| i.info.network == Some(network)) else { return };

		if let Some(iface) = self.interfaces.get_mut(&index) {
			iface.info.transports = transports;
		}

		if !socket::is_eligible(self.interfaces[&index].info.flags, transports) {
			self.tear_down(cx, index);
		} else {
			self.maybe_open_socket(cx, index);
		}
	}

	fn update_addresses_by_network(&mut self, network: crate::socket::NetHandle, addresses: Vec<std::net::IpAddr>) {
		let Some((_, iface)) = self.interfaces.iter_mut().find(|(_, i)| i.info.network == Some(network)) else { return };

		iface.info.addresses = addresses.clone();

		if let Some(socket) = &mut iface.socket {
			socket.update_addresses(addresses);
		}
	}

	fn tear_down_by_network(&mut self, cx: CX![], network: crate::socket::NetHandle) {
		let index = self.interfaces.iter().find(|(_, i)| i.info.network == Some(network)).map(|(&i, _)| i);

		if let Some(index) = index {
			self.tear_down(cx, index);
		}
	}

	/// Drop the socket for `interface_index` and notify every listener that was depending
	/// on it (§4.7: "each client backed by that socket has its instances reported as
	/// removed, and the socket's listeners receive `on_interface_destroyed`").
	fn tear_down(&mut self, _cx: CX![], interface_index: u32) {
		let Some(mut iface) = self.interfaces.remove(&interface_index) else { return };
		let Some(socket) = iface.socket.take() else { return };

		let affected: Vec<ClientKey> = self.clients.keys().filter(|k| k.socket == socket.key).cloned().collect();

		for key in affected {
			if let Some(client) = self.clients.remove(&key) {
				// §5: "interface_destroyed follows all prior deliveries for that socket" —
				// the Removed events for every complete instance go out first (§4.5
				// notify_socket_destroyed), then on_interface_destroyed.
				let instances: Vec<_> = client.complete_instances().cloned().collect();
				for inst in &instances {
					client.deliver(inst, crate::client::InstanceEvent::Removed);
				}

				for listener in client.listeners() {
					listener.on_interface_destroyed(socket.key);
				}
			}
		}

		info!("Tore down mDNS socket on interface {interface_index}");
	}
}

fn now_ms(cx: CX![Manager]) -> Millis {
	runtime::time::unix(cx) as Millis * 1000
}

/// Bundles the `Stakker` scheduler, the manager actor, and the channel pair cross-thread
/// callers post into, and drives the custom run loop (§5).
pub struct EventLoop {
	stakker: Stakker,
	manager: ActorOwn<Manager>,
	events: Receiver<Event>,
	wake_rx: Receiver<()>,
	handle: Handle,
}

impl EventLoop {
	pub fn new(cfg: Config) -> Result<EventLoop, StartError> {
		let mut stakker = runtime::init();

		let (events_tx, events_rx) = mpsc::channel();
		let (wake_tx, wake_rx) = mpsc::channel();
		let handle = Handle { events: events_tx, wake: wake_tx };

		let manager = stakker::actor!(stakker, Manager::init(cfg, handle.clone()), stakker::ret_nop!());

		Ok(EventLoop { stakker, manager, events: events_rx, wake_rx, handle })
	}

	pub fn handle(&self) -> Handle {
		self.handle.clone()
	}

	/// Drive the manager to completion, draining any [`Event`]s posted by receiver
	/// threads or the host's interface-notification thread on every wake (extends
	/// `runtime::rt::exec`'s wake-channel contract with a custom per-iteration drain,
	/// since that loop has no hook for anything beyond stakker's own timer queue).
	pub fn run(mut self) {
		let mut t = Instant::now();
		let mut idle_pending = self.stakker.run(t, false);

		while self.stakker.not_shutdown() {
			if self.drain_events() {
				break;
			}

			let timeout = if idle_pending { Some(Duration::ZERO) } else { self.stakker.next_wait(t) };

			match timeout {
				Some(d) if d.is_zero() => {
					let _ = self.wake_rx.try_recv();
				}
				Some(d) => {
					let _ = self.wake_rx.recv_timeout(d);
				}
				None => {
					let _ = self.wake_rx.recv();
				}
			}

			t = Instant::now();
			idle_pending = self.stakker.run(t, idle_pending);
		}
	}

	/// Apply every queued event onto the manager actor, returning `true` once a
	/// [`Event::Shutdown`] has been seen (at which point the loop stops, without relying
	/// on any further stakker-internal shutdown machinery).
	fn drain_events(&mut self) -> bool {
		while let Ok(event) = self.events.try_recv() {
			if matches!(event, Event::Shutdown) {
				return true;
			}

			let manager = self.manager.clone();
			manager.apply(&mut self.stakker, move |this, cx| this.handle_event(cx, event));
		}

		false
	}
}
