//! The socket provider (C7, §4.7): interface lifecycle policy plus the multicast
//! sockets themselves. Per §1, enumerating interfaces and the platform-specific
//! notification plumbing (network-available/lost, tethering, a wake-lock) are external
//! collaborators — modeled here as the [`InterfaceEvent`] stream an embedder feeds in —
//! while opening the actual UDP socket and joining the mDNS multicast groups is this
//! engine's own job, done with `socket2` (for `SO_REUSEADDR`/`SO_REUSEPORT`, needed so
//! more than one interface can bind port 5353 — `std::net::UdpSocket` alone can't set
//! those before bind) the way several pack repos join `224.0.0.251` for their own
//! mDNS sockets.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};

pub const MDNS_PORT: u16 = 5353;
pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
/// `ff02::fb`.
pub const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

/// An opaque handle to a host "network" (Wi-Fi vs. cellular vs. a VPN tunnel, etc.):
/// §6's `NetHandle`. `None` in a [`SocketKey`]/[`SearchOptions`] means "no specific
/// network" (all networks / a transport with no per-network routing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetHandle(pub u64);

/// Identity of a per-interface mDNS socket (§9's glossary "Socket key"): `(network
/// handle or none, interface index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketKey {
	pub network: Option<NetHandle>,
	pub interface_index: u32,
}

/// Transport bits relevant to §4.7's opening policy (Wi-Fi/cellular/Ethernet/VPN).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transports {
	pub wifi: bool,
	pub cellular: bool,
	pub ethernet: bool,
	pub vpn: bool,
}

/// Interface attributes §4.7's policy reasons over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceFlags {
	pub up: bool,
	pub loopback: bool,
	pub point_to_point: bool,
	pub virtual_if: bool,
	pub multicast_capable: bool,
}

#[derive(Debug, Clone)]
pub struct InterfaceInfo {
	pub index: u32,
	pub name: String,
	pub network: Option<NetHandle>,
	pub flags: InterfaceFlags,
	pub transports: Transports,
	pub addresses: Vec<IpAddr>,
}

/// §4.7's opening policy: never on cellular/loopback/point-to-point/virtual/down
/// interfaces; always on non-VPN Wi-Fi if otherwise eligible; otherwise require
/// multicast capability.
pub fn is_eligible(flags: InterfaceFlags, transports: Transports) -> bool {
	if !flags.up || flags.loopback || flags.point_to_point || flags.virtual_if || transports.cellular {
		return false;
	}

	if transports.wifi && !transports.vpn {
		return true;
	}

	flags.multicast_capable
}

/// The external interface/network-lifecycle notifications (§4.7): network-backed
/// interfaces carry `available`/`capabilities_changed`/`link_properties_changed`/`lost`;
/// local-only interfaces (tethering downstreams, a Wi-Fi P2P group-owner interface) are
/// tracked by a separate name-list stream plus a low-level per-ifindex address monitor.
#[derive(Debug, Clone)]
pub enum InterfaceEvent {
	NetworkAvailable(InterfaceInfo),
	CapabilitiesChanged { network: NetHandle, transports: Transports },
	LinkPropertiesChanged { network: NetHandle, addresses: Vec<IpAddr> },
	NetworkLost(NetHandle),
	/// Current tethering/P2P-group-owner interface list (by kernel ifindex).
	LocalInterfacesChanged(Vec<InterfaceInfo>),
	/// Address update for a local-only interface, keyed by kernel ifindex.
	LocalAddressChanged { interface_index: u32, addresses: Vec<IpAddr> },
}

/// A bounded FIFO of outgoing datagrams, drained by one dedicated sender thread
/// (§5's "packet send queues ... drained in FIFO order; when a queue exceeds a
/// configured cap, oldest packets are dropped first to make room"). Separate from the
/// receiver threads so a burst of queries never blocks on an in-flight read, and closed
/// the same way a receive socket is: the sender thread's wait is woken, not aborted.
struct SendQueue {
	state: Mutex<QueueState>,
	not_empty: Condvar,
}

struct QueueState {
	items: VecDeque<(Vec<u8>, SocketAddr)>,
	max: usize,
	closed: bool,
}

impl SendQueue {
	fn new(max: usize) -> SendQueue {
		SendQueue { state: Mutex::new(QueueState { items: VecDeque::new(), max, closed: false }), not_empty: Condvar::new() }
	}

	fn push(&self, datagram: Vec<u8>, dest: SocketAddr) {
		let mut state = self.state.lock().unwrap();

		if state.items.len() >= state.max {
			state.items.pop_front();
			warn!("Outbound mDNS packet queue full (cap {}); dropped the oldest queued packet", state.max);
		}

		state.items.push_back((datagram, dest));
		self.not_empty.notify_one();
	}

	/// Block until a datagram is available or the queue is closed, in which case
	/// `None` tells the sender thread to exit.
	fn pop(&self) -> Option<(Vec<u8>, SocketAddr)> {
		let mut state = self.state.lock().unwrap();

		loop {
			if let Some(item) = state.items.pop_front() {
				return Some(item);
			}

			if state.closed {
				return None;
			}

			state = self.not_empty.wait(state).unwrap();
		}
	}

	fn close(&self) {
		self.state.lock().unwrap().closed = true;
		self.not_empty.notify_all();
	}
}

/// An open per-interface mDNS socket (§4.7's `SocketInfo`): bound to the mDNS port,
/// IPv4 and IPv6 multicast groups joined where the interface carries that family.
pub struct SocketInfo {
	pub key: SocketKey,
	pub addresses: Vec<IpAddr>,
	v4: Option<Arc<UdpSocket>>,
	v6: Option<Arc<UdpSocket>>,
	/// Listeners currently depending on this socket; destroyed once this drops to zero
	/// and the owning interface is still present (§3's Lifecycles).
	pub requesters: usize,
	recv_threads: Vec<JoinHandle<()>>,
	send_queue: Arc<SendQueue>,
	send_thread: Option<JoinHandle<()>>,
	/// §5's "thread join on shutdown uses a 1 s budget" (`thread_join_timeout_ms`).
	thread_join_timeout: Duration,
}

fn bind_v4(addresses: &[IpAddr]) -> io::Result<UdpSocket> {
	let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
	socket.set_reuse_address(true)?;
	#[cfg(unix)]
	socket.set_reuse_port(true)?;
	socket.set_nonblocking(false)?;

	let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MDNS_PORT);
	socket.bind(&bind_addr.into())?;

	let interface = addresses.iter().find_map(|a| match a {
		IpAddr::V4(v4) => Some(*v4),
		_ => None,
	});

	socket.join_multicast_v4(&MDNS_GROUP_V4, &interface.unwrap_or(Ipv4Addr::UNSPECIFIED))?;
	socket.set_multicast_loop_v4(false)?;

	Ok(socket.into())
}

fn bind_v6(interface_index: u32) -> io::Result<UdpSocket> {
	let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
	socket.set_reuse_address(true)?;
	#[cfg(unix)]
	socket.set_reuse_port(true)?;
	socket.set_only_v6(true)?;
	socket.set_nonblocking(false)?;

	let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, MDNS_PORT, 0, 0);
	socket.bind(&bind_addr.into())?;

	socket.join_multicast_v6(&MDNS_GROUP_V6, interface_index)?;
	socket.set_multicast_loop_v6(false)?;

	Ok(socket.into())
}

/// What a receiver thread hands back to the loop for each datagram (§5: receive
/// threads are the only place that blocks on socket I/O).
pub struct Inbound {
	pub key: SocketKey,
	pub datagram: Vec<u8>,
	pub source: SocketAddr,
}

impl SocketInfo {
	/// Open (or re-open, on an address change) the sockets for `key` bound to
	/// `addresses`, and spawn one receiver thread per open family plus the dedicated
	/// sender thread (§4.7, §5). `max_queue` and `thread_join_timeout` come from
	/// `Config::packet_queue_max_size`/`Config::thread_join_timeout`.
	pub fn open(
		key: SocketKey,
		addresses: Vec<IpAddr>,
		max_queue: usize,
		thread_join_timeout: Duration,
		on_inbound: impl Fn(Inbound) + Send + Sync + 'static,
	) -> io::Result<SocketInfo> {
		let on_inbound = Arc::new(on_inbound);

		let v4 = if addresses.iter().any(|a| a.is_ipv4()) || addresses.is_empty() {
			Some(Arc::new(bind_v4(&addresses)?))
		} else {
			None
		};

		let v6 = if addresses.iter().any(|a| a.is_ipv6()) {
			Some(Arc::new(bind_v6(key.interface_index)?))
		} else {
			None
		};

		let mut recv_threads = Vec::new();

		if let Some(sock) = v4.clone() {
			recv_threads.push(spawn_receiver(key, sock, on_inbound.clone()));
		}

		if let Some(sock) = v6.clone() {
			recv_threads.push(spawn_receiver(key, sock, on_inbound));
		}

		let send_queue = Arc::new(SendQueue::new(max_queue.max(1)));
		let send_thread = Some(spawn_sender(key, send_queue.clone(), v4.clone(), v6.clone()));

		info!("Opened mDNS socket for interface {} ({} families)", key.interface_index, recv_threads.len());

		Ok(SocketInfo { key, addresses, v4, v6, requesters: 0, recv_threads, send_queue, send_thread, thread_join_timeout })
	}

	/// Re-join the multicast groups after a link-property address change, without
	/// tearing down the receiver threads (§4.7: "addresses are updated in place and the
	/// multicast groups are re-joined").
	pub fn update_addresses(&mut self, addresses: Vec<IpAddr>) {
		self.addresses = addresses;

		if let Some(sock) = &self.v4 {
			let s2 = Socket::from(sock.as_ref().try_clone().expect("duplicate the v4 socket fd"));
			let interface = self.addresses.iter().find_map(|a| match a {
				IpAddr::V4(v4) => Some(*v4),
				_ => None,
			});

			if let Err(err) = s2.join_multicast_v4(&MDNS_GROUP_V4, &interface.unwrap_or(Ipv4Addr::UNSPECIFIED)) {
				warn!("Failed to re-join IPv4 multicast group on address change: {err}");
			}
		}
	}

	/// Enqueue a datagram for the sender thread to drain in FIFO order (§5). Never
	/// blocks the caller on socket I/O; the oldest queued packet is dropped first if the
	/// queue is already at `packet_queue_max_size`.
	pub fn enqueue(&self, datagram: Vec<u8>, addr: SocketAddr) {
		self.send_queue.push(datagram, addr);
	}
}

/// Closing the underlying socket is what interrupts a receiver thread's blocking
/// `recv_from`; closing the send queue is what wakes and retires the sender thread
/// (§5's only sanctioned ways to unblock them). Joins are bounded by
/// `thread_join_timeout`: if a thread hasn't finished by the deadline, we poll once
/// more after re-checking the clock (covering a coarse clock tick under-counting the
/// budget) and then give up rather than block shutdown forever.
impl Drop for SocketInfo {
	fn drop(&mut self) {
		self.v4 = None;
		self.v6 = None;
		self.send_queue.close();

		let deadline = Instant::now() + self.thread_join_timeout;

		if let Some(handle) = self.send_thread.take() {
			join_with_deadline(handle, deadline, "sender", self.key.interface_index);
		}

		for handle in self.recv_threads.drain(..) {
			join_with_deadline(handle, deadline, "receiver", self.key.interface_index);
		}
	}
}

/// Poll `handle` for completion until `deadline`, with one extra grace poll past the
/// deadline in case coarse timer resolution made us wake early (§5). Gives up and
/// detaches the thread rather than blocking shutdown indefinitely.
fn join_with_deadline(handle: JoinHandle<()>, deadline: Instant, role: &str, interface_index: u32) {
	let mut extended = false;

	loop {
		if handle.is_finished() {
			let _ = handle.join();
			return;
		}

		if Instant::now() >= deadline {
			if !extended {
				extended = true;
				std::thread::sleep(Duration::from_millis(10));
				continue;
			}

			warn!("Timed out joining {role} thread for interface {interface_index}; detaching it");
			return;
		}

		std::thread::sleep(Duration::from_millis(5));
	}
}

fn spawn_receiver(key: SocketKey, socket: Arc<UdpSocket>, on_inbound: Arc<dyn Fn(Inbound) + Send + Sync>) -> JoinHandle<()> {
	std::thread::spawn(move || {
		let mut buf = vec![0u8; 9000];

		loop {
			match socket.recv_from(&mut buf) {
				Ok((n, source)) => on_inbound(Inbound { key, datagram: buf[..n].to_vec(), source }),
				Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => continue,
				Err(_) => {
					debug!("Receiver thread for interface {} exiting (socket closed)", key.interface_index);
					return;
				}
			}
		}
	})
}

/// Drains the send queue and writes each datagram to the matching address-family
/// socket (§5). Exits once the queue is closed and drained.
fn spawn_sender(key: SocketKey, queue: Arc<SendQueue>, v4: Option<Arc<UdpSocket>>, v6: Option<Arc<UdpSocket>>) -> JoinHandle<()> {
	std::thread::spawn(move || {
		while let Some((datagram, dest)) = queue.pop() {
			let sock = match dest {
				SocketAddr::V4(_) => v4.as_ref(),
				SocketAddr::V6(_) => v6.as_ref(),
			};

			match sock {
				Some(sock) => {
					if let Err(err) = sock.send_to(&datagram, dest) {
						warn!("Failed to send mDNS packet on interface {}: {err}", key.interface_index);
					}
				}
				None => debug!("Dropping queued packet for interface {}: no socket for {dest}'s address family", key.interface_index),
			}
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn flags(up: bool, loopback: bool, ptp: bool, virt: bool, multicast: bool) -> InterfaceFlags {
		InterfaceFlags { up, loopback, point_to_point: ptp, virtual_if: virt, multicast_capable: multicast }
	}

	#[test]
	fn cellular_is_never_eligible() {
		let t = Transports { cellular: true, ..Default::default() };
		assert!(!is_eligible(flags(true, false, false, false, true), t));
	}

	#[test]
	fn loopback_point_to_point_virtual_down_are_excluded() {
		let t = Transports::default();
		assert!(!is_eligible(flags(false, false, false, false, true), t));
		assert!(!is_eligible(flags(true, true, false, false, true), t));
		assert!(!is_eligible(flags(true, false, true, false, true), t));
		assert!(!is_eligible(flags(true, false, false, true, true), t));
	}

	#[test]
	fn non_vpn_wifi_is_always_eligible() {
		let t = Transports { wifi: true, ..Default::default() };
		assert!(is_eligible(flags(true, false, false, false, false), t));
	}

	#[test]
	fn vpn_wifi_falls_back_to_multicast_capability() {
		let t = Transports { wifi: true, vpn: true, ..Default::default() };
		assert!(!is_eligible(flags(true, false, false, false, false), t));
		assert!(is_eligible(flags(true, false, false, false, true), t));
	}

	#[test]
	fn ethernet_requires_multicast_capability() {
		let t = Transports { ethernet: true, ..Default::default() };
		assert!(!is_eligible(flags(true, false, false, false, false), t));
		assert!(is_eligible(flags(true, false, false, false, true), t));
	}

	#[test]
	fn send_queue_drops_oldest_when_full() {
		let queue = SendQueue::new(2);
		let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5353));

		queue.push(vec![1], addr);
		queue.push(vec![2], addr);
		queue.push(vec![3], addr); // drops [1]

		assert_eq!(queue.pop().unwrap().0, vec![2]);
		assert_eq!(queue.pop().unwrap().0, vec![3]);
	}

	#[test]
	fn send_queue_pop_returns_none_once_closed_and_drained() {
		let queue = SendQueue::new(4);
		let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5353));

		queue.push(vec![9], addr);
		queue.close();

		assert_eq!(queue.pop().unwrap().0, vec![9]);
		assert!(queue.pop().is_none());
	}
}
