//! The per-(socket, service-type) client (C5, §4.5): owns one cache shard, one query
//! scheduler, and the listeners currently interested in this service type on this
//! socket. The discovery manager drives it; it has no I/O of its own.

use std::collections::HashMap;
use std::time::Duration;

use crate::cache::{Cache, Millis};
use crate::config::{Config, QueryMode, SearchOptions};
use crate::listener::{same_listener, ListenerHandle};
use crate::model::{self, ServiceInstance};
use crate::name::Name;
use crate::scheduler::{NextQuery, Scheduler};
use crate::wire::{Packet, Question, Record, RRType, CLASS_IN};

struct Registration {
	listener: ListenerHandle,
	options: SearchOptions,
}

impl Registration {
	/// Whether `instance` matches this registration's filters (§4.5's
	/// "resolve only a specific instance" search option; subtype/network/interface
	/// filtering already narrowed which client this registration lives on).
	fn accepts(&self, instance: &ServiceInstance) -> bool {
		match &self.options.resolve_instance_name {
			Some(name) => instance.instance_name.eq_dns(name),
			None => true,
		}
	}

	/// The instance as this listener should see it: `only_ipv6_on_ipv6_only` masks
	/// out IPv4 addresses, so a listener searching on an IPv6-only network never gets
	/// handed an address family it can't dial (§6 search options).
	fn view<'a>(&self, instance: &'a ServiceInstance) -> std::borrow::Cow<'a, ServiceInstance> {
		if self.options.only_ipv6_on_ipv6_only && !instance.ipv4.is_empty() {
			let mut masked = instance.clone();
			masked.ipv4.clear();
			std::borrow::Cow::Owned(masked)
		} else {
			std::borrow::Cow::Borrowed(instance)
		}
	}
}

/// What happened to the instance set after a packet was folded in, already expanded
/// into the per-listener events a caller should deliver (§4.5's event table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceEvent {
	Found,
	Updated,
	Removed,
	Discovered,
}

pub struct ServiceTypeClient {
	pub service_type: Name,
	cache: Cache,
	instances: HashMap<String, ServiceInstance>,
	/// Instances seen complete at least once, so a later incompleteness or removal is
	/// reported as `Removed` rather than silently dropped (§4.5).
	completed: std::collections::HashSet<String>,
	scheduler: Scheduler,
	registrations: Vec<Registration>,
	/// TTL=0 goodbye records awaiting the 1 s delayed-removal grace (§4.5 scenario 2,
	/// supplemented per §10): instance key to the monotonic ms it should be removed at.
	pending_goodbyes: HashMap<String, Millis>,
}

const GOODBYE_GRACE: Duration = Duration::from_secs(1);

impl ServiceTypeClient {
	pub fn new(service_type: Name) -> ServiceTypeClient {
		ServiceTypeClient {
			service_type,
			cache: Cache::new(),
			instances: HashMap::new(),
			completed: std::collections::HashSet::new(),
			scheduler: Scheduler::new(QueryMode::Active),
			registrations: Vec::new(),
			pending_goodbyes: HashMap::new(),
		}
	}

	pub fn is_idle(&self) -> bool {
		self.registrations.is_empty()
	}

	fn union_mode(&self, cfg: &Config) -> QueryMode {
		if cfg.features.aggressive_query_mode_enabled && self.registrations.iter().any(|r| r.options.query_mode == QueryMode::Aggressive) {
			QueryMode::Aggressive
		} else if self.registrations.iter().all(|r| r.options.query_mode == QueryMode::Passive) {
			QueryMode::Passive
		} else {
			QueryMode::Active
		}
	}

	fn union_always_unicast(&self) -> bool {
		self.registrations.iter().any(|r| r.options.always_unicast)
	}

	fn subtypes(&self) -> Vec<Name> {
		self.registrations.iter().flat_map(|r| r.options.subtypes.iter().cloned()).collect()
	}

	/// Register a listener's interest, restarting the scheduler with the union of all
	/// listeners' search options (§4.5 `start_send_and_receive`). Returns whether this
	/// was the first listener (so the caller should fire `on_discovery_started` and send
	/// the first burst of queries immediately).
	pub fn register(&mut self, listener: ListenerHandle, options: SearchOptions, cfg: &Config) -> bool {
		let first = self.registrations.is_empty();
		self.registrations.push(Registration { listener, options });
		self.scheduler.set_mode(self.union_mode(cfg));
		first
	}

	/// Unregister a listener (§4.6 `stop_send_and_receive`). Returns whether this was the
	/// last listener (so the caller should fire `on_discovery_stopped`, keep the cache
	/// warm for the retention window, then let the client drop).
	pub fn unregister(&mut self, listener: &ListenerHandle, cfg: &Config) -> bool {
		self.registrations.retain(|r| !same_listener(&r.listener, listener));
		self.scheduler.set_mode(self.union_mode(cfg));
		self.registrations.is_empty()
	}

	pub fn listeners(&self) -> impl Iterator<Item = &ListenerHandle> {
		self.registrations.iter().map(|r| &r.listener)
	}

	/// Deliver one instance-scoped event to every registration whose filters accept
	/// `instance` (§4.5), masking addresses per `only_ipv6_on_ipv6_only` along the way.
	pub fn deliver(&self, instance: &ServiceInstance, event: InstanceEvent) {
		for reg in &self.registrations {
			if !reg.accepts(instance) {
				continue;
			}

			let view = reg.view(instance);

			match event {
				InstanceEvent::Found => reg.listener.on_service_found(&view),
				InstanceEvent::Updated => reg.listener.on_service_updated(&view),
				InstanceEvent::Removed => reg.listener.on_service_removed(&view),
				InstanceEvent::Discovered => reg.listener.on_service_discovered(&view),
			}
		}
	}

	/// All currently tracked instances, regardless of completeness.
	pub fn instances(&self) -> impl Iterator<Item = &ServiceInstance> {
		self.instances.values()
	}

	/// Instances a listener has actually been told about (`on_service_found` already
	/// fired), per the `completed` set (§4.5, §8's completeness-monotonicity property:
	/// a removal notification must never precede a found one, so a socket teardown or
	/// any other bulk-removal path iterates this, not [`Self::instances`]).
	pub fn complete_instances(&self) -> impl Iterator<Item = &ServiceInstance> {
		self.completed.iter().filter_map(|key| self.instances.get(key))
	}

	/// Fold a decoded response's records into this client's cache and instance set,
	/// returning each affected instance with the event a caller should deliver to
	/// listeners (§4.2, §4.5).
	pub fn process_response(&mut self, records: &[Record], now: Millis, cfg: &Config) -> Vec<(ServiceInstance, InstanceEvent)> {
		self.apply_goodbyes(records, now);

		let subtypes = self.subtypes();
		let augmentation = model::augment(
			records,
			&mut self.cache,
			&mut self.instances,
			&self.service_type,
			&subtypes,
			now,
			cfg.features.allow_multiple_srv_per_host,
		);

		let mut events = Vec::new();

		for name in augmentation.discovered {
			if let Some(inst) = self.instances.get(&name.upper_key()) {
				events.push((inst.clone(), InstanceEvent::Discovered));
			}
		}

		let mut modified: Vec<String> = augmentation.modified.iter().map(Name::upper_key).collect();
		modified.sort();
		modified.dedup();

		for key in modified {
			let Some(inst) = self.instances.get(&key) else { continue };

			if inst.is_complete() {
				if self.completed.insert(key.clone()) {
					events.push((inst.clone(), InstanceEvent::Found));
				} else {
					events.push((inst.clone(), InstanceEvent::Updated));
				}
			} else if self.completed.remove(&key) {
				events.push((inst.clone(), InstanceEvent::Removed));
			}
		}

		events
	}

	/// Scan incoming PTR records for TTL=0 goodbyes and arm their delayed removal
	/// (§10's supplemented goodbye grace: the removal event fires one second later, not
	/// synchronously, so a near-simultaneous re-announcement cancels it cleanly).
	fn apply_goodbyes(&mut self, records: &[Record], now: Millis) {
		for rec in records {
			if rec.rrtype != RRType::Ptr || rec.ttl != 0 {
				continue;
			}

			let crate::wire::RData::Ptr(target) = &rec.data else { continue };

			if self.instances.contains_key(&target.upper_key()) {
				self.pending_goodbyes.insert(target.upper_key(), now + GOODBYE_GRACE.as_millis() as Millis);
			}
		}
	}

	/// Remove instances whose goodbye grace has elapsed (driven by the manager's per-tick
	/// timer), returning the ones removed. Only instances that were previously reported
	/// complete are returned (§8's completeness-monotonicity property) — a goodbye for a
	/// bare-PTR instance still drops it from `self.instances`, it just never generates an
	/// `on_service_removed` no listener was ever told `on_service_found` for.
	pub fn reap_goodbyes(&mut self, now: Millis) -> Vec<ServiceInstance> {
		let due: Vec<String> = self.pending_goodbyes.iter().filter(|&(_, &at)| now >= at).map(|(k, _)| k.clone()).collect();

		let mut removed = Vec::new();

		for key in due {
			self.pending_goodbyes.remove(&key);
			let was_complete = self.completed.remove(&key);

			if let Some(inst) = self.instances.remove(&key) {
				if was_complete {
					removed.push(inst);
				}
			}
		}

		removed
	}

	/// Drop expired cache records and any instance that consequently becomes incomplete
	/// (§4.3's periodic sweep, §4.5's TTL-expiry removal event), if the feature toggle
	/// allows it.
	pub fn sweep_expired(&mut self, now: Millis, cfg: &Config) -> Vec<ServiceInstance> {
		if !cfg.features.expired_services_removal_enabled {
			self.cache.sweep_expired(now);
			return Vec::new();
		}

		self.cache.sweep_expired(now);

		let mut removed = Vec::new();
		let incomplete: Vec<String> = self
			.instances
			.iter()
			.filter(|(_, inst)| self.completed.contains(&inst.instance_name.upper_key()) && !inst.is_complete())
			.map(|(k, _)| k.clone())
			.collect();

		for key in incomplete {
			self.completed.remove(&key);
			if let Some(inst) = self.instances.get(&key) {
				removed.push(inst.clone());
			}
		}

		removed
	}

	/// Earliest half-TTL renewal deadline among records backing a currently complete
	/// instance, relative to `now` (§4.4's back-off alignment).
	fn earliest_renewal(&self, now: Millis) -> Option<Duration> {
		self.completed
			.iter()
			.filter_map(|key| self.instances.get(key))
			.map(|inst| inst.min_remaining_ttl(&self.cache, now) / 2)
			.min()
			.map(Duration::from_millis)
	}

	/// Advance the scheduler and build the next query packet (§4.4 query construction,
	/// known-answer suppression per §4.4/§6), returning the packet plus how long to wait
	/// before calling this again.
	pub fn build_query(&mut self, now: Millis, cfg: &Config) -> (Packet, NextQuery) {
		let renewal = self.earliest_renewal(now);
		let decision = self.scheduler.advance(cfg, self.union_always_unicast(), renewal);
		let qu_bit = decision.expect_unicast && cfg.features.unicast_reply_enabled;

		let mut packet = Packet::new_query(decision.txid);
		packet.questions.push(Question { name: self.service_type.clone(), rrtype: RRType::Ptr, unicast_response: qu_bit });

		for sub in self.subtypes() {
			packet.questions.push(Question { name: sub, rrtype: RRType::Ptr, unicast_response: qu_bit });
		}

		if cfg.features.known_answer_suppression_enabled && cfg.features.query_with_known_answer_enabled {
			for (key, record) in self.cache.records_above_half_ttl(now) {
				if key.rrtype != RRType::Ptr {
					continue;
				}

				if !key.name.eq_dns(&self.service_type) && !self.subtypes().iter().any(|s| key.name.eq_dns(s)) {
					continue;
				}

				packet.answers.push(Record {
					name: key.name,
					rrtype: key.rrtype,
					class: CLASS_IN,
					cache_flush: record.cache_flush,
					ttl: record.remaining_ttl(now) as u32 / 1000,
					data: record.data,
				});
			}
		}

		(packet, decision)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wire::{RData, TxtEntry};
	use std::net::Ipv4Addr;
	use std::sync::Arc;

	struct NoopListener;
	impl crate::listener::Listener for NoopListener {}

	fn ptr(target: &str, ttl: u32) -> Record {
		Record { name: Name::from_ascii("_t._tcp.local"), rrtype: RRType::Ptr, class: CLASS_IN, cache_flush: false, ttl, data: RData::Ptr(Name::from_ascii(target)) }
	}

	fn srv(owner: &str, ttl: u32) -> Record {
		Record {
			name: Name::from_ascii(owner),
			rrtype: RRType::Srv,
			class: CLASS_IN,
			cache_flush: true,
			ttl,
			data: RData::Srv { priority: 0, weight: 0, port: 80, target: Name::from_ascii("h.local") },
		}
	}

	fn txt(owner: &str, ttl: u32) -> Record {
		Record { name: Name::from_ascii(owner), rrtype: RRType::Txt, class: CLASS_IN, cache_flush: true, ttl, data: RData::Txt(vec![TxtEntry(b"a=1".to_vec())]) }
	}

	fn a(owner: &str, ttl: u32) -> Record {
		Record { name: Name::from_ascii(owner), rrtype: RRType::A, class: CLASS_IN, cache_flush: false, ttl, data: RData::A(Ipv4Addr::new(1, 2, 3, 4)) }
	}

	#[test]
	fn first_registration_reports_as_first() {
		let mut client = ServiceTypeClient::new(Name::from_ascii("_t._tcp.local"));
		let listener: ListenerHandle = Arc::new(NoopListener);

		let cfg = Config::default();
		assert!(client.register(listener.clone(), SearchOptions::default(), &cfg));
		assert!(!client.register(Arc::new(NoopListener), SearchOptions::default(), &cfg));
	}

	#[test]
	fn completion_reports_found_once_then_updated() {
		let mut client = ServiceTypeClient::new(Name::from_ascii("_t._tcp.local"));
		let cfg = Config::default();

		let records = vec![ptr("inst._t._tcp.local", 120), srv("inst._t._tcp.local", 120), txt("inst._t._tcp.local", 120), a("h.local", 120)];
		let events = client.process_response(&records, 0, &cfg);
		assert!(events.iter().any(|(_, e)| *e == InstanceEvent::Found));

		let update = vec![txt("inst._t._tcp.local", 120)];
		let events = client.process_response(&update, 1_000, &cfg);
		// Identical TXT data refreshes rather than changes, so no further event fires.
		assert!(events.is_empty());
	}

	#[test]
	fn goodbye_removal_is_delayed_by_one_second() {
		let mut client = ServiceTypeClient::new(Name::from_ascii("_t._tcp.local"));
		let cfg = Config::default();

		let records = vec![ptr("inst._t._tcp.local", 120), srv("inst._t._tcp.local", 120), txt("inst._t._tcp.local", 120), a("h.local", 120)];
		client.process_response(&records, 0, &cfg);

		let goodbye = vec![ptr("inst._t._tcp.local", 0)];
		client.process_response(&goodbye, 5_000, &cfg);

		assert!(client.reap_goodbyes(5_500).is_empty());
		let removed = client.reap_goodbyes(6_000);
		assert_eq!(removed.len(), 1);
	}

	#[test]
	fn goodbye_for_incomplete_instance_reports_no_removal() {
		// A bare PTR that never completed was never reported `Found`, so its goodbye
		// must not surface as a `Removed` either (§8 completeness monotonicity).
		let mut client = ServiceTypeClient::new(Name::from_ascii("_t._tcp.local"));
		let cfg = Config::default();

		client.process_response(&[ptr("inst._t._tcp.local", 120)], 0, &cfg);
		assert!(client.complete_instances().next().is_none());

		client.process_response(&[ptr("inst._t._tcp.local", 0)], 5_000, &cfg);
		assert!(client.reap_goodbyes(6_000).is_empty());
	}

	#[test]
	fn build_query_includes_known_answer_suppression_list() {
		let mut client = ServiceTypeClient::new(Name::from_ascii("_t._tcp.local"));
		let cfg = Config::default();

		let records = vec![ptr("inst._t._tcp.local", 120)];
		client.process_response(&records, 0, &cfg);

		let (packet, decision) = client.build_query(1_000, &cfg);
		assert_eq!(packet.id, decision.txid);
		assert!(packet.answers.iter().any(|r| r.rrtype == RRType::Ptr));
	}
}
