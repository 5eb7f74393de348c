//! The response model (C2): in-memory composition of a discovered service instance
//! out of its constituent PTR/SRV/TXT/address records, and the three-pass
//! augmentation algorithm that keeps it current as packets arrive.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::cache::{Cache, CachedRecord, InsertOutcome, Millis, RecordKey};
use crate::name::Name;
use crate::wire::{RData, Record, RRType, CLASS_IN};

/// One discovered service instance (§3's `ServiceInstance (Response)`).
#[derive(Debug, Clone)]
pub struct ServiceInstance {
	pub instance_name: Name,
	pub service_type: Name,
	pub subtypes: HashSet<String>,
	pub host: Option<Name>,
	pub port: Option<u16>,
	pub ipv4: Vec<Ipv4Addr>,
	pub ipv6: Vec<Ipv6Addr>,
	pub txt: Vec<crate::wire::TxtEntry>,
	pub interface_index: Option<u32>,
}

impl ServiceInstance {
	fn new(instance_name: Name, service_type: Name) -> ServiceInstance {
		ServiceInstance {
			instance_name,
			service_type,
			subtypes: HashSet::new(),
			host: None,
			port: None,
			ipv4: Vec::new(),
			ipv6: Vec::new(),
			txt: Vec::new(),
			interface_index: None,
		}
	}

	/// Complete only once it holds a PTR (implicit, since it exists), a SRV, a TXT, and
	/// at least one address record on the SRV's host (§3's invariant).
	pub fn is_complete(&self) -> bool {
		self.host.is_some() && self.port.is_some() && !self.txt.is_empty() && (!self.ipv4.is_empty() || !self.ipv6.is_empty())
	}

	/// Minimum remaining TTL across the record types required for completeness (§4.2).
	pub fn min_remaining_ttl(&self, cache: &Cache, now: Millis) -> Millis {
		let mut keys = vec![
			RecordKey { name: self.instance_name.clone(), rrtype: RRType::Srv, class: CLASS_IN },
			RecordKey { name: self.instance_name.clone(), rrtype: RRType::Txt, class: CLASS_IN },
		];

		if let Some(host) = &self.host {
			keys.push(RecordKey { name: host.clone(), rrtype: RRType::A, class: CLASS_IN });
			keys.push(RecordKey { name: host.clone(), rrtype: RRType::Aaaa, class: CLASS_IN });
		}

		keys.iter()
			.flat_map(|k| cache.get(k).iter().map(|r| r.remaining_ttl(now)))
			.min()
			.unwrap_or(0)
	}
}

/// The result of applying one packet to a service-type client's state (§4.2).
#[derive(Default)]
pub struct Augmentation {
	/// Instances whose record set changed (not merely refreshed in receipt time).
	pub modified: Vec<Name>,
	/// Instances observed for the first time via a bare PTR (§4.5's `discovered` event).
	pub discovered: Vec<Name>,
}

/// Tracks which instance a host name's address records belong to, for the address
/// pass's "drop all prior same-family addresses of every response whose SRV host
/// matches" rule (§4.2).
fn hosts_matching(instances: &HashMap<String, ServiceInstance>, host: &Name) -> Vec<String> {
	instances
		.iter()
		.filter(|(_, inst)| inst.host.as_ref().is_some_and(|h| h.eq_dns(host)))
		.map(|(k, _)| k.clone())
		.collect()
}

/// Apply one decoded packet's records to `cache` and `instances`, per the three
/// ordered passes of §4.2. `tracked` is the service type (and any registered
/// subtypes) this client cares about; records for other types are ignored.
pub fn augment(
	records: &[Record],
	cache: &mut Cache,
	instances: &mut HashMap<String, ServiceInstance>,
	tracked: &Name,
	subtypes: &[Name],
	now: Millis,
	allow_multiple_srv_per_host: bool,
) -> Augmentation {
	let mut result = Augmentation::default();

	// Pass 1: PTR — owner name equals or is a subtype suffix of a tracked type.
	for rec in records {
		if rec.rrtype != RRType::Ptr {
			continue;
		}

		let matches_tracked = rec.name.eq_dns(tracked) || subtypes.iter().any(|s| rec.name.eq_dns(s));
		if !matches_tracked {
			continue;
		}

		let RData::Ptr(ref target) = rec.data else { continue };

		let key = RecordKey { name: rec.name.clone(), rrtype: RRType::Ptr, class: rec.class };
		let cached = CachedRecord { data: rec.data.clone(), ttl: rec.ttl, receipt: now, cache_flush: rec.cache_flush };
		cache.insert(key, cached, true);

		let first_seen = !instances.contains_key(&target.upper_key());

		let instance = instances.entry(target.upper_key()).or_insert_with(|| ServiceInstance::new(target.clone(), tracked.clone()));

		if let Some((sub, _)) = rec.name.strip_subtype() {
			instance.subtypes.insert(String::from_utf8_lossy(&sub).to_ascii_uppercase());
		}

		if first_seen {
			result.discovered.push(target.clone());
		}
	}

	// Pass 2: SRV/TXT — attach to the instance whose name matches (case-insensitive).
	for rec in records {
		match rec.rrtype {
			RRType::Srv | RRType::Txt => {}
			_ => continue,
		}

		let Some(instance) = instances.get_mut(&rec.name.upper_key()) else { continue };

		let key = RecordKey { name: rec.name.clone(), rrtype: rec.rrtype, class: rec.class };
		let cached = CachedRecord { data: rec.data.clone(), ttl: rec.ttl, receipt: now, cache_flush: rec.cache_flush };
		let outcome = cache.insert(key, cached, allow_multiple_srv_per_host && rec.rrtype == RRType::Srv);

		match &rec.data {
			RData::Srv { port, target, .. } => {
				if outcome != InsertOutcome::Refreshed {
					instance.host = Some(target.clone());
					instance.port = Some(*port);
					result.modified.push(instance.instance_name.clone());
				}
			}
			RData::Txt(entries) => {
				if outcome != InsertOutcome::Refreshed {
					instance.txt = entries.clone();
					result.modified.push(instance.instance_name.clone());
				}
			}
			_ => {}
		}
	}

	// Pass 3: addresses, cache-flush-drop-then-add.
	for rec in records {
		match rec.rrtype {
			RRType::A | RRType::Aaaa => {}
			_ => continue,
		}

		if rec.cache_flush {
			for instance_key in hosts_matching(instances, &rec.name) {
				if let Some(instance) = instances.get_mut(&instance_key) {
					match rec.rrtype {
						RRType::A => instance.ipv4.clear(),
						RRType::Aaaa => instance.ipv6.clear(),
						_ => unreachable!(),
					}
				}

				if !allow_multiple_srv_per_host {
					break;
				}
			}
		}

		let key = RecordKey { name: rec.name.clone(), rrtype: rec.rrtype, class: rec.class };
		let cached = CachedRecord { data: rec.data.clone(), ttl: rec.ttl, receipt: now, cache_flush: rec.cache_flush };
		let outcome = cache.insert(key, cached, true);

		if outcome == InsertOutcome::Refreshed {
			continue;
		}

		for instance_key in hosts_matching(instances, &rec.name) {
			let Some(instance) = instances.get_mut(&instance_key) else { continue };

			match (&rec.rrtype, &rec.data) {
				(RRType::A, RData::A(addr)) if !instance.ipv4.contains(addr) => instance.ipv4.push(*addr),
				(RRType::Aaaa, RData::Aaaa(addr)) if !instance.ipv6.contains(addr) => instance.ipv6.push(*addr),
				_ => continue,
			}

			result.modified.push(instance.instance_name.clone());

			if !allow_multiple_srv_per_host {
				break;
			}
		}
	}

	result
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wire::TxtEntry;

	fn ptr(owner: &str, target: &str, ttl: u32) -> Record {
		Record { name: Name::from_ascii(owner), rrtype: RRType::Ptr, class: CLASS_IN, cache_flush: false, ttl, data: RData::Ptr(Name::from_ascii(target)) }
	}

	fn srv(owner: &str, host: &str, port: u16, ttl: u32) -> Record {
		Record {
			name: Name::from_ascii(owner),
			rrtype: RRType::Srv,
			class: CLASS_IN,
			cache_flush: true,
			ttl,
			data: RData::Srv { priority: 0, weight: 0, port, target: Name::from_ascii(host) },
		}
	}

	fn txt(owner: &str, entries: &[&[u8]], ttl: u32) -> Record {
		Record {
			name: Name::from_ascii(owner),
			rrtype: RRType::Txt,
			class: CLASS_IN,
			cache_flush: true,
			ttl,
			data: RData::Txt(entries.iter().map(|e| TxtEntry(e.to_vec())).collect()),
		}
	}

	fn a(owner: &str, addr: Ipv4Addr, ttl: u32, cache_flush: bool) -> Record {
		Record { name: Name::from_ascii(owner), rrtype: RRType::A, class: CLASS_IN, cache_flush, ttl, data: RData::A(addr) }
	}

	#[test]
	fn simple_ptr_srv_txt_a_completes_in_one_pass() {
		let tracked = Name::from_ascii("_testtype._tcp.local");
		let records = vec![
			ptr("_testtype._tcp.local", "inst._testtype._tcp.local", 120),
			srv("inst._testtype._tcp.local", "h.local", 8009, 120),
			txt("inst._testtype._tcp.local", &[b"id=1"], 120),
			a("h.local", Ipv4Addr::new(10, 0, 0, 5), 120, false),
		];

		let mut cache = Cache::new();
		let mut instances = HashMap::new();

		let result = augment(&records, &mut cache, &mut instances, &tracked, &[], 0, false);

		assert_eq!(result.modified.len(), 3);

		let inst = instances.get("INST._TESTTYPE._TCP.LOCAL").unwrap();
		assert!(inst.is_complete());
		assert_eq!(inst.port, Some(8009));
		assert_eq!(inst.ipv4, vec![Ipv4Addr::new(10, 0, 0, 5)]);
	}

	#[test]
	fn cache_flush_address_replaces_rather_than_accumulates() {
		let tracked = Name::from_ascii("_testtype._tcp.local");

		let mut cache = Cache::new();
		let mut instances = HashMap::new();

		let initial = vec![
			ptr("_testtype._tcp.local", "inst._testtype._tcp.local", 120),
			srv("inst._testtype._tcp.local", "h.local", 8009, 120),
			txt("inst._testtype._tcp.local", &[b"id=1"], 120),
			a("h.local", Ipv4Addr::new(10, 0, 0, 5), 120, false),
		];
		augment(&initial, &mut cache, &mut instances, &tracked, &[], 0, false);

		let update = vec![a("h.local", Ipv4Addr::new(10, 0, 0, 6), 120, true)];
		let result = augment(&update, &mut cache, &mut instances, &tracked, &[], 10_000, false);

		assert_eq!(result.modified, vec![Name::from_ascii("inst._testtype._tcp.local")]);

		let inst = instances.get("INST._TESTTYPE._TCP.LOCAL").unwrap();
		assert_eq!(inst.ipv4, vec![Ipv4Addr::new(10, 0, 0, 6)]);
	}

	#[test]
	fn subtype_ptr_is_tracked_via_suffix_match() {
		let tracked = Name::from_ascii("_printer._tcp.local");
		let color = Name::with_subtype(&tracked, b"_color");

		let records = vec![ptr("_color._sub._printer._tcp.local", "inst._printer._tcp.local", 120)];

		let mut cache = Cache::new();
		let mut instances = HashMap::new();

		let result = augment(&records, &mut cache, &mut instances, &tracked, std::slice::from_ref(&color), 0, false);

		assert_eq!(result.discovered.len(), 1);
		let inst = instances.get("INST._PRINTER._TCP.LOCAL").unwrap();
		assert!(inst.subtypes.contains("_COLOR"));
	}
}
