//! The record cache (C3): per-(socket, service-type) store of responses, with TTL
//! expiration and RFC 6762 §10.2 cache-flush semantics.

use std::collections::HashMap;
use std::time::Duration;

use crate::name::Name;
use crate::wire::{RData, RRType};

/// Milliseconds on the event loop's monotonic clock, per §3's `receipt-time (monotonic ms)`.
pub type Millis = u64;

/// One constituent record backing a [`crate::model::ServiceInstance`] (§3).
#[derive(Debug, Clone)]
pub struct CachedRecord {
	pub data: RData,
	pub ttl: u32,
	pub receipt: Millis,
	pub cache_flush: bool,
}

impl CachedRecord {
	/// `max(0, receipt + TTL*1000 - now)` (§3).
	pub fn remaining_ttl(&self, now: Millis) -> Millis {
		let expiry = self.receipt + self.ttl as Millis * 1000;
		expiry.saturating_sub(now)
	}

	/// Renewal is due once half the TTL has elapsed (§3, used by §4.4's back-off and
	/// §4.4's known-answer-suppression "remaining TTL > 50%" test).
	pub fn needs_renewal(&self, now: Millis) -> bool {
		self.remaining_ttl(now) <= (self.ttl as Millis * 1000) / 2
	}

	pub fn above_half_ttl(&self, now: Millis) -> bool {
		!self.needs_renewal(now)
	}

	pub fn is_expired(&self, now: Millis) -> bool {
		self.remaining_ttl(now) == 0
	}

	/// The goodbye-packet convention: a record announced with TTL 0 (§3, §4.5 scenario 2).
	pub fn is_goodbye(&self) -> bool {
		self.ttl == 0
	}
}

/// A record's wire identity, used as the cache's sub-key within a (socket, service-type)
/// shard: (owner name, rrtype, rrclass) per §3's invariant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
	pub name: Name,
	pub rrtype: RRType,
	pub class: u16,
}

/// The 1-second cache-flush grace window (§3): older same-key records are not dropped
/// synchronously, they're given a revised 1-second expiry so an in-flight read of them
/// (e.g. a send already queued) still observes a coherent, if short-lived, value.
const CACHE_FLUSH_GRACE: Duration = Duration::from_secs(1);

/// One (socket, service-type) shard of the cache (§4.3).
#[derive(Default)]
pub struct Cache {
	records: HashMap<RecordKey, Vec<CachedRecord>>,
}

/// What happened to a [`RecordKey`]'s record set on insertion, as distinguished by
/// `has_identical_record` (§4.2): the caller uses this to decide "modified" vs. "only
/// receipt-time advanced".
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
	/// No prior record existed for this key.
	Inserted,
	/// A record with identical data already existed; only its receipt time advanced.
	Refreshed,
	/// A record existed but its data differs from the new one.
	Changed,
}

impl Cache {
	pub fn new() -> Cache {
		Cache::default()
	}

	/// Insert or update a record for `key`. When `allow_multiple` is false (the default;
	/// `allow_multiple_srv_per_host` toggles it for SRV), a non-identical record with the
	/// same key replaces rather than accumulates (§9's multi-SRV open question: replacement
	/// is the default unless the toggle says otherwise).
	pub fn insert(&mut self, key: RecordKey, record: CachedRecord, allow_multiple: bool) -> InsertOutcome {
		if record.cache_flush {
			self.apply_cache_flush(&key, record.receipt);
		}

		let bucket = self.records.entry(key).or_default();
		Self::insert_into(bucket, record, allow_multiple)
	}

	fn insert_into(bucket: &mut Vec<CachedRecord>, record: CachedRecord, allow_multiple: bool) -> InsertOutcome {
		if let Some(existing) = bucket.iter_mut().find(|r| Self::data_eq(&r.data, &record.data)) {
			existing.receipt = record.receipt;
			existing.ttl = record.ttl;
			existing.cache_flush = record.cache_flush;
			return InsertOutcome::Refreshed;
		}

		if allow_multiple || bucket.is_empty() {
			bucket.push(record);
		} else {
			*bucket = vec![record];
		}

		InsertOutcome::Changed
	}

	fn data_eq(a: &RData, b: &RData) -> bool {
		use RData::*;

		match (a, b) {
			(A(x), A(y)) => x == y,
			(Aaaa(x), Aaaa(y)) => x == y,
			(Ptr(x), Ptr(y)) => x == y,
			(Srv { priority: p1, weight: w1, port: po1, target: t1 }, Srv { priority: p2, weight: w2, port: po2, target: t2 }) => {
				p1 == p2 && w1 == w2 && po1 == po2 && t1 == t2
			}
			(Txt(x), Txt(y)) => x == y,
			(Other(x), Other(y)) => x == y,
			_ => false,
		}
	}

	/// RFC 6762 §10.2: records of `key` received more than 1 s before `now` get their
	/// expiry pulled forward to `now + 1s`, rather than being removed outright.
	fn apply_cache_flush(&mut self, key: &RecordKey, now: Millis) {
		if let Some(bucket) = self.records.get_mut(key) {
			let grace_ms = CACHE_FLUSH_GRACE.as_millis() as Millis;

			for record in bucket.iter_mut() {
				if now.saturating_sub(record.receipt) > grace_ms {
					record.receipt = now;
					record.ttl = 1;
				}
			}
		}
	}

	pub fn get(&self, key: &RecordKey) -> &[CachedRecord] {
		self.records.get(key).map_or(&[], |v| v.as_slice())
	}

	pub fn iter(&self) -> impl Iterator<Item = (&RecordKey, &[CachedRecord])> {
		self.records.iter().map(|(k, v)| (k, v.as_slice()))
	}

	/// Drop expired records and return the keys whose bucket became empty, so the caller
	/// (the service-type client) can recompute instance completeness (§4.3).
	pub fn sweep_expired(&mut self, now: Millis) -> Vec<RecordKey> {
		let mut emptied = Vec::new();

		self.records.retain(|key, bucket| {
			bucket.retain(|r| !r.is_expired(now));

			if bucket.is_empty() {
				emptied.push(key.clone());
				false
			} else {
				true
			}
		});

		emptied
	}

	/// Records still above 50% of their original TTL, for known-answer suppression (§4.4).
	pub fn records_above_half_ttl(&self, now: Millis) -> Vec<(RecordKey, CachedRecord)> {
		self.records
			.iter()
			.flat_map(|(key, bucket)| bucket.iter().filter(|r| r.above_half_ttl(now)).map(move |r| (key.clone(), r.clone())))
			.collect()
	}

	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}

	pub fn len(&self) -> usize {
		self.records.values().map(Vec::len).sum()
	}
}

#[cfg(test)]
mod tests {
	use std::net::Ipv4Addr;

	use super::*;

	fn key(name: &str, rrtype: RRType) -> RecordKey {
		RecordKey { name: Name::from_ascii(name), rrtype, class: 1 }
	}

	fn a_record(addr: Ipv4Addr, ttl: u32, receipt: Millis) -> CachedRecord {
		CachedRecord { data: RData::A(addr), ttl, receipt, cache_flush: false }
	}

	#[test]
	fn remaining_ttl_decays_and_floors_at_zero() {
		let r = a_record(Ipv4Addr::new(10, 0, 0, 1), 120, 1_000);
		assert_eq!(r.remaining_ttl(1_000), 120_000);
		assert_eq!(r.remaining_ttl(1_000 + 60_000), 60_000);
		assert_eq!(r.remaining_ttl(1_000 + 999_000), 0);
	}

	#[test]
	fn identical_insert_refreshes_rather_than_changes() {
		let mut cache = Cache::new();
		let k = key("h.local", RRType::A);

		let outcome = cache.insert(k.clone(), a_record(Ipv4Addr::new(10, 0, 0, 1), 120, 0), false);
		assert_eq!(outcome, InsertOutcome::Changed);

		let outcome = cache.insert(k.clone(), a_record(Ipv4Addr::new(10, 0, 0, 1), 120, 5_000), false);
		assert_eq!(outcome, InsertOutcome::Refreshed);
		assert_eq!(cache.get(&k).len(), 1);
		assert_eq!(cache.get(&k)[0].receipt, 5_000);
	}

	#[test]
	fn cache_flush_expires_stale_records_within_one_second() {
		let mut cache = Cache::new();
		let k = key("h.local", RRType::A);

		cache.insert(k.clone(), a_record(Ipv4Addr::new(10, 0, 0, 1), 120, 0), true);

		let flushing = CachedRecord { cache_flush: true, ..a_record(Ipv4Addr::new(10, 0, 0, 2), 120, 10_000) };
		cache.insert(k.clone(), flushing, true);

		let bucket = cache.get(&k);
		let old = bucket.iter().find(|r| matches!(r.data, RData::A(a) if a == Ipv4Addr::new(10, 0, 0, 1))).unwrap();
		assert_eq!(old.remaining_ttl(10_500), 500);
	}

	#[test]
	fn sweep_expired_removes_empty_buckets() {
		let mut cache = Cache::new();
		let k = key("h.local", RRType::A);

		cache.insert(k.clone(), a_record(Ipv4Addr::new(10, 0, 0, 1), 1, 0), false);

		let emptied = cache.sweep_expired(5_000);
		assert_eq!(emptied, vec![k]);
		assert!(cache.is_empty());
	}
}
