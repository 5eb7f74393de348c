//! The query scheduler (C4, §4.4): a pure pacing state machine. It owns no I/O and no
//! timer primitives of its own — the service-type client drives it with `advance` and
//! schedules the returned delay using whatever timer primitive its caller (the
//! discovery manager's actor) has on hand, matching wireguard's `Timers` being plain
//! data poked by an actor method rather than a timer object itself.

use std::time::Duration;

use rand::Rng;

use crate::config::{Config, QueryMode};

/// A minimum floor under any back-off delay, so a renewal deadline that already passed
/// (clock drift, a burst of simultaneous renewals) never schedules a near-instant retry.
const MIN_BACKOFF_DELAY: Duration = Duration::from_millis(1_000);

/// What the scheduler decided for the query about to be sent, plus how long to wait
/// before the *next* one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextQuery {
	pub txid: u16,
	/// Whether this query's questions should carry the QU bit (§4.4, §6 scenario 4).
	pub expect_unicast: bool,
	pub delay_until_next: Duration,
	/// True once back-off has kicked in: the caller may want to log this transition.
	pub backed_off: bool,
}

/// Per-(socket, service-type) pacing state (§4.4). `burst_index` counts bursts already
/// completed (0 while still inside the first burst); `query_index` counts queries sent
/// within the current burst.
#[derive(Debug, Clone)]
pub struct Scheduler {
	mode: QueryMode,
	burst_index: u32,
	query_index: u32,
	next_txid: u16,
}

fn doubling(base: Duration, exponent: u32, cap: Duration) -> Duration {
	let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
	base.saturating_mul(factor).min(cap)
}

impl Scheduler {
	/// A random starting transaction id (never 0), matching the DNS resolver's own
	/// `gen_id` convention — avoids every client in a process picking the same first id.
	pub fn new(mode: QueryMode) -> Scheduler {
		let mut id: u16 = rand::thread_rng().gen();
		if id == 0 {
			id = 1;
		}

		Scheduler { mode, burst_index: 0, query_index: 0, next_txid: id }
	}

	pub fn mode(&self) -> QueryMode {
		self.mode
	}

	/// Switch pacing mode (e.g. a newly registered listener asks for Aggressive while
	/// others only asked for Active), restarting the burst/query counters — §4.5's
	/// "(re)start the scheduler using the union of all listeners' options".
	pub fn set_mode(&mut self, mode: QueryMode) {
		if self.mode != mode {
			self.mode = mode;
			self.burst_index = 0;
			self.query_index = 0;
		}
	}

	fn alloc_txid(&mut self) -> u16 {
		let id = self.next_txid;
		self.next_txid = self.next_txid.wrapping_add(1);
		if self.next_txid == 0 {
			self.next_txid = 1;
		}
		id
	}

	fn burst_size(&self, cfg: &Config) -> u32 {
		match self.mode {
			QueryMode::Active | QueryMode::Aggressive => cfg.queries_per_burst,
			QueryMode::Passive => {
				if self.burst_index == 0 {
					cfg.queries_per_burst
				} else {
					cfg.queries_per_burst_passive
				}
			}
		}
	}

	fn intra_burst_gap(&self, cfg: &Config) -> Duration {
		match self.mode {
			QueryMode::Active | QueryMode::Passive => cfg.time_between_queries_in_burst,
			// The first two queries of an aggressive burst go back-to-back (§4.4).
			QueryMode::Aggressive => {
				if self.query_index == 0 {
					Duration::ZERO
				} else {
					cfg.time_between_retransmission_queries_in_burst
				}
			}
		}
	}

	/// The gap before starting burst `self.burst_index` (already advanced past the burst
	/// that just finished), per §8's three pacing formulas.
	fn inter_burst_delay(&self, cfg: &Config) -> Duration {
		let k = self.burst_index;

		match self.mode {
			QueryMode::Active => doubling(cfg.initial_time_between_bursts, k.saturating_sub(1), cfg.time_between_bursts),
			QueryMode::Passive => cfg.time_between_bursts,
			QueryMode::Aggressive => doubling(cfg.initial_aggressive_time_between_bursts, k.saturating_sub(1), cfg.max_time_between_aggressive_bursts),
		}
	}

	fn expect_unicast(&self, always_unicast: bool) -> bool {
		match self.mode {
			// Aggressive mode always asks for a unicast reply on the first query of a burst.
			QueryMode::Aggressive if self.query_index == 0 => true,
			_ => always_unicast,
		}
	}

	fn in_backoff(&self, cfg: &Config) -> bool {
		self.burst_index > 0 && self.query_index > cfg.num_queries_before_backoff
	}

	/// Produce the next query's transaction id and unicast bit, and decide the delay
	/// before the query after that (§4.4). `always_unicast` comes from the union of
	/// registered listeners' search options; `earliest_renewal` is the smallest
	/// half-TTL renewal deadline among cached records, if back-off should align to it.
	pub fn advance(&mut self, cfg: &Config, always_unicast: bool, earliest_renewal: Option<Duration>) -> NextQuery {
		let txid = self.alloc_txid();
		let expect_unicast = self.expect_unicast(always_unicast);
		let backed_off = self.in_backoff(cfg);

		let burst_size = self.burst_size(cfg).max(1);

		let delay = if backed_off {
			earliest_renewal.unwrap_or_else(|| self.inter_burst_delay(cfg)).max(MIN_BACKOFF_DELAY)
		} else {
			let gap = self.intra_burst_gap(cfg);
			self.query_index += 1;

			if self.query_index < burst_size {
				gap
			} else {
				self.query_index = 0;
				self.burst_index += 1;
				self.inter_burst_delay(cfg)
			}
		};

		NextQuery { txid, expect_unicast, delay_until_next: delay, backed_off }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn run_bursts(mode: QueryMode, cfg: &Config, bursts: usize) -> Vec<Duration> {
		let mut s = Scheduler::new(mode);
		let mut inter_burst_gaps = Vec::new();
		let burst_size = match mode {
			QueryMode::Active | QueryMode::Aggressive => cfg.queries_per_burst,
			QueryMode::Passive => cfg.queries_per_burst,
		};

		for burst in 0..bursts {
			let size = if mode == QueryMode::Passive && burst > 0 { cfg.queries_per_burst_passive } else { burst_size };

			for i in 0..size {
				let next = s.advance(cfg, false, None);
				if i + 1 == size {
					inter_burst_gaps.push(next.delay_until_next);
				}
			}
		}

		inter_burst_gaps
	}

	#[test]
	fn active_mode_doubles_until_cap() {
		let cfg = Config::default();
		let gaps = run_bursts(QueryMode::Active, &cfg, 4);

		assert_eq!(gaps[0], cfg.initial_time_between_bursts);
		assert_eq!(gaps[1], cfg.initial_time_between_bursts * 2);
		assert_eq!(gaps[2], cfg.time_between_bursts); // 4x would exceed cap (60s)
		assert_eq!(gaps[3], cfg.time_between_bursts);
	}

	#[test]
	fn passive_mode_is_constant_after_first_burst() {
		let cfg = Config::default();
		let gaps = run_bursts(QueryMode::Passive, &cfg, 3);

		assert!(gaps.iter().all(|&g| g == cfg.time_between_bursts));
	}

	#[test]
	fn aggressive_mode_doubles_from_one_second() {
		let cfg = Config::default();
		let gaps = run_bursts(QueryMode::Aggressive, &cfg, 4);

		assert_eq!(gaps[0], Duration::from_millis(1_000));
		assert_eq!(gaps[1], Duration::from_millis(2_000));
		assert_eq!(gaps[2], Duration::from_millis(4_000));
		assert_eq!(gaps[3], Duration::from_millis(8_000));
	}

	#[test]
	fn aggressive_first_two_queries_are_back_to_back() {
		let cfg = Config::default();
		let mut s = Scheduler::new(QueryMode::Aggressive);

		let first = s.advance(&cfg, false, None);
		assert!(first.expect_unicast);
		assert_eq!(first.delay_until_next, Duration::ZERO);
	}

	#[test]
	fn txid_never_reuses_zero() {
		let mut s = Scheduler::new(QueryMode::Active);
		for _ in 0..(u16::MAX as u32 + 10) {
			assert_ne!(s.alloc_txid(), 0);
		}
	}

	#[test]
	fn backoff_aligns_to_renewal_deadline() {
		// Back-off only makes sense once a burst can outrun N_backoff queries, and only
		// from the second burst onward (§4.4: "burst_index > 0 and query_index > N_backoff").
		let cfg = Config { queries_per_burst: 5, num_queries_before_backoff: 2, ..Config::default() };
		let mut s = Scheduler::new(QueryMode::Active);

		// Burst 0: 5 queries, never backs off regardless of query_index.
		for _ in 0..5 {
			assert!(!s.advance(&cfg, false, None).backed_off);
		}

		// Burst 1: queries 0,1,2 (post-increment 1,2,3) stay under/at N_backoff; the 4th
		// push (query_index now 3 > 2) trips back-off.
		for _ in 0..3 {
			assert!(!s.advance(&cfg, false, None).backed_off);
		}

		let next = s.advance(&cfg, false, Some(Duration::from_millis(500)));
		assert!(next.backed_off);
		assert_eq!(next.delay_until_next, MIN_BACKOFF_DELAY);

		let next = s.advance(&cfg, false, Some(Duration::from_secs(30)));
		assert!(next.backed_off);
		assert_eq!(next.delay_until_next, Duration::from_secs(30));
	}
}
