//! Configuration (§6): every numeric tunable and feature toggle as fields of a single
//! value injected at construction, per Design Note "Per-class mutable global tunables
//! ... -> a single Config value" — no process-global statics anywhere in this crate.

use std::time::Duration;

/// The §6 tunables table. All fields are public and `Config::default()` reproduces the
/// defaults in that table; callers override individual fields with struct-update syntax.
#[derive(Debug, Clone)]
pub struct Config {
	/// N_B: queries per burst in active/aggressive mode.
	pub queries_per_burst: u32,
	/// N_BP: queries per burst in passive mode, after the first.
	pub queries_per_burst_passive: u32,
	/// t_q: gap between queries within an active/passive burst.
	pub time_between_queries_in_burst: Duration,
	/// t_B: initial gap between active-mode bursts.
	pub initial_time_between_bursts: Duration,
	/// t_Bcap: steady-state gap between bursts (active cap, passive constant).
	pub time_between_bursts: Duration,
	/// t_r: gap between retransmissions within an aggressive burst (~DTIM-aligned).
	pub time_between_retransmission_queries_in_burst: Duration,
	pub initial_aggressive_time_between_bursts: Duration,
	pub max_time_between_aggressive_bursts: Duration,
	/// N_backoff: queries allowed in a burst before back-off may apply.
	pub num_queries_before_backoff: u32,
	/// How long a service-type client's cache is kept once its last listener leaves.
	pub cached_services_retention: Duration,
	/// Bound on a per-socket outbound packet queue before oldest-drop kicks in.
	pub packet_queue_max_size: usize,
	/// Budget for joining receiver threads on shutdown.
	pub thread_join_timeout: Duration,
	pub features: FeatureToggles,
}

/// The §6 boolean toggles.
#[derive(Debug, Clone, Copy)]
pub struct FeatureToggles {
	pub unicast_reply_enabled: bool,
	pub aggressive_query_mode_enabled: bool,
	pub known_answer_suppression_enabled: bool,
	pub query_with_known_answer_enabled: bool,
	pub avoid_advertising_empty_txt: bool,
	pub expired_services_removal_enabled: bool,
	pub cached_services_removal_enabled: bool,
	pub allow_multiple_srv_per_host: bool,
	pub limit_label_count: bool,
	pub include_inet_address_records_in_probing: bool,
}

impl Default for FeatureToggles {
	fn default() -> FeatureToggles {
		FeatureToggles {
			unicast_reply_enabled: true,
			aggressive_query_mode_enabled: true,
			known_answer_suppression_enabled: true,
			query_with_known_answer_enabled: true,
			avoid_advertising_empty_txt: true,
			expired_services_removal_enabled: true,
			cached_services_removal_enabled: true,
			allow_multiple_srv_per_host: false,
			limit_label_count: true,
			include_inet_address_records_in_probing: true,
		}
	}
}

impl Default for Config {
	fn default() -> Config {
		Config {
			queries_per_burst: 3,
			queries_per_burst_passive: 1,
			time_between_queries_in_burst: Duration::from_millis(500),
			initial_time_between_bursts: Duration::from_millis(15_000),
			time_between_bursts: Duration::from_millis(60_000),
			time_between_retransmission_queries_in_burst: Duration::from_millis(100),
			initial_aggressive_time_between_bursts: Duration::from_millis(1_000),
			max_time_between_aggressive_bursts: Duration::from_millis(60_000),
			num_queries_before_backoff: 3,
			cached_services_retention: Duration::from_millis(10_000),
			packet_queue_max_size: 2048,
			thread_join_timeout: Duration::from_millis(1_000),
			features: FeatureToggles::default(),
		}
	}
}

/// A query-pacing mode (§4.4): each scales burst size and inter-burst gap differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
	Active,
	Passive,
	Aggressive,
}

/// Per-listener search filters (§6).
#[derive(Debug, Clone)]
pub struct SearchOptions {
	pub network: Option<crate::socket::NetHandle>,
	pub interface_index: Option<u32>,
	pub subtypes: Vec<crate::name::Name>,
	pub resolve_instance_name: Option<crate::name::Name>,
	pub query_mode: QueryMode,
	pub always_unicast: bool,
	pub only_ipv6_on_ipv6_only: bool,
}

impl Default for SearchOptions {
	fn default() -> SearchOptions {
		SearchOptions {
			network: None,
			interface_index: None,
			subtypes: Vec::new(),
			resolve_instance_name: None,
			query_mode: QueryMode::Active,
			always_unicast: false,
			only_ipv6_on_ipv6_only: false,
		}
	}
}
