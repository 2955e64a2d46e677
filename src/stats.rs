use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Per-task counters, written by the task and read by the reporter
#[derive(Debug, Default)]
pub struct TaskCounters {
	/// KB/s of the most recent iteration
	speed_kbps: AtomicU64,
	total_bytes: AtomicU64,
}

impl TaskCounters {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record one drained response body and return its speed in KB/s.
	pub fn record(&self, bytes: u64, elapsed: Duration) -> u64 {
		let speed = speed_kbps(bytes, elapsed);
		self.speed_kbps.store(speed, Ordering::Relaxed);
		self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
		speed
	}

	pub fn speed_kbps(&self) -> u64 {
		self.speed_kbps.load(Ordering::Relaxed)
	}

	pub fn total_bytes(&self) -> u64 {
		self.total_bytes.load(Ordering::Relaxed)
	}
}

/// KB/s over whole seconds, plus one so sub-second transfers do not divide
/// by zero.
pub fn speed_kbps(bytes: u64, elapsed: Duration) -> u64 {
	(bytes / 1024) / (elapsed.as_secs() + 1)
}

/// Convert KB/s to Mbit/s.
pub fn kbps_to_mbps(kbps: u64) -> u64 {
	kbps * 8 / 1024
}

/// Format a byte count with 1024-based units (e.g. "1.50MB").
pub fn format_bytes(bytes: u64) -> String {
	const KB: u64 = 1 << 10;
	const MB: u64 = 1 << 20;
	const GB: u64 = 1 << 30;
	const TB: u64 = 1 << 40;

	match bytes {
		b if b >= TB => format!("{:.2}TB", b as f64 / TB as f64),
		b if b >= GB => format!("{:.2}GB", b as f64 / GB as f64),
		b if b >= MB => format!("{:.2}MB", b as f64 / MB as f64),
		b if b >= KB => format!("{:.2}KB", b as f64 / KB as f64),
		b => format!("{}B", b),
	}
}

/// Aggregate read by the reporter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
	pub speed_kbps: u64,
	pub total_bytes: u64,
}

impl Snapshot {
	pub fn speed_mbps(&self) -> u64 {
		kbps_to_mbps(self.speed_kbps)
	}
}

/// Totals for one edge address across rounds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdgeTotals {
	pub tasks: u64,
	pub bytes: u64,
}

#[derive(Default)]
struct BoardState {
	current: Vec<(IpAddr, Arc<TaskCounters>)>,
	retired_bytes: u64,
	edges: BTreeMap<IpAddr, EdgeTotals>,
}

/// Shared view of every task's counters.
///
/// The current round's counters live under a lock together with the bytes
/// of retired rounds, so the cumulative total never goes backwards.
#[derive(Default)]
pub struct ThroughputBoard {
	state: Mutex<BoardState>,
}

impl ThroughputBoard {
	pub fn new() -> Self {
		Self::default()
	}

	/// Retire the previous round and start tracking `tasks`.
	pub fn begin_round(&self, tasks: Vec<(IpAddr, Arc<TaskCounters>)>) {
		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		let previous = std::mem::replace(&mut state.current, tasks);
		for (ip, counters) in previous {
			let bytes = counters.total_bytes();
			state.retired_bytes += bytes;
			let edge = state.edges.entry(ip).or_default();
			edge.tasks += 1;
			edge.bytes += bytes;
		}
	}

	pub fn snapshot(&self) -> Snapshot {
		let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		let mut snapshot = Snapshot { speed_kbps: 0, total_bytes: state.retired_bytes };
		for (_, counters) in &state.current {
			snapshot.speed_kbps += counters.speed_kbps();
			snapshot.total_bytes += counters.total_bytes();
		}
		snapshot
	}

	/// Per-edge totals including the round in progress, busiest first
	pub fn edge_summary(&self) -> Vec<(IpAddr, EdgeTotals)> {
		let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		let mut edges = state.edges.clone();
		for (ip, counters) in &state.current {
			let edge = edges.entry(*ip).or_default();
			edge.tasks += 1;
			edge.bytes += counters.total_bytes();
		}
		let mut summary: Vec<(IpAddr, EdgeTotals)> = edges.into_iter().collect();
		summary.sort_by(|a, b| b.1.bytes.cmp(&a.1.bytes).then(a.0.cmp(&b.0)));
		summary
	}
}
