use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use reqwest::Url;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::doh::DohClient;
use crate::download::{DownloadError, DownloadTask};
use crate::output;
use crate::stats::ThroughputBoard;
use crate::subnets::SubnetSampler;
use crate::transport::{DnsSettings, DownloadSettings, RunConfig, TransportSettings};

/// Pause before the next round when nothing was resolved or the round failed
const EMPTY_ROUND_PAUSE: Duration = Duration::from_secs(1);

/// Relaunch policy for tasks that panic
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
	pub max_restarts: u32,
	pub base: Duration,
	pub cap: Duration,
}

impl RestartPolicy {
	pub fn new(max_restarts: u32) -> Self {
		Self {
			max_restarts,
			base: Duration::from_millis(500),
			cap: Duration::from_secs(30),
		}
	}

	/// Delay before restart number `attempt` (0-based)
	pub fn backoff(&self, attempt: u32) -> Duration {
		let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
		self.base.saturating_mul(factor).min(self.cap)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorOutcome {
	Completed,
	/// The task returned an error; it is not relaunched
	Aborted,
	Cancelled,
	GaveUp { restarts: u32 },
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		s.to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"non-string panic payload".to_string()
	}
}

/// Run a task to completion, relaunching it with exponential backoff when
/// it panics, at most `policy.max_restarts` times.
pub async fn supervise<F, Fut>(
	label: &str,
	policy: RestartPolicy,
	token: &CancellationToken,
	mut launch: F,
) -> SupervisorOutcome
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<(), DownloadError>> + Send + 'static,
{
	let mut restarts = 0;
	loop {
		match tokio::spawn(launch()).await {
			Ok(Ok(())) => return SupervisorOutcome::Completed,
			Ok(Err(DownloadError::Cancelled)) => return SupervisorOutcome::Cancelled,
			Ok(Err(e)) => {
				error!(task = %label, error = %e, "download aborted");
				return SupervisorOutcome::Aborted;
			}
			Err(join_err) if join_err.is_panic() => {
				let message = panic_message(join_err.into_panic().as_ref());
				if restarts >= policy.max_restarts {
					error!(task = %label, panic = %message, restarts, "download keeps panicking, giving up");
					return SupervisorOutcome::GaveUp { restarts };
				}
				let delay = policy.backoff(restarts);
				restarts += 1;
				warn!(task = %label, panic = %message, restart = restarts, delay = ?delay, "download panicked, relaunching");
				tokio::select! {
					biased;
					_ = token.cancelled() => return SupervisorOutcome::Cancelled,
					_ = tokio::time::sleep(delay) => {}
				}
			}
			Err(_) => return SupervisorOutcome::Cancelled,
		}
	}
}

/// Build `parallelism` tasks, handing out `ips` round-robin.
pub fn create_download_tasks<R: Rng>(
	url: &Url,
	ips: &[IpAddr],
	parallelism: usize,
	settings: &DownloadSettings,
	transport: &Arc<TransportSettings>,
	rng: &mut R,
) -> Result<Vec<Arc<DownloadTask>>, DownloadError> {
	if ips.is_empty() {
		return Ok(Vec::new());
	}
	(0..parallelism)
		.map(|i| {
			DownloadTask::new(url.clone(), ips[i % ips.len()], settings, transport.clone(), rng)
				.map(Arc::new)
		})
		.collect()
}

/// Keep the first occurrence of every address.
pub fn dedup_in_order(ips: impl IntoIterator<Item = IpAddr>) -> Vec<IpAddr> {
	let mut seen = HashSet::new();
	ips.into_iter().filter(|ip| seen.insert(*ip)).collect()
}

/// Print the aggregate throughput every `interval` until cancelled.
pub fn spawn_reporter(board: Arc<ThroughputBoard>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(interval);
		ticker.tick().await;
		loop {
			tokio::select! {
				_ = token.cancelled() => break,
				_ = ticker.tick() => output::print_throughput(&board.snapshot()),
			}
		}
	})
}

/// What one round did
#[derive(Debug, Clone, Default)]
pub struct RoundSummary {
	pub url: String,
	pub subnets: usize,
	pub ips: Vec<IpAddr>,
	pub completed: usize,
	pub aborted: usize,
	pub gave_up: usize,
}

/// The resolve-then-download loop
pub struct Orchestrator {
	config: RunConfig,
	sampler: SubnetSampler,
	clients: Vec<Arc<DohClient>>,
	board: Arc<ThroughputBoard>,
	rng: StdRng,
}

impl Orchestrator {
	pub fn new(config: RunConfig, sampler: SubnetSampler) -> Result<Self> {
		if config.targets.is_empty() {
			return Err(anyhow!("no target URL to download"));
		}
		if config.dns.servers.is_empty() {
			return Err(anyhow!("no DoH server configured"));
		}
		let clients = config.dns.servers.iter()
			.map(|server| {
				DohClient::new(server, config.dns.method, config.transport.clone())
					.map(Arc::new)
					.map_err(|e| anyhow!("{}", e))
			})
			.collect::<Result<Vec<_>>>()?;

		let rng = match config.seed {
			Some(seed) => StdRng::seed_from_u64(seed),
			None => StdRng::from_entropy(),
		};

		Ok(Self {
			config,
			sampler,
			clients,
			board: Arc::new(ThroughputBoard::new()),
			rng,
		})
	}

	pub fn board(&self) -> Arc<ThroughputBoard> {
		self.board.clone()
	}

	/// Loop over rounds until `token` is cancelled. A failed round is logged
	/// and followed by a short pause; it never ends the run. The reporter is
	/// started once for the whole run.
	pub async fn run(&mut self, token: CancellationToken) -> Result<()> {
		let reporter = spawn_reporter(self.board.clone(), self.config.report_interval, token.clone());

		let mut round = 0u64;
		while !token.is_cancelled() {
			round += 1;
			let pause = match self.run_round(&token.child_token()).await {
				Ok(summary) => {
					info!(
						round,
						url = %summary.url,
						subnets = summary.subnets,
						edges = summary.ips.len(),
						completed = summary.completed,
						aborted = summary.aborted,
						gave_up = summary.gave_up,
						"round finished"
					);
					if summary.ips.is_empty() {
						warn!(url = %summary.url, "no edge resolved, retrying");
					}
					summary.ips.is_empty()
				}
				Err(e) => {
					warn!(round, error = %format!("{:#}", e), "round failed");
					true
				}
			};
			if pause && !token.is_cancelled() {
				tokio::select! {
					_ = token.cancelled() => {}
					_ = tokio::time::sleep(EMPTY_ROUND_PAUSE) => {}
				}
			}
		}

		token.cancel();
		let _ = reporter.await;
		Ok(())
	}

	/// Resolve every subnet concurrently, each against a randomly chosen
	/// server, and return the distinct addresses in answer order.
	async fn resolve_subnets(&mut self, host: &str, subnets: &[String], token: &CancellationToken) -> Vec<IpAddr> {
		let dns: &DnsSettings = &self.config.dns;
		let lookups: Vec<_> = subnets.iter()
			.map(|subnet| {
				let client = self.clients[self.rng.gen_range(0..self.clients.len())].clone();
				let query = dns.query_config(host, subnet, client.server());
				async move {
					let result = client.resolve(&query, token).await;
					(query, result)
				}
			})
			.collect();

		let mut resolved = Vec::new();
		for (query, result) in join_all(lookups).await {
			let subnet = query.edns.client_subnet.as_deref().unwrap_or_default();
			match result {
				Ok(ips) => {
					debug!(subnet, server = %query.server, count = ips.len(), "resolved");
					resolved.extend(ips);
				}
				Err(e) => warn!(subnet, server = %query.server, error = %e, "DoH query failed"),
			}
		}
		dedup_in_order(resolved)
	}

	/// One round: sample, resolve, fan out, wait.
	pub async fn run_round(&mut self, token: &CancellationToken) -> Result<RoundSummary> {
		let url = self.config.targets.choose(&mut self.rng)
			.cloned()
			.ok_or_else(|| anyhow!("no target URL to download"))?;
		let host = url.host_str()
			.ok_or_else(|| anyhow!("URL {} has no host", url))?
			.trim_start_matches('[')
			.trim_end_matches(']')
			.to_string();

		let subnets = self.sampler.sample(self.config.parallelism, &mut self.rng)
			.with_context(|| format!("sampling subnets from {}", self.sampler.describe()))?;

		let mut summary = RoundSummary {
			url: url.to_string(),
			subnets: subnets.len(),
			..RoundSummary::default()
		};

		summary.ips = self.resolve_subnets(&host, &subnets, token).await;
		if summary.ips.is_empty() {
			return Ok(summary);
		}

		let tasks = create_download_tasks(
			&url,
			&summary.ips,
			self.config.parallelism,
			&self.config.download,
			&self.config.transport,
			&mut self.rng,
		).map_err(|e| anyhow!("{}", e))?;
		self.board.begin_round(tasks.iter().map(|t| (t.remote().ip(), t.counters())).collect());

		let policy = RestartPolicy::new(self.config.download.max_restarts);
		let supervised = tasks.iter().map(|task| {
			let label = task.remote().to_string();
			let task = task.clone();
			async move {
				supervise(&label, policy, token, || {
					let task = task.clone();
					let token = token.clone();
					async move { task.run(&token).await }
				}).await
			}
		});

		for outcome in join_all(supervised).await {
			match outcome {
				SupervisorOutcome::Completed => summary.completed += 1,
				SupervisorOutcome::Aborted => summary.aborted += 1,
				SupervisorOutcome::GaveUp { .. } => summary.gave_up += 1,
				SupervisorOutcome::Cancelled => {}
			}
		}
		Ok(summary)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::subnets::{EmbeddedCorpus, FileCorpus};
	use crate::test_support::{answer_with, LoopbackServer};
	use crate::transport::{EdnsRequest, ForwardedFor, HeaderFlags, HttpMethod, TlsIdentity, TlsSettings};
	use hickory_proto::rr::RecordType;
	use std::net::Ipv4Addr;
	use std::path::PathBuf;
	use std::sync::atomic::{AtomicU32, Ordering};
	use std::time::Instant;

	fn ip(s: &str) -> IpAddr {
		s.parse().unwrap()
	}

	fn download_settings() -> DownloadSettings {
		DownloadSettings {
			iterations: 1,
			referer: String::new(),
			forwarded_for: ForwardedFor::Off,
			post_body: None,
			tls: TlsIdentity::Standard(TlsSettings::default()),
			max_restarts: 2,
		}
	}

	fn run_config(target: &str, doh_port: u16, parallelism: usize, iterations: u32) -> RunConfig {
		RunConfig {
			targets: vec![Url::parse(target).unwrap()],
			parallelism,
			transport: Arc::new(TransportSettings {
				timeout: Duration::from_secs(5),
				..TransportSettings::default()
			}),
			dns: DnsSettings {
				servers: vec![format!("plain://127.0.0.1:{}/dns-query", doh_port)],
				method: HttpMethod::Get,
				record_types: vec![RecordType::A],
				class: 1,
				flags: HeaderFlags::default(),
				edns: EdnsRequest::default(),
			},
			download: DownloadSettings { iterations, ..download_settings() },
			subnet_file: None,
			report_interval: Duration::from_millis(20),
			seed: Some(1),
		}
	}

	fn two_subnets() -> SubnetSampler {
		SubnetSampler::new(Box::new(EmbeddedCorpus::new("1.2.3.0/24\n5.6.7.0/24\n")))
	}

	fn fast_policy(max_restarts: u32) -> RestartPolicy {
		RestartPolicy {
			max_restarts,
			base: Duration::from_millis(1),
			cap: Duration::from_millis(4),
		}
	}

	#[test]
	fn test_round_robin_distribution() {
		let url = Url::parse("https://cdn.example.com/file").unwrap();
		let ips = vec![ip("192.0.2.1"), ip("192.0.2.2"), ip("192.0.2.3")];
		let transport = Arc::new(TransportSettings::default());
		let mut rng = StdRng::seed_from_u64(1);
		let tasks = create_download_tasks(&url, &ips, 7, &download_settings(), &transport, &mut rng).unwrap();

		assert_eq!(tasks.len(), 7);
		for (i, task) in tasks.iter().enumerate() {
			assert_eq!(task.remote().ip(), ips[i % 3]);
			assert_eq!(task.remote().port(), 443);
		}
	}

	#[test]
	fn test_no_ips_no_tasks() {
		let url = Url::parse("https://cdn.example.com/file").unwrap();
		let transport = Arc::new(TransportSettings::default());
		let mut rng = StdRng::seed_from_u64(1);
		let tasks = create_download_tasks(&url, &[], 4, &download_settings(), &transport, &mut rng).unwrap();
		assert!(tasks.is_empty());
	}

	#[test]
	fn test_dedup_keeps_order() {
		let ips = vec![ip("192.0.2.2"), ip("192.0.2.1"), ip("192.0.2.2"), ip("2001:db8::1")];
		assert_eq!(dedup_in_order(ips), vec![ip("192.0.2.2"), ip("192.0.2.1"), ip("2001:db8::1")]);
	}

	#[test]
	fn test_backoff_doubles_and_caps() {
		let policy = RestartPolicy::new(5);
		assert_eq!(policy.backoff(0), Duration::from_millis(500));
		assert_eq!(policy.backoff(1), Duration::from_secs(1));
		assert_eq!(policy.backoff(3), Duration::from_secs(4));
		assert_eq!(policy.backoff(10), Duration::from_secs(30));
		assert_eq!(policy.backoff(40), Duration::from_secs(30));
	}

	#[tokio::test]
	async fn test_supervisor_gives_up_after_max_restarts() {
		let launches = Arc::new(AtomicU32::new(0));
		let counter = launches.clone();
		let outcome = supervise("panicky", fast_policy(3), &CancellationToken::new(), move || {
			let counter = counter.clone();
			async move {
				counter.fetch_add(1, Ordering::SeqCst);
				if counter.load(Ordering::SeqCst) < 100 {
					panic!("boom");
				}
				Ok(())
			}
		}).await;

		assert_eq!(outcome, SupervisorOutcome::GaveUp { restarts: 3 });
		assert_eq!(launches.load(Ordering::SeqCst), 4);
	}

	#[tokio::test]
	async fn test_supervisor_recovers_from_one_panic() {
		let launches = Arc::new(AtomicU32::new(0));
		let counter = launches.clone();
		let outcome = supervise("flaky", fast_policy(3), &CancellationToken::new(), move || {
			let counter = counter.clone();
			async move {
				if counter.fetch_add(1, Ordering::SeqCst) == 0 {
					panic!("first launch fails");
				}
				Ok(())
			}
		}).await;

		assert_eq!(outcome, SupervisorOutcome::Completed);
		assert_eq!(launches.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn test_supervisor_does_not_restart_errors() {
		let launches = Arc::new(AtomicU32::new(0));
		let counter = launches.clone();
		let outcome = supervise("failing", fast_policy(3), &CancellationToken::new(), move || {
			let counter = counter.clone();
			async move {
				counter.fetch_add(1, Ordering::SeqCst);
				Err(DownloadError::Client("nope".to_string()))
			}
		}).await;

		assert_eq!(outcome, SupervisorOutcome::Aborted);
		assert_eq!(launches.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn test_panic_message() {
		let payload: Box<dyn Any + Send> = Box::new("boom");
		assert_eq!(panic_message(payload.as_ref()), "boom");
		let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
		assert_eq!(panic_message(payload.as_ref()), "bang");
	}

	#[tokio::test]
	async fn test_round_resolves_and_downloads_from_edge() {
		let doh = LoopbackServer::start(|r| answer_with(r, &[Ipv4Addr::LOCALHOST])).await;
		let edge = LoopbackServer::fixed(200, vec![0u8; 1000]).await;
		let target = format!("http://edge.pinned.invalid:{}/blob", edge.addr.port());
		let config = run_config(&target, doh.addr.port(), 3, 2);
		let mut orchestrator = Orchestrator::new(config, two_subnets()).unwrap();

		let summary = orchestrator.run_round(&CancellationToken::new()).await.unwrap();
		assert_eq!(summary.url, target);
		assert_eq!(summary.subnets, 2);
		assert_eq!(summary.ips, vec![ip("127.0.0.1")]);
		assert_eq!(summary.completed, 3);
		assert_eq!(summary.aborted, 0);
		assert_eq!(summary.gave_up, 0);

		let queries = doh.requests();
		assert_eq!(queries.len(), 2);
		for query in &queries {
			let message = query.dns_message();
			assert_eq!(message.queries()[0].name().to_ascii().trim_end_matches('.'), "edge.pinned.invalid");
			assert!(message.extensions().is_some());
		}
		assert_eq!(edge.requests().len(), 6);
		assert_eq!(orchestrator.board().snapshot().total_bytes, 6000);
		assert_eq!(orchestrator.board().edge_summary()[0].1.tasks, 3);
	}

	#[tokio::test]
	async fn test_round_without_answers_downloads_nothing() {
		let doh = LoopbackServer::start(|r| answer_with(r, &[])).await;
		let edge = LoopbackServer::fixed(200, vec![0u8; 10]).await;
		let target = format!("http://edge.pinned.invalid:{}/blob", edge.addr.port());
		let mut orchestrator = Orchestrator::new(run_config(&target, doh.addr.port(), 2, 1), two_subnets()).unwrap();

		let summary = orchestrator.run_round(&CancellationToken::new()).await.unwrap();
		assert!(summary.ips.is_empty());
		assert_eq!(summary.completed, 0);
		assert!(edge.requests().is_empty());
	}

	#[tokio::test]
	async fn test_failed_rounds_do_not_end_run() {
		let missing = PathBuf::from(format!("/nonexistent/cidr-{}.txt", std::process::id()));
		let config = run_config("http://edge.pinned.invalid:9/blob", 9, 2, 1);
		let mut orchestrator = Orchestrator::new(config, SubnetSampler::new(Box::new(FileCorpus::new(missing)))).unwrap();
		assert!(orchestrator.run_round(&CancellationToken::new()).await.is_err());

		let token = CancellationToken::new();
		let stopper = token.clone();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(200)).await;
			stopper.cancel();
		});
		let started = Instant::now();
		let result = tokio::time::timeout(Duration::from_secs(5), orchestrator.run(token)).await;
		assert!(matches!(result, Ok(Ok(()))));
		assert!(started.elapsed() >= Duration::from_millis(200));
	}

	#[tokio::test]
	async fn test_run_accumulates_until_cancelled() {
		let doh = LoopbackServer::start(|r| answer_with(r, &[Ipv4Addr::LOCALHOST])).await;
		let edge = LoopbackServer::fixed(200, vec![0u8; 500]).await;
		let target = format!("http://edge.pinned.invalid:{}/blob", edge.addr.port());
		let mut orchestrator = Orchestrator::new(run_config(&target, doh.addr.port(), 2, 1), two_subnets()).unwrap();
		let board = orchestrator.board();

		let token = CancellationToken::new();
		let stopper = token.clone();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(300)).await;
			stopper.cancel();
		});
		let result = tokio::time::timeout(Duration::from_secs(10), orchestrator.run(token)).await;
		assert!(matches!(result, Ok(Ok(()))));

		assert!(board.snapshot().total_bytes >= 1000);
		assert!(edge.requests().len() >= 2);
	}

	#[tokio::test]
	async fn test_reporter_stops_on_cancel() {
		let board = Arc::new(ThroughputBoard::new());
		let token = CancellationToken::new();
		let reporter = spawn_reporter(board, Duration::from_millis(10), token.clone());
		tokio::time::sleep(Duration::from_millis(35)).await;
		assert!(!reporter.is_finished());

		token.cancel();
		let joined = tokio::time::timeout(Duration::from_secs(1), reporter).await;
		assert!(matches!(joined, Ok(Ok(()))));
	}
}
