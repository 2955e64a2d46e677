use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::header::{COOKIE, REFERER, USER_AGENT};
use reqwest::{Client, Url};
use rustls::ClientConfig;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::stats::TaskCounters;
use crate::tls::{self, TlsError};
use crate::transport::{DownloadSettings, ForwardedFor, TlsIdentity, TransportSettings};

/// Longest error body kept from a non-200 response
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Error)]
pub enum DownloadError {
	#[error("requesting {url} via {remote}: {reason}")]
	Request { url: String, remote: SocketAddr, reason: String },
	#[error("got status code {status} from {remote}: {body}")]
	Status { status: u16, remote: SocketAddr, body: String },
	#[error("reading body from {remote}: {reason}")]
	Body { remote: SocketAddr, reason: String },
	#[error("building HTTP client: {0}")]
	Client(String),
	#[error(transparent)]
	Tls(#[from] TlsError),
	#[error("URL {0} has no host or port, or names an address other than the pinned edge")]
	InvalidUrl(String),
	#[error("download cancelled")]
	Cancelled,
}

/// Resolves every name to one fixed address
pub struct PinnedResolver {
	addr: SocketAddr,
}

impl PinnedResolver {
	pub fn new(addr: SocketAddr) -> Self {
		Self { addr }
	}
}

impl Resolve for PinnedResolver {
	fn resolve(&self, name: Name) -> Resolving {
		let addr = self.addr;
		debug!(name = name.as_str(), pinned = %addr, "pinning connection");
		Box::pin(async move {
			let addrs: Addrs = Box::new(std::iter::once(addr));
			Ok(addrs)
		})
	}
}

/// A random IPv4 address for spoofed forwarding headers
pub fn random_ipv4<R: Rng>(rng: &mut R) -> Ipv4Addr {
	Ipv4Addr::new(
		rng.gen_range(0..255),
		rng.gen_range(0..255),
		rng.gen_range(0..255),
		rng.gen_range(0..255),
	)
}

/// A random string of ASCII letters
pub fn random_cookie<R: Rng>(rng: &mut R, len: usize) -> String {
	rng.sample_iter(&Alphanumeric)
		.map(char::from)
		.filter(|c| c.is_ascii_alphabetic())
		.take(len)
		.collect()
}

fn truncate(body: &str, max: usize) -> String {
	match body.char_indices().nth(max) {
		Some((cut, _)) => format!("{}...", &body[..cut]),
		None => body.to_string(),
	}
}

/// One worker's unit of work, pinned to a single edge
pub struct DownloadTask {
	url: Url,
	remote: SocketAddr,
	referer: String,
	forwarded_for: Option<String>,
	post_body: Option<String>,
	user_agent: Option<String>,
	iterations: u32,
	transport: Arc<TransportSettings>,
	tls: TlsIdentity,
	counters: Arc<TaskCounters>,
	completed: AtomicU32,
}

impl DownloadTask {
	/// Pin `url` to `ip` on the URL's port. A random forwarding address is
	/// drawn here, once per task.
	pub fn new<R: Rng>(
		url: Url,
		ip: IpAddr,
		settings: &DownloadSettings,
		transport: Arc<TransportSettings>,
		rng: &mut R,
	) -> Result<Self, DownloadError> {
		let port = url.port_or_known_default()
			.ok_or_else(|| DownloadError::InvalidUrl(url.to_string()))?;
		let Some(host) = url.host_str() else {
			return Err(DownloadError::InvalidUrl(url.to_string()));
		};
		// The connector dials IP-literal hosts directly, skipping the pin
		if let Ok(literal) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
			if literal != ip {
				return Err(DownloadError::InvalidUrl(url.to_string()));
			}
		}

		let forwarded_for = match &settings.forwarded_for {
			ForwardedFor::Off => None,
			ForwardedFor::Random => Some(random_ipv4(rng).to_string()),
			ForwardedFor::Fixed(value) => Some(value.clone()),
		};
		let user_agent = match (&transport.user_agent, &settings.tls) {
			(Some(ua), _) => Some(ua.clone()),
			(None, TlsIdentity::Impersonate { profile, .. }) => Some(profile.user_agent().to_string()),
			(None, TlsIdentity::Standard(_)) => None,
		};

		Ok(Self {
			url,
			remote: SocketAddr::new(ip, port),
			referer: settings.referer.clone(),
			forwarded_for,
			post_body: settings.post_body.clone(),
			user_agent,
			iterations: settings.iterations,
			transport,
			tls: settings.tls.clone(),
			counters: Arc::new(TaskCounters::new()),
			completed: AtomicU32::new(0),
		})
	}

	pub fn remote(&self) -> SocketAddr {
		self.remote
	}

	pub fn counters(&self) -> Arc<TaskCounters> {
		self.counters.clone()
	}

	/// Iterations finished so far; a relaunched task resumes from here
	pub fn completed(&self) -> u32 {
		self.completed.load(Ordering::SeqCst)
	}

	/// TLS config handed to the HTTP layer. An impersonated identity first
	/// shakes hands with the edge and then matches what was negotiated.
	async fn tls_config(&self) -> Result<ClientConfig, DownloadError> {
		match &self.tls {
			TlsIdentity::Standard(settings) => Ok(tls::standard_config(settings, &["http/1.1"])?),
			TlsIdentity::Impersonate { profile, settings } => {
				let hello = tls::impersonated_config(*profile, settings)?;
				if self.url.scheme() != "https" {
					return Ok(hello);
				}
				let host = self.url.host_str()
					.ok_or_else(|| DownloadError::InvalidUrl(self.url.to_string()))?;
				let negotiated = tls::probe(
					Arc::new(hello),
					self.remote,
					self.transport.local_ip,
					host,
					self.transport.timeout,
				).await?;
				Ok(tls::matching_config(*profile, settings, &negotiated)?)
			}
		}
	}

	fn build_client(&self, tls: &ClientConfig) -> Result<Client, DownloadError> {
		let mut builder = Client::builder()
			.use_preconfigured_tls(tls.clone())
			.dns_resolver(Arc::new(PinnedResolver::new(self.remote)))
			.no_proxy()
			.timeout(self.transport.timeout * 2);
		if let Some(ip) = self.transport.local_ip {
			builder = builder.local_address(ip);
		}
		if !self.transport.reuse_conn {
			builder = builder.pool_max_idle_per_host(0);
		}
		builder.build().map_err(|e| DownloadError::Client(e.to_string()))
	}

	/// One request, body drained to the end. Returns the bytes drained.
	async fn fetch_once(&self, client: &Client) -> Result<u64, DownloadError> {
		let started = Instant::now();
		let request = match &self.post_body {
			Some(body) => client.post(self.url.clone()).body(body.clone()),
			None => client.get(self.url.clone()),
		};
		let mut request = request.header(COOKIE, random_cookie(&mut rand::thread_rng(), 12));
		if let Some(ua) = &self.user_agent {
			request = request.header(USER_AGENT, ua);
		}
		if !self.referer.is_empty() {
			request = request.header(REFERER, &self.referer);
		}
		if let Some(addr) = &self.forwarded_for {
			request = request.header("X-Forwarded-For", addr).header("X-Real-IP", addr);
		}

		let mut response = request.send().await.map_err(|e| DownloadError::Request {
			url: self.url.to_string(),
			remote: self.remote,
			reason: e.to_string(),
		})?;

		let status = response.status().as_u16();
		if status != 200 {
			let body = response.text().await.unwrap_or_default();
			let body = truncate(&body, MAX_ERROR_BODY);
			error!(remote = %self.remote, status, body = %body, "unexpected response");
			return Err(DownloadError::Status { status, remote: self.remote, body });
		}

		let mut written: u64 = 0;
		while let Some(chunk) = response.chunk().await.map_err(|e| DownloadError::Body {
			remote: self.remote,
			reason: e.to_string(),
		})? {
			written += chunk.len() as u64;
		}

		let elapsed = started.elapsed();
		let speed = self.counters.record(written, elapsed);
		debug!(remote = %self.remote, bytes = written, elapsed = ?elapsed, speed_kbps = speed, "download finished");
		Ok(written)
	}

	/// Run the remaining iterations. Any failed iteration ends the task.
	pub async fn run(&self, token: &CancellationToken) -> Result<(), DownloadError> {
		debug!(remote = %self.remote, url = %self.url, resume_at = self.completed(), "download started");

		let tls = tokio::select! {
			biased;
			_ = token.cancelled() => return Err(DownloadError::Cancelled),
			tls = self.tls_config() => tls?,
		};

		let mut reused: Option<Client> = None;
		while self.completed() < self.iterations {
			let client = match &reused {
				Some(client) => client.clone(),
				None => {
					let client = self.build_client(&tls)?;
					if self.transport.reuse_conn {
						reused = Some(client.clone());
					}
					client
				}
			};

			tokio::select! {
				biased;
				_ = token.cancelled() => return Err(DownloadError::Cancelled),
				result = self.fetch_once(&client) => { result?; }
			}
			self.completed.fetch_add(1, Ordering::SeqCst);
		}

		info!(remote = %self.remote, "download done");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_support::LoopbackServer;
	use crate::tls::BrowserProfile;
	use crate::transport::TlsSettings;
	use rand::rngs::StdRng;
	use rand::SeedableRng;
	use std::time::Duration;

	fn settings(iterations: u32, forwarded_for: ForwardedFor) -> DownloadSettings {
		DownloadSettings {
			iterations,
			referer: "https://www.example.com/".to_string(),
			forwarded_for,
			post_body: None,
			tls: TlsIdentity::Standard(TlsSettings::default()),
			max_restarts: 0,
		}
	}

	fn transport() -> Arc<TransportSettings> {
		Arc::new(TransportSettings {
			timeout: Duration::from_secs(5),
			..TransportSettings::default()
		})
	}

	fn loopback() -> IpAddr {
		"127.0.0.1".parse().unwrap()
	}

	#[tokio::test]
	async fn test_pinned_download_counts_bytes() {
		let server = LoopbackServer::fixed(200, vec![7u8; 3000]).await;
		let port = server.addr.port();
		let url = Url::parse(&format!("http://edge.pinned.invalid:{}/blob", port)).unwrap();
		let mut rng = StdRng::seed_from_u64(5);
		let task = DownloadTask::new(url, loopback(), &settings(3, ForwardedFor::Random), transport(), &mut rng).unwrap();

		task.run(&CancellationToken::new()).await.unwrap();
		assert_eq!(task.completed(), 3);
		assert_eq!(task.counters().total_bytes(), 9000);

		let requests = server.requests();
		assert_eq!(requests.len(), 3);
		let expected_host = format!("edge.pinned.invalid:{}", port);
		let xff = requests[0].header("x-forwarded-for").unwrap().to_string();
		assert!(xff.parse::<Ipv4Addr>().is_ok());
		for request in &requests {
			assert_eq!(request.header("host"), Some(expected_host.as_str()));
			assert_eq!(request.header("x-forwarded-for"), Some(xff.as_str()));
			assert_eq!(request.header("x-real-ip"), Some(xff.as_str()));
			assert_eq!(request.header("referer"), Some("https://www.example.com/"));
			let cookie = request.header("cookie").unwrap();
			assert_eq!(cookie.len(), 12);
			assert!(cookie.chars().all(|c| c.is_ascii_alphabetic()));
		}
	}

	#[tokio::test]
	async fn test_non_200_aborts_task() {
		let server = LoopbackServer::fixed(404, b"not here".to_vec()).await;
		let url = Url::parse(&format!("http://edge.pinned.invalid:{}/missing", server.addr.port())).unwrap();
		let mut rng = StdRng::seed_from_u64(5);
		let task = DownloadTask::new(url, loopback(), &settings(5, ForwardedFor::Off), transport(), &mut rng).unwrap();

		let err = task.run(&CancellationToken::new()).await.unwrap_err();
		match err {
			DownloadError::Status { status, body, .. } => {
				assert_eq!(status, 404);
				assert_eq!(body, "not here");
			}
			other => panic!("unexpected error: {}", other),
		}
		assert_eq!(task.completed(), 0);
		assert_eq!(task.counters().total_bytes(), 0);
		assert_eq!(server.requests().len(), 1);
		assert!(server.requests()[0].header("x-forwarded-for").is_none());
	}

	#[tokio::test]
	async fn test_post_body_and_reuse() {
		let server = LoopbackServer::fixed(200, vec![1u8; 10]).await;
		let url = Url::parse(&format!("http://edge.pinned.invalid:{}/upload", server.addr.port())).unwrap();
		let mut download = settings(2, ForwardedFor::Fixed("10.9.8.7".to_string()));
		download.post_body = Some("payload".to_string());
		let reuse = Arc::new(TransportSettings { reuse_conn: true, ..(*transport()).clone() });
		let mut rng = StdRng::seed_from_u64(5);
		let task = DownloadTask::new(url, loopback(), &download, reuse, &mut rng).unwrap();

		task.run(&CancellationToken::new()).await.unwrap();
		let requests = server.requests();
		assert_eq!(requests.len(), 2);
		assert_eq!(requests[0].method, "POST");
		assert_eq!(requests[0].body, b"payload".to_vec());
		assert_eq!(requests[1].header("x-real-ip"), Some("10.9.8.7"));
		assert_eq!(task.counters().total_bytes(), 20);
	}

	#[tokio::test]
	async fn test_cancelled_task_stops() {
		let server = LoopbackServer::fixed(200, vec![0u8; 10]).await;
		let url = Url::parse(&format!("http://edge.pinned.invalid:{}/blob", server.addr.port())).unwrap();
		let mut rng = StdRng::seed_from_u64(5);
		let task = DownloadTask::new(url, loopback(), &settings(10, ForwardedFor::Off), transport(), &mut rng).unwrap();
		let token = CancellationToken::new();
		token.cancel();

		assert!(matches!(task.run(&token).await, Err(DownloadError::Cancelled)));
		assert_eq!(task.completed(), 0);
	}

	#[tokio::test]
	async fn test_ip_literal_host_cannot_escape_pin() {
		let server = LoopbackServer::fixed(200, vec![0u8; 10]).await;
		let url = Url::parse(&format!("http://127.0.0.2:{}/blob", server.addr.port())).unwrap();
		let mut rng = StdRng::seed_from_u64(5);
		let result = DownloadTask::new(url, loopback(), &settings(1, ForwardedFor::Off), transport(), &mut rng);
		assert!(matches!(result, Err(DownloadError::InvalidUrl(_))));
		assert!(server.requests().is_empty());

		let same = Url::parse(&format!("http://127.0.0.1:{}/blob", server.addr.port())).unwrap();
		let task = DownloadTask::new(same, loopback(), &settings(1, ForwardedFor::Off), transport(), &mut rng).unwrap();
		task.run(&CancellationToken::new()).await.unwrap();
		assert_eq!(server.requests().len(), 1);
	}

	#[test]
	fn test_remote_port_from_scheme() {
		let mut rng = StdRng::seed_from_u64(1);
		let ip: IpAddr = "203.0.113.5".parse().unwrap();
		let https = DownloadTask::new(
			Url::parse("https://cdn.example.com/file").unwrap(),
			ip,
			&settings(1, ForwardedFor::Off),
			transport(),
			&mut rng,
		).unwrap();
		assert_eq!(https.remote(), "203.0.113.5:443".parse::<SocketAddr>().unwrap());

		let http = DownloadTask::new(
			Url::parse("http://cdn.example.com:8080/file").unwrap(),
			ip,
			&settings(1, ForwardedFor::Off),
			transport(),
			&mut rng,
		).unwrap();
		assert_eq!(http.remote().port(), 8080);
	}

	#[test]
	fn test_impersonation_sets_user_agent() {
		let mut download = settings(1, ForwardedFor::Off);
		download.tls = TlsIdentity::Impersonate { profile: BrowserProfile::Firefox, settings: TlsSettings::default() };
		let mut rng = StdRng::seed_from_u64(1);
		let task = DownloadTask::new(
			Url::parse("https://cdn.example.com/file").unwrap(),
			"203.0.113.5".parse().unwrap(),
			&download,
			transport(),
			&mut rng,
		).unwrap();
		assert_eq!(task.user_agent.as_deref(), Some(BrowserProfile::Firefox.user_agent()));
	}

	#[test]
	fn test_random_helpers() {
		let mut rng = StdRng::seed_from_u64(11);
		for _ in 0..100 {
			let ip = random_ipv4(&mut rng);
			assert!(ip.octets().iter().all(|o| *o < 255));
		}
		let cookie = random_cookie(&mut rng, 12);
		assert_eq!(cookie.len(), 12);
		assert!(cookie.chars().all(|c| c.is_ascii_alphabetic()));
	}

	#[test]
	fn test_truncate_body() {
		assert_eq!(truncate("short", 10), "short");
		assert_eq!(truncate("abcdef", 3), "abc...");
	}
}
