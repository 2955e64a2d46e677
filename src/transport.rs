use std::fmt;
use std::net::{AddrParseError, IpAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::rr::RecordType;
use reqwest::Url;

use crate::dns::DnsError;
use crate::tls::BrowserProfile;

/// HTTP method used to carry a DoH query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
	Get,
	Post,
}

impl FromStr for HttpMethod {
	type Err = DnsError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_uppercase().as_str() {
			"GET" => Ok(HttpMethod::Get),
			"POST" => Ok(HttpMethod::Post),
			_ => Err(DnsError::UnsupportedMethod(s.to_string())),
		}
	}
}

impl fmt::Display for HttpMethod {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			HttpMethod::Get => write!(f, "GET"),
			HttpMethod::Post => write!(f, "POST"),
		}
	}
}

/// Standard TLS parameters shared by the DoH client and the downloader
#[derive(Debug, Clone)]
pub struct TlsSettings {
	pub insecure_skip_verify: bool,
	/// Name presented to a DoH server given as an IP literal
	pub server_name: Option<String>,
	pub min_version: String,
	pub max_version: String,
	pub next_protos: Vec<String>,
	pub cipher_suites: Vec<String>,
	pub curves: Vec<String>,
	pub client_cert: Option<PathBuf>,
	pub client_key: Option<PathBuf>,
	pub key_log_file: Option<PathBuf>,
}

impl Default for TlsSettings {
	fn default() -> Self {
		Self {
			insecure_skip_verify: false,
			server_name: None,
			min_version: "1.2".to_string(),
			max_version: "1.3".to_string(),
			next_protos: Vec::new(),
			cipher_suites: Vec::new(),
			curves: Vec::new(),
			client_cert: None,
			client_key: None,
			key_log_file: None,
		}
	}
}

/// How a download task presents itself during the TLS handshake
#[derive(Debug, Clone)]
pub enum TlsIdentity {
	Standard(TlsSettings),
	/// Browser fingerprint; verification, client auth and key logging still
	/// come from the settings.
	Impersonate {
		profile: BrowserProfile,
		settings: TlsSettings,
	},
}

/// Connection parameters composed into both the resolver and the downloader
#[derive(Debug, Clone)]
pub struct TransportSettings {
	pub local_ip: Option<IpAddr>,
	pub timeout: Duration,
	pub reuse_conn: bool,
	pub user_agent: Option<String>,
	pub tls: TlsSettings,
}

impl Default for TransportSettings {
	fn default() -> Self {
		Self {
			local_ip: None,
			timeout: Duration::from_secs(10),
			reuse_conn: false,
			user_agent: None,
			tls: TlsSettings::default(),
		}
	}
}

/// DNS header flags copied verbatim into every query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFlags {
	pub authoritative: bool,
	pub authentic_data: bool,
	pub checking_disabled: bool,
	pub recursion_desired: bool,
	pub recursion_available: bool,
	pub zero: bool,
	pub truncated: bool,
}

impl Default for HeaderFlags {
	fn default() -> Self {
		Self {
			authoritative: false,
			authentic_data: false,
			checking_disabled: false,
			recursion_desired: true,
			recursion_available: false,
			zero: false,
			truncated: false,
		}
	}
}

/// EDNS0 features requested for a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdnsRequest {
	pub dnssec_ok: bool,
	pub nsid: bool,
	pub padding: bool,
	pub client_subnet: Option<String>,
	pub udp_buffer: u16,
}

impl Default for EdnsRequest {
	fn default() -> Self {
		Self {
			dnssec_ok: false,
			nsid: false,
			padding: false,
			client_subnet: None,
			udp_buffer: 1232,
		}
	}
}

impl EdnsRequest {
	/// True when an OPT record has to be attached
	pub fn any(&self) -> bool {
		self.dnssec_ok || self.nsid || self.padding || self.client_subnet.is_some()
	}
}

/// One DNS query intent, immutable once built
#[derive(Debug, Clone)]
pub struct QueryConfig {
	pub name: String,
	pub record_types: Vec<RecordType>,
	pub class: u16,
	pub flags: HeaderFlags,
	pub edns: EdnsRequest,
	pub server: String,
	pub method: HttpMethod,
}

/// Resolver-side settings from which a QueryConfig is stamped per subnet
#[derive(Debug, Clone)]
pub struct DnsSettings {
	pub servers: Vec<String>,
	pub method: HttpMethod,
	pub record_types: Vec<RecordType>,
	pub class: u16,
	pub flags: HeaderFlags,
	pub edns: EdnsRequest,
}

impl DnsSettings {
	pub fn query_config(&self, name: &str, subnet: &str, server: &str) -> QueryConfig {
		let mut edns = self.edns.clone();
		edns.client_subnet = Some(subnet.to_string());
		QueryConfig {
			name: name.to_string(),
			record_types: self.record_types.clone(),
			class: self.class,
			flags: self.flags,
			edns,
			server: server.to_string(),
			method: self.method,
		}
	}
}

/// X-Forwarded-For / X-Real-IP policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardedFor {
	Off,
	/// A random IPv4 address, drawn once per task
	Random,
	Fixed(String),
}

impl FromStr for ForwardedFor {
	type Err = AddrParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let trimmed = s.trim();
		Ok(match trimmed.to_ascii_lowercase().as_str() {
			"" | "off" | "none" => ForwardedFor::Off,
			"random" => ForwardedFor::Random,
			_ => ForwardedFor::Fixed(trimmed.parse::<IpAddr>()?.to_string()),
		})
	}
}

/// Downloader-side settings shared by every task of a run
#[derive(Debug, Clone)]
pub struct DownloadSettings {
	pub iterations: u32,
	pub referer: String,
	pub forwarded_for: ForwardedFor,
	/// Send downloads as POST with this body
	pub post_body: Option<String>,
	pub tls: TlsIdentity,
	pub max_restarts: u32,
}

/// The finished configuration record consumed by the orchestrator
#[derive(Debug, Clone)]
pub struct RunConfig {
	pub targets: Vec<Url>,
	pub parallelism: usize,
	pub transport: Arc<TransportSettings>,
	pub dns: DnsSettings,
	pub download: DownloadSettings,
	pub subnet_file: Option<PathBuf>,
	pub report_interval: Duration,
	pub seed: Option<u64>,
}
