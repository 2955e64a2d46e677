use clap::Parser;

use crate::tls::BrowserProfile;

/// CDN edge enumeration and download tool
#[derive(Parser, Debug)]
#[command(name = "doh-ecs-bench")]
#[command(about = "Enumerate CDN edges via DoH with EDNS client-subnet and download from each edge")]
pub struct Cli {
	/// Local IP address to bind outgoing connections to
	#[arg(long = "local-ip")]
	pub local_ip: String,

	/// URL to download
	#[arg(long = "url", required_unless_present = "url_file")]
	pub url: Option<String>,

	/// File containing URLs to download (one per line)
	#[arg(long = "url-file")]
	pub url_file: Option<String>,

	/// Harvest resource links from the target page and rotate across them
	#[arg(long = "crawler")]
	pub crawler: bool,

	/// Number of parallel downloads per round
	#[arg(short = 'p', long = "parallel", default_value = "16")]
	pub parallel: usize,

	/// Downloads per task against its pinned edge
	#[arg(long = "iterations", default_value = "128")]
	pub iterations: u32,

	/// DoH server (repeatable, e.g. https://dns.google/dns-query or 1.1.1.1)
	#[arg(long = "doh-server")]
	pub doh_servers: Vec<String>,

	/// HTTP method for DoH queries (GET or POST)
	#[arg(long = "doh-method", default_value = "GET")]
	pub doh_method: String,

	/// Record type to query (repeatable, mnemonic or number)
	#[arg(short = 'q', long = "qtype", default_values_t = vec!["A".to_string()])]
	pub qtypes: Vec<String>,

	/// Set the DNSSEC OK bit
	#[arg(long = "dnssec")]
	pub dnssec: bool,

	/// Request the server's NSID
	#[arg(long = "nsid")]
	pub nsid: bool,

	/// Pad queries with an EDNS padding option
	#[arg(long = "pad")]
	pub pad: bool,

	/// EDNS UDP payload size
	#[arg(long = "udp-buffer", default_value = "1232")]
	pub udp_buffer: u16,

	/// Query class
	#[arg(long = "class", default_value = "1")]
	pub class: u16,

	/// Set the Authoritative Answer flag
	#[arg(long = "aa")]
	pub aa: bool,

	/// Set the Authentic Data flag
	#[arg(long = "ad")]
	pub ad: bool,

	/// Set the Checking Disabled flag
	#[arg(long = "cd")]
	pub cd: bool,

	/// Set the Recursion Available flag
	#[arg(long = "ra")]
	pub ra: bool,

	/// Set the reserved Z flag
	#[arg(long = "z")]
	pub z: bool,

	/// Set the Truncated flag
	#[arg(long = "tc")]
	pub tc: bool,

	/// Clear the Recursion Desired flag
	#[arg(long = "no-rd")]
	pub no_rd: bool,

	/// Keep connections open between requests
	#[arg(long = "reuse-conn")]
	pub reuse_conn: bool,

	/// Request timeout in milliseconds
	#[arg(short = 't', long = "timeout", default_value = "10000")]
	pub timeout: u64,

	/// User-Agent header for DoH and download requests
	#[arg(long = "user-agent")]
	pub user_agent: Option<String>,

	/// Referer header for download requests
	#[arg(long = "referer", default_value = "")]
	pub referer: String,

	/// X-Forwarded-For value: random, off, or a fixed IP
	#[arg(long = "x-forwarded-for", default_value = "random")]
	pub x_forwarded_for: String,

	/// Send downloads as POST with this body
	#[arg(long = "post-body")]
	pub post_body: Option<String>,

	/// Skip TLS certificate verification
	#[arg(long = "tls-insecure-skip-verify")]
	pub tls_insecure_skip_verify: bool,

	/// TLS server name for DoH servers given as IP literals
	#[arg(long = "tls-server-name")]
	pub tls_server_name: Option<String>,

	/// Minimum TLS version
	#[arg(long = "tls-min-version", default_value = "1.2")]
	pub tls_min_version: String,

	/// Maximum TLS version
	#[arg(long = "tls-max-version", default_value = "1.3")]
	pub tls_max_version: String,

	/// ALPN protocol (repeatable)
	#[arg(long = "tls-next-protos")]
	pub tls_next_protos: Vec<String>,

	/// Cipher suite (repeatable)
	#[arg(long = "tls-cipher-suites")]
	pub tls_cipher_suites: Vec<String>,

	/// Key exchange curve (repeatable)
	#[arg(long = "tls-curves")]
	pub tls_curves: Vec<String>,

	/// Client certificate (PEM)
	#[arg(long = "tls-client-cert")]
	pub tls_client_cert: Option<String>,

	/// Client private key (PEM)
	#[arg(long = "tls-client-key")]
	pub tls_client_key: Option<String>,

	/// Append TLS session secrets to this file (NSS key log format)
	#[arg(long = "tls-key-log-file")]
	pub tls_key_log_file: Option<String>,

	/// Present a browser TLS fingerprint on download connections
	#[arg(long = "impersonate", value_enum)]
	pub impersonate: Option<BrowserProfile>,

	/// File of CIDR blocks to sample client subnets from
	#[arg(long = "subnet-file")]
	pub subnet_file: Option<String>,

	/// Seconds between throughput reports
	#[arg(long = "report-interval", default_value = "5")]
	pub report_interval: u64,

	/// Times a panicking download is relaunched before giving up
	#[arg(long = "max-restarts", default_value = "5")]
	pub max_restarts: u32,

	/// Random seed for reproducible subnet sampling
	#[arg(short = 's', long = "seed")]
	pub seed: Option<u64>,

	/// Log level used when RUST_LOG is not set
	#[arg(long = "log-level", default_value = "info")]
	pub log_level: String,
}
