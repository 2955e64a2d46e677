use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider, SupportedKxGroup};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
	CipherSuite, ClientConfig, DigitallySignedStruct, KeyLog, NamedGroup, ProtocolVersion,
	RootCertStore, SignatureScheme, SupportedCipherSuite, SupportedProtocolVersion,
};
use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::transport::TlsSettings;

#[derive(Debug, Error)]
pub enum TlsError {
	#[error("unknown TLS version '{0}'")]
	UnknownVersion(String),
	#[error("no supported TLS version between {min} and {max}")]
	EmptyVersionRange { min: String, max: String },
	#[error("unknown cipher suite '{0}'")]
	UnknownCipherSuite(String),
	#[error("unknown curve '{0}'")]
	UnknownCurve(String),
	#[error("a client certificate and a client key must be given together")]
	IncompleteClientAuth,
	#[error("loading {path}: {reason}")]
	Certificate { path: String, reason: String },
	#[error("opening key log file {path}: {reason}")]
	KeyLog { path: String, reason: String },
	#[error("building TLS config: {0}")]
	Config(String),
	#[error("invalid server name '{0}'")]
	InvalidServerName(String),
	#[error("handshake with {remote}: {reason}")]
	Handshake { remote: SocketAddr, reason: String },
}

/// Browser whose ClientHello a download task imitates
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BrowserProfile {
	Chrome,
	Firefox,
	Safari,
}

impl fmt::Display for BrowserProfile {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			BrowserProfile::Chrome => write!(f, "chrome"),
			BrowserProfile::Firefox => write!(f, "firefox"),
			BrowserProfile::Safari => write!(f, "safari"),
		}
	}
}

impl BrowserProfile {
	/// Cipher suites in the order the browser offers them
	pub fn cipher_suites(&self) -> &'static [CipherSuite] {
		match self {
			BrowserProfile::Chrome => &[
				CipherSuite::TLS13_AES_128_GCM_SHA256,
				CipherSuite::TLS13_AES_256_GCM_SHA384,
				CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
				CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
				CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
				CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
				CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
				CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
				CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
			],
			BrowserProfile::Firefox => &[
				CipherSuite::TLS13_AES_128_GCM_SHA256,
				CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
				CipherSuite::TLS13_AES_256_GCM_SHA384,
				CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
				CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
				CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
				CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
				CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
				CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
			],
			BrowserProfile::Safari => &[
				CipherSuite::TLS13_AES_128_GCM_SHA256,
				CipherSuite::TLS13_AES_256_GCM_SHA384,
				CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
				CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
				CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
				CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
				CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
				CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
				CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
			],
		}
	}

	pub fn kx_groups(&self) -> &'static [NamedGroup] {
		&[NamedGroup::X25519, NamedGroup::secp256r1, NamedGroup::secp384r1]
	}

	pub fn alpn(&self) -> Vec<Vec<u8>> {
		vec![b"h2".to_vec(), b"http/1.1".to_vec()]
	}

	pub fn user_agent(&self) -> &'static str {
		match self {
			BrowserProfile::Chrome => "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
			BrowserProfile::Firefox => "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
			BrowserProfile::Safari => "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
		}
	}
}

/// What the impersonated handshake settled on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
	pub version: ProtocolVersion,
	pub cipher_suite: CipherSuite,
	pub alpn: Option<Vec<u8>>,
}

/// Parse "1.0" .. "1.3" into the minor version number.
fn parse_version(input: &str) -> Result<u8, TlsError> {
	let trimmed = input.trim();
	let digits = trimmed
		.strip_prefix("TLS")
		.or_else(|| trimmed.strip_prefix("tls"))
		.unwrap_or(trimmed)
		.trim_start_matches(['v', ' ']);
	match digits {
		"1.0" | "10" => Ok(0),
		"1.1" | "11" => Ok(1),
		"1.2" | "12" => Ok(2),
		"1.3" | "13" => Ok(3),
		_ => Err(TlsError::UnknownVersion(input.to_string())),
	}
}

/// Protocol versions inside [min, max] that the TLS stack implements.
pub fn version_range(min: &str, max: &str) -> Result<Vec<&'static SupportedProtocolVersion>, TlsError> {
	let mut lo = parse_version(min)?;
	let hi = parse_version(max)?;
	if lo < 2 {
		warn!(min = %min, "TLS versions below 1.2 are not supported; raising the minimum to 1.2");
		lo = 2;
	}

	let mut versions = Vec::new();
	if lo <= 3 && hi >= 3 {
		versions.push(&rustls::version::TLS13);
	}
	if lo <= 2 && hi >= 2 {
		versions.push(&rustls::version::TLS12);
	}
	if versions.is_empty() {
		return Err(TlsError::EmptyVersionRange { min: min.to_string(), max: max.to_string() });
	}
	Ok(versions)
}

fn suite_by_id(id: CipherSuite) -> Option<SupportedCipherSuite> {
	ring::ALL_CIPHER_SUITES.iter().copied().find(|s| s.suite() == id)
}

/// Look a cipher suite up by name.
///
/// Both the rustls spelling ("TLS13_AES_128_GCM_SHA256") and the IANA one
/// ("TLS_AES_128_GCM_SHA256") are accepted.
pub fn cipher_suite_by_name(name: &str) -> Result<SupportedCipherSuite, TlsError> {
	let upper = name.trim().to_ascii_uppercase();
	let canonical = match upper.strip_prefix("TLS_") {
		Some(rest) if !rest.contains("_WITH_") => format!("TLS13_{}", rest),
		_ => upper,
	};
	ring::ALL_CIPHER_SUITES.iter()
		.copied()
		.find(|s| format!("{:?}", s.suite()) == canonical)
		.ok_or_else(|| TlsError::UnknownCipherSuite(name.to_string()))
}

fn kx_by_group(group: NamedGroup) -> Option<&'static dyn SupportedKxGroup> {
	ring::ALL_KX_GROUPS.iter().copied().find(|g| g.name() == group)
}

/// Look a key exchange group up by its curve name.
pub fn curve_by_name(name: &str) -> Result<&'static dyn SupportedKxGroup, TlsError> {
	let group = match name.trim().to_ascii_uppercase().replace('-', "").as_str() {
		"X25519" => NamedGroup::X25519,
		"P256" | "SECP256R1" | "CURVEP256" => NamedGroup::secp256r1,
		"P384" | "SECP384R1" | "CURVEP384" => NamedGroup::secp384r1,
		_ => return Err(TlsError::UnknownCurve(name.to_string())),
	};
	kx_by_group(group).ok_or_else(|| TlsError::UnknownCurve(name.to_string()))
}

/// Format one NSS key log line.
pub fn keylog_line(label: &str, client_random: &[u8], secret: &[u8]) -> String {
	format!("{} {} {}\n", label, hex::encode(client_random), hex::encode(secret))
}

/// Appends TLS session secrets to a file in NSS key log format
pub struct FileKeyLog {
	file: Mutex<File>,
}

impl FileKeyLog {
	pub fn open(path: &Path) -> Result<Self, TlsError> {
		let file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(path)
			.map_err(|e| TlsError::KeyLog { path: path.display().to_string(), reason: e.to_string() })?;
		Ok(Self { file: Mutex::new(file) })
	}
}

impl fmt::Debug for FileKeyLog {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("FileKeyLog").finish_non_exhaustive()
	}
}

impl KeyLog for FileKeyLog {
	fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
		let line = keylog_line(label, client_random, secret);
		let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
		if let Err(e) = file.write_all(line.as_bytes()) {
			warn!(error = %e, "failed to write TLS key log");
		}
	}
}

/// Accepts any server certificate but still checks handshake signatures
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.0.signature_verification_algorithms.supported_schemes()
	}
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
	let cert_err = |reason: String| TlsError::Certificate { path: path.display().to_string(), reason };
	let file = File::open(path).map_err(|e| cert_err(e.to_string()))?;
	let certs = rustls_pemfile::certs(&mut BufReader::new(file))
		.collect::<Result<Vec<_>, _>>()
		.map_err(|e| cert_err(e.to_string()))?;
	if certs.is_empty() {
		return Err(cert_err("no certificates found".to_string()));
	}
	Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
	let key_err = |reason: String| TlsError::Certificate { path: path.display().to_string(), reason };
	let file = File::open(path).map_err(|e| key_err(e.to_string()))?;
	rustls_pemfile::private_key(&mut BufReader::new(file))
		.map_err(|e| key_err(e.to_string()))?
		.ok_or_else(|| key_err("no private key found".to_string()))
}

fn provider(
	cipher_suites: Vec<SupportedCipherSuite>,
	kx_groups: Vec<&'static dyn SupportedKxGroup>,
) -> Arc<CryptoProvider> {
	let mut provider = ring::default_provider();
	if !cipher_suites.is_empty() {
		provider.cipher_suites = cipher_suites;
	}
	if !kx_groups.is_empty() {
		provider.kx_groups = kx_groups;
	}
	Arc::new(provider)
}

/// Shared tail of every config: versions, verification, client auth,
/// key log and ALPN.
fn assemble(
	provider: Arc<CryptoProvider>,
	versions: &[&'static SupportedProtocolVersion],
	settings: &TlsSettings,
	alpn: Vec<Vec<u8>>,
) -> Result<ClientConfig, TlsError> {
	let builder = ClientConfig::builder_with_provider(provider.clone())
		.with_protocol_versions(versions)
		.map_err(|e| TlsError::Config(e.to_string()))?;

	let builder = if settings.insecure_skip_verify {
		builder.dangerous()
			.with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
	} else {
		let root_store = RootCertStore {
			roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
		};
		builder.with_root_certificates(root_store)
	};

	let mut config = match (&settings.client_cert, &settings.client_key) {
		(Some(cert), Some(key)) => builder
			.with_client_auth_cert(load_certs(cert)?, load_key(key)?)
			.map_err(|e| TlsError::Config(e.to_string()))?,
		(None, None) => builder.with_no_client_auth(),
		_ => return Err(TlsError::IncompleteClientAuth),
	};

	if let Some(path) = &settings.key_log_file {
		debug!(path = %path.display(), "logging TLS secrets");
		config.key_log = Arc::new(FileKeyLog::open(path)?);
	}
	config.alpn_protocols = alpn;
	Ok(config)
}

/// Build the config for a standard TLS identity.
///
/// `default_alpn` applies when no next protocols were configured.
pub fn standard_config(settings: &TlsSettings, default_alpn: &[&str]) -> Result<ClientConfig, TlsError> {
	let versions = version_range(&settings.min_version, &settings.max_version)?;
	let suites = settings.cipher_suites.iter()
		.map(|name| cipher_suite_by_name(name))
		.collect::<Result<Vec<_>, _>>()?;
	let groups = settings.curves.iter()
		.map(|name| curve_by_name(name))
		.collect::<Result<Vec<_>, _>>()?;

	let alpn = if settings.next_protos.is_empty() {
		default_alpn.iter().map(|p| p.as_bytes().to_vec()).collect()
	} else {
		settings.next_protos.iter().map(|p| p.as_bytes().to_vec()).collect()
	};
	assemble(provider(suites, groups), &versions, settings, alpn)
}

/// Build the ClientHello config of a browser profile.
pub fn impersonated_config(profile: BrowserProfile, settings: &TlsSettings) -> Result<ClientConfig, TlsError> {
	let versions = version_range(&settings.min_version, &settings.max_version)?;
	let suites = profile.cipher_suites().iter()
		.filter_map(|id| suite_by_id(*id))
		.collect();
	let groups = profile.kx_groups().iter()
		.filter_map(|g| kx_by_group(*g))
		.collect();
	assemble(provider(suites, groups), &versions, settings, profile.alpn())
}

/// Build the config the HTTP layer uses after an impersonated handshake:
/// restricted to the negotiated version and cipher suite so both layers
/// agree.
pub fn matching_config(
	profile: BrowserProfile,
	settings: &TlsSettings,
	negotiated: &Negotiated,
) -> Result<ClientConfig, TlsError> {
	let suite = suite_by_id(negotiated.cipher_suite)
		.ok_or_else(|| TlsError::UnknownCipherSuite(format!("{:?}", negotiated.cipher_suite)))?;
	let version: &'static SupportedProtocolVersion = match negotiated.version {
		ProtocolVersion::TLSv1_3 => &rustls::version::TLS13,
		ProtocolVersion::TLSv1_2 => &rustls::version::TLS12,
		other => return Err(TlsError::UnknownVersion(format!("{:?}", other))),
	};
	let groups = profile.kx_groups().iter()
		.filter_map(|g| kx_by_group(*g))
		.collect();
	let alpn = match &negotiated.alpn {
		Some(proto) => vec![proto.clone()],
		None => vec![b"http/1.1".to_vec()],
	};
	assemble(provider(vec![suite], groups), &[version], settings, alpn)
}

async fn connect_tcp(remote: SocketAddr, local_ip: Option<IpAddr>) -> std::io::Result<TcpStream> {
	match local_ip {
		Some(ip) => {
			let socket = if remote.is_ipv6() { TcpSocket::new_v6()? } else { TcpSocket::new_v4()? };
			socket.bind(SocketAddr::new(ip, 0))?;
			socket.connect(remote).await
		}
		None => TcpStream::connect(remote).await,
	}
}

/// Perform one handshake against `remote`, presenting `host` as SNI, and
/// report what was negotiated.
pub async fn probe(
	config: Arc<ClientConfig>,
	remote: SocketAddr,
	local_ip: Option<IpAddr>,
	host: &str,
	timeout: Duration,
) -> Result<Negotiated, TlsError> {
	let handshake_err = |reason: String| TlsError::Handshake { remote, reason };
	let server_name = ServerName::try_from(host.to_string())
		.map_err(|_| TlsError::InvalidServerName(host.to_string()))?;

	let handshake = async {
		let tcp = connect_tcp(remote, local_ip).await
			.map_err(|e| handshake_err(format!("connect: {}", e)))?;
		TlsConnector::from(config).connect(server_name, tcp).await
			.map_err(|e| handshake_err(e.to_string()))
	};
	let stream = tokio::time::timeout(timeout, handshake).await
		.map_err(|_| handshake_err("timed out".to_string()))??;

	let (_, conn) = stream.get_ref();
	let negotiated = Negotiated {
		version: conn.protocol_version()
			.ok_or_else(|| handshake_err("no protocol version negotiated".to_string()))?,
		cipher_suite: conn.negotiated_cipher_suite()
			.map(|s| s.suite())
			.ok_or_else(|| handshake_err("no cipher suite negotiated".to_string()))?,
		alpn: conn.alpn_protocol().map(|p| p.to_vec()),
	};
	debug!(
		remote = %remote,
		version = ?negotiated.version,
		suite = ?negotiated.cipher_suite,
		"impersonated handshake complete"
	);
	Ok(negotiated)
}
