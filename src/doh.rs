use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hickory_proto::op::Message;
use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Response, Url};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dns::{build_queries, extract_ips, parse_response, DnsError, DnsQuery};
use crate::resolver::wire_url;
use crate::tls::standard_config;
use crate::transport::{HttpMethod, QueryConfig, TransportSettings};

const DNS_MESSAGE: &str = "application/dns-message";

/// One client per HTTP version, tried in order
struct VersionedClient {
	http2: Client,
	http1: Client,
}

/// DoH transport bound to one normalized server
pub struct DohClient {
	server: String,
	url: Url,
	method: HttpMethod,
	transport: Arc<TransportSettings>,
	/// Name and address used when a server given as an IP literal is
	/// reached under a TLS server name
	pinned_name: Option<(String, SocketAddr)>,
	cached: Mutex<Option<Arc<VersionedClient>>>,
}

impl DohClient {
	pub fn new(server: &str, method: HttpMethod, transport: Arc<TransportSettings>) -> Result<Self, DnsError> {
		let mut url = wire_url(server)?;
		let mut pinned_name = None;

		if let (Some(name), Some(host)) = (&transport.tls.server_name, url.host_str()) {
			let literal = host.trim_start_matches('[').trim_end_matches(']');
			if let Ok(ip) = literal.parse::<IpAddr>() {
				let port = url.port_or_known_default().unwrap_or(443);
				url.set_host(Some(name))
					.map_err(|e| DnsError::InvalidServer(server.to_string(), e.to_string()))?;
				debug!(server = %server, name = %name, "presenting TLS server name");
				pinned_name = Some((name.clone(), SocketAddr::new(ip, port)));
			}
		}

		Ok(Self {
			server: server.to_string(),
			url,
			method,
			transport,
			pinned_name,
			cached: Mutex::new(None),
		})
	}

	pub fn server(&self) -> &str {
		&self.server
	}

	fn build_client(&self, http2: bool) -> Result<Client, DnsError> {
		let mut tls = standard_config(&self.transport.tls, &[])
			.map_err(|e| DnsError::Client(e.to_string()))?;
		tls.alpn_protocols = if http2 {
			vec![b"h2".to_vec()]
		} else {
			vec![b"http/1.1".to_vec()]
		};

		let mut builder = Client::builder()
			.use_preconfigured_tls(tls)
			.no_proxy()
			.timeout(self.transport.timeout);
		builder = if http2 {
			builder.http2_prior_knowledge()
		} else {
			builder.http1_only()
		};
		if let Some(ip) = self.transport.local_ip {
			builder = builder.local_address(ip);
		}
		if !self.transport.reuse_conn {
			builder = builder.pool_max_idle_per_host(0);
		}
		if let Some((name, addr)) = &self.pinned_name {
			builder = builder.resolve(name, *addr);
		}
		builder.build().map_err(|e| DnsError::Client(e.to_string()))
	}

	/// Cached clients when reuse is on, fresh ones otherwise
	fn clients(&self) -> Result<Arc<VersionedClient>, DnsError> {
		let build = || -> Result<Arc<VersionedClient>, DnsError> {
			Ok(Arc::new(VersionedClient {
				http2: self.build_client(true)?,
				http1: self.build_client(false)?,
			}))
		};
		if !self.transport.reuse_conn {
			return build();
		}
		let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
		if let Some(clients) = cached.as_ref() {
			return Ok(clients.clone());
		}
		let clients = build()?;
		*cached = Some(clients.clone());
		Ok(clients)
	}

	async fn send(&self, client: &Client, wire: &[u8]) -> reqwest::Result<Response> {
		let request = match self.method {
			HttpMethod::Get => {
				let mut url = self.url.clone();
				url.query_pairs_mut().append_pair("dns", &URL_SAFE_NO_PAD.encode(wire));
				client.get(url)
			}
			HttpMethod::Post => client.post(self.url.clone())
				.header(CONTENT_TYPE, DNS_MESSAGE)
				.body(wire.to_vec()),
		};
		let request = request.header(ACCEPT, DNS_MESSAGE);
		let request = match &self.transport.user_agent {
			Some(ua) => request.header(USER_AGENT, ua),
			None => request,
		};
		request.send().await
	}

	/// Exchange one query, falling back from HTTP/2 to HTTP/1.1 when the
	/// round trip cannot be completed.
	pub async fn exchange(&self, query: &DnsQuery, token: &CancellationToken) -> Result<Message, DnsError> {
		let clients = self.clients()?;

		let attempt = async {
			match self.send(&clients.http2, &query.wire).await {
				Ok(response) => Ok(response),
				Err(h2_err) => {
					debug!(server = %self.server, error = %h2_err, "HTTP/2 exchange failed, retrying over HTTP/1.1");
					self.send(&clients.http1, &query.wire).await.map_err(|h1_err| DnsError::Transport {
						server: self.server.clone(),
						reason: format!("HTTP/2: {}; HTTP/1.1: {}", h2_err, h1_err),
					})
				}
			}
		};
		let response = tokio::select! {
			biased;
			_ = token.cancelled() => return Err(DnsError::Cancelled),
			response = attempt => response?,
		};

		let status = response.status();
		let body = response.bytes().await.map_err(|e| DnsError::Body {
			server: self.server.clone(),
			reason: e.to_string(),
		})?;
		if status.as_u16() != 200 {
			return Err(DnsError::HttpStatus { status: status.as_u16(), server: self.server.clone() });
		}

		parse_response(&body, query.id, &self.server)
	}

	/// Run every query of `config` in turn and collect the answered addresses.
	pub async fn resolve(&self, config: &QueryConfig, token: &CancellationToken) -> Result<Vec<IpAddr>, DnsError> {
		let queries = build_queries(config, &mut rand::thread_rng())?;
		let mut replies = Vec::with_capacity(queries.len());
		for query in &queries {
			let reply = self.exchange(query, token).await?;
			if reply.answers().is_empty() {
				debug!(server = %self.server, rcode = ?reply.response_code(), qtype = %query.record_type, "empty answer");
			}
			replies.push(reply);
		}
		Ok(extract_ips(&replies))
	}
}
