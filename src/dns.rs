use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsOption};
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use ipnet::IpNet;
use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::transport::QueryConfig;

/// EDNS0 option code for NSID (RFC 5001)
const EDNS_NSID: u16 = 3;
/// EDNS0 option code for padding (RFC 7830)
const EDNS_PADDING: u16 = 12;
/// Block size the padded message is aligned to
const PADDING_BLOCK: usize = 128;

#[derive(Debug, Error)]
pub enum DnsError {
	#[error("invalid query name '{0}': {1}")]
	InvalidName(String, String),
	#[error("{0} is not a valid RR type")]
	InvalidRecordType(String),
	#[error("invalid client subnet '{0}': {1}")]
	InvalidSubnet(String, String),
	#[error("unsupported HTTP method: {0}")]
	UnsupportedMethod(String),
	#[error("invalid DoH server '{0}': {1}")]
	InvalidServer(String, String),
	#[error("packing message: {0}")]
	Pack(String),
	#[error("unpacking DNS response from {server}: {reason}")]
	Unpack { server: String, reason: String },
	#[error("requesting {server}: {reason}")]
	Transport { server: String, reason: String },
	#[error("got status code {status} from {server}")]
	HttpStatus { status: u16, server: String },
	#[error("reading {server}: {reason}")]
	Body { server: String, reason: String },
	#[error("building HTTP client: {0}")]
	Client(String),
	#[error("query cancelled")]
	Cancelled,
}

/// A packed query ready for the wire
#[derive(Debug, Clone)]
pub struct DnsQuery {
	pub id: u16,
	pub record_type: RecordType,
	pub wire: Vec<u8>,
}

/// Client-subnet option derived from a CIDR string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdnsOptions {
	pub address: IpAddr,
	pub source_prefix: u8,
}

impl EdnsOptions {
	/// Parse "addr/len" (a bare address counts as a host route).
	///
	/// Host bits beyond the prefix are cleared, and an IPv4-mapped IPv6
	/// address is carried as IPv4.
	pub fn from_cidr(cidr: &str) -> Result<Self, DnsError> {
		let trimmed = cidr.trim();
		let net = IpNet::from_str(trimmed)
			.or_else(|_| IpAddr::from_str(trimmed).map(IpNet::from))
			.map_err(|e| DnsError::InvalidSubnet(trimmed.to_string(), e.to_string()))?;
		let net = net.trunc();

		let (address, source_prefix) = match net.network() {
			IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
				Some(v4) => (IpAddr::V4(v4), net.prefix_len().saturating_sub(96)),
				None => (IpAddr::V6(v6), net.prefix_len()),
			},
			v4 => (v4, net.prefix_len()),
		};
		Ok(Self { address, source_prefix })
	}

	/// Address family as carried on the wire: 1 for IPv4, 2 for IPv6
	pub fn family(&self) -> u16 {
		match self.address {
			IpAddr::V4(_) => 1,
			IpAddr::V6(_) => 2,
		}
	}
}

/// One answer record, reduced to what the orchestrator consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
	A(Ipv4Addr),
	Aaaa(Ipv6Addr),
	Other(RecordType),
}

impl Answer {
	pub fn ip(&self) -> Option<IpAddr> {
		match self {
			Answer::A(v4) => Some(IpAddr::V4(*v4)),
			Answer::Aaaa(v6) => Some(IpAddr::V6(*v6)),
			Answer::Other(_) => None,
		}
	}
}

/// Parse RR types given as mnemonics ("A", "aaaa") or integers ("28").
pub fn parse_record_types(types: &[String]) -> Result<Vec<RecordType>, DnsError> {
	let mut parsed = Vec::with_capacity(types.len());
	for raw in types {
		let upper = raw.trim().to_ascii_uppercase();
		let record_type = match RecordType::from_str(&upper) {
			Ok(rt) => rt,
			Err(_) => {
				let code: u16 = upper.parse()
					.map_err(|_| DnsError::InvalidRecordType(raw.clone()))?;
				debug!(code, "using RR type as integer");
				RecordType::from(code)
			}
		};
		parsed.push(record_type);
	}
	Ok(parsed)
}

/// Padding needed to align a message of `message_len` bytes to the next
/// 128-byte block, clamped so the message stays within `udp_buffer`.
pub fn padding_len(message_len: usize, udp_buffer: u16) -> usize {
	let pad = PADDING_BLOCK - message_len % PADDING_BLOCK;
	let limit = udp_buffer as usize;
	if message_len + pad > limit {
		limit.saturating_sub(message_len)
	} else {
		pad
	}
}

fn fqdn(name: &str) -> Result<Name, DnsError> {
	let trimmed = name.trim();
	let absolute = if trimmed.ends_with('.') {
		trimmed.to_string()
	} else {
		format!("{}.", trimmed)
	};
	Name::from_ascii(&absolute)
		.map_err(|e| DnsError::InvalidName(name.to_string(), e.to_string()))
}

fn pack(message: &Message) -> Result<Vec<u8>, DnsError> {
	message.to_vec().map_err(|e| DnsError::Pack(e.to_string()))
}

/// Build one query message per requested RR type, each with its own ID.
///
/// An OPT record is attached only when DNSSEC-OK, NSID, padding or a
/// client subnet is requested; its class carries the UDP payload size.
/// Padding is computed last, against the message as packed without it.
pub fn build_queries<R: Rng>(
	config: &QueryConfig,
	rng: &mut R,
) -> Result<Vec<DnsQuery>, DnsError> {
	let name = fqdn(&config.name)?;
	let subnet = config.edns.client_subnet.as_deref()
		.map(EdnsOptions::from_cidr)
		.transpose()?;

	let mut used_ids = HashSet::new();
	let mut queries = Vec::with_capacity(config.record_types.len());

	for &record_type in &config.record_types {
		let id = loop {
			let candidate: u16 = rng.gen();
			if used_ids.insert(candidate) {
				break candidate;
			}
		};

		let flags = &config.flags;
		let mut message = Message::new();
		message.set_id(id);
		message.set_message_type(MessageType::Query);
		message.set_op_code(OpCode::Query);
		message.set_authoritative(flags.authoritative);
		message.set_authentic_data(flags.authentic_data);
		message.set_checking_disabled(flags.checking_disabled);
		message.set_recursion_desired(flags.recursion_desired);
		message.set_recursion_available(flags.recursion_available);
		message.set_truncated(flags.truncated);

		let mut query = Query::query(name.clone(), record_type);
		query.set_query_class(DNSClass::from(config.class));
		message.add_query(query);

		if config.edns.any() {
			let mut edns = Edns::new();
			edns.set_max_payload(config.edns.udp_buffer);
			edns.set_dnssec_ok(config.edns.dnssec_ok);

			if config.edns.nsid {
				edns.options_mut().insert(EdnsOption::Unknown(EDNS_NSID, Vec::new()));
			}

			if let Some(subnet) = subnet {
				debug!(family = subnet.family(), address = %subnet.address, prefix = subnet.source_prefix, "EDNS0 client subnet");
				edns.options_mut().insert(EdnsOption::Subnet(ClientSubnet::new(
					subnet.address,
					subnet.source_prefix,
					0,
				)));
			}

			if config.edns.padding {
				*message.extensions_mut() = Some(edns.clone());
				let unpadded = pack(&message)?.len();
				let pad = padding_len(unpadded, edns.max_payload());
				debug!(pad, "padding query");
				edns.options_mut().insert(EdnsOption::Unknown(EDNS_PADDING, vec![0u8; pad]));
			}

			*message.extensions_mut() = Some(edns);
		}

		let mut wire = pack(&message)?;
		// Z is the reserved bit between RA and AD in the fourth header byte
		if flags.zero {
			wire[3] |= 0x40;
		}

		queries.push(DnsQuery { id, record_type, wire });
	}

	Ok(queries)
}

/// Unpack a DNS response, validating the transaction ID.
pub fn parse_response(bytes: &[u8], expected_id: u16, server: &str) -> Result<Message, DnsError> {
	let message = Message::from_vec(bytes).map_err(|e| DnsError::Unpack {
		server: server.to_string(),
		reason: e.to_string(),
	})?;

	if message.id() != expected_id {
		return Err(DnsError::Unpack {
			server: server.to_string(),
			reason: format!("txid mismatch: expected {}, got {}", expected_id, message.id()),
		});
	}
	if message.message_type() != MessageType::Response {
		return Err(DnsError::Unpack {
			server: server.to_string(),
			reason: "received a query instead of a response".to_string(),
		});
	}
	Ok(message)
}

/// Classify the answer section of a response
pub fn answers(message: &Message) -> Vec<Answer> {
	message.answers().iter()
		.map(|record| match record.data() {
			RData::A(a) => Answer::A(a.0),
			RData::AAAA(aaaa) => Answer::Aaaa(aaaa.0),
			_ => Answer::Other(record.record_type()),
		})
		.collect()
}

/// Collect A and AAAA addresses from every reply; CNAMEs are not chased.
pub fn extract_ips(replies: &[Message]) -> Vec<IpAddr> {
	replies.iter()
		.flat_map(answers)
		.filter_map(|answer| answer.ip())
		.collect()
}
