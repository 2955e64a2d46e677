use std::net::{IpAddr, UdpSocket};

use anyhow::{anyhow, Result};
use reqwest::Url;
use tracing::{debug, trace};

use crate::dns::DnsError;

/// Canonical DoH query path
const DOH_PATH: &str = "/dns-query";

fn invalid(server: &str, reason: impl ToString) -> DnsError {
	DnsError::InvalidServer(server.to_string(), reason.to_string())
}

/// Remove an IPv6 zone from a bracketed literal ("[fe80::1%eth0]"),
/// returning the string without it and the zone including its '%'.
/// A '%' anywhere else (e.g. an escape in the path) is left alone.
fn split_zone(input: &str) -> (String, Option<String>) {
	let unchanged = || (input.to_string(), None);
	let Some(open) = input.find('[') else { return unchanged() };
	let Some(close) = input[open..].find(']').map(|offset| open + offset) else { return unchanged() };
	let Some((addr, zone)) = input[open + 1..close].split_once('%') else { return unchanged() };
	let addr_ok = !addr.is_empty() && addr.chars().all(|c| c.is_ascii_hexdigit() || c == ':');
	let zone_ok = !zone.is_empty() && zone.chars().all(|c| c.is_ascii_alphanumeric());
	if !addr_ok || !zone_ok {
		return unchanged();
	}

	let mut stripped = String::with_capacity(input.len());
	stripped.push_str(&input[..=open]);
	stripped.push_str(addr);
	stripped.push_str(&input[close..]);
	(stripped, Some(format!("%{}", zone)))
}

fn is_bare_ipv6(s: &str) -> bool {
	s.contains(':') && s.chars().all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.')
}

fn split_scheme(s: &str) -> Option<(&str, &str)> {
	let (scheme, rest) = s.split_once("://")?;
	if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
		return None;
	}
	Some((scheme, rest))
}

/// Normalize a DoH server string into "scheme://host:port/dns-query".
///
/// Supports formats:
///   "223.5.5.5"                -- no scheme, becomes plain://223.5.5.5:80
///   "2001:db8::1"              -- bare IPv6, bracketed first
///   "https://dns.alidns.com"   -- https defaults to port 443
///   "[fe80::1%eth0]:8053"      -- the zone is kept on the host
///
/// Normalizing an already normalized server returns it unchanged.
pub fn parse_server(input: &str) -> Result<String, DnsError> {
	let trimmed = input.trim();
	if trimmed.is_empty() {
		return Err(invalid(input, "empty server address"));
	}

	let (unzoned, zone) = split_zone(trimmed);
	if let Some(zone) = &zone {
		trace!(zone = %zone, server = %unzoned, "removed IPv6 zone");
	}

	let with_scheme = match split_scheme(&unzoned) {
		Some(_) => unzoned,
		None if is_bare_ipv6(&unzoned) => format!("plain://[{}]", unzoned),
		None => format!("plain://{}", unzoned),
	};
	let (scheme, rest) = split_scheme(&with_scheme)
		.ok_or_else(|| invalid(input, "missing scheme"))?;
	let scheme = scheme.to_ascii_lowercase();

	let authority = rest
		.split(|c: char| c == '/' || c == '?' || c == '#')
		.next()
		.unwrap_or_default();
	let authority = authority.rsplit('@').next().unwrap_or_default();

	let (host, port) = if let Some(inner) = authority.strip_prefix('[') {
		let (addr, tail) = inner.split_once(']')
			.ok_or_else(|| invalid(input, "unterminated IPv6 literal"))?;
		let port = match tail.strip_prefix(':') {
			Some(p) => Some(p),
			None if tail.is_empty() => None,
			None => return Err(invalid(input, format!("unexpected '{}' after host", tail))),
		};
		(format!("[{}]", addr), port)
	} else {
		match authority.rsplit_once(':') {
			Some((h, p)) => (h.to_string(), Some(p)),
			None => (authority.to_string(), None),
		}
	};

	if host.is_empty() || host == "[]" {
		return Err(invalid(input, "missing host"));
	}

	let port: u16 = match port {
		Some(p) => p.parse().map_err(|_| invalid(input, format!("invalid port '{}'", p)))?,
		None if scheme == "https" => 443,
		None => 80,
	};

	let normalized = format!("{}://{}:{}{}", scheme, host, port, DOH_PATH);
	Url::parse(&normalized).map_err(|e| invalid(input, e))?;

	let server = match zone {
		Some(zone) => normalized.replacen(']', &format!("{}]", zone), 1),
		None => normalized,
	};
	debug!(input = %trimmed, server = %server, "normalized DoH server");
	Ok(server)
}

/// Turn a normalized server into the URL actually requested.
///
/// "plain" is sent as plaintext http. Zones cannot be expressed in a
/// request URL and are dropped.
pub fn wire_url(server: &str) -> Result<Url, DnsError> {
	let (unzoned, _) = split_zone(server);
	let url = match unzoned.strip_prefix("plain://") {
		Some(rest) => format!("http://{}", rest),
		None => unzoned,
	};
	Url::parse(&url).map_err(|e| invalid(server, e))
}

/// Return the built-in public DoH endpoints.
pub fn default_servers() -> Vec<String> {
	[
		"https://dns.alidns.com/dns-query",
		"https://223.5.5.5/dns-query",
		"https://223.6.6.6/dns-query",
		"https://doh.pub/dns-query",
		"https://1.12.12.12/dns-query",
		"https://120.53.53.53/dns-query",
		"https://sm2.doh.pub/dns-query",
		"https://doh.360.cn/dns-query",
	]
	.iter()
	.map(|s| s.to_string())
	.collect()
}

/// Check that the local bind address belongs to this host.
pub fn validate_local_ip(input: &str) -> Result<IpAddr> {
	let trimmed = input.trim();
	if trimmed.is_empty() {
		return Err(anyhow!("a local IP address is required"));
	}
	let ip: IpAddr = trimmed.parse()
		.map_err(|e| anyhow!("invalid local IP address '{}': {}", trimmed, e))?;
	if ip.is_unspecified() {
		return Err(anyhow!("local IP address {} is not an interface address", ip));
	}
	UdpSocket::bind((ip, 0))
		.map_err(|e| anyhow!("local IP address {} is not usable on this host: {}", ip, e))?;
	Ok(ip)
}
