use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::{Client, Url};
use scraper::{Html, Selector};
use tracing::{info, warn};

use crate::tls;
use crate::transport::TransportSettings;

/// User-Agent sent when fetching the page to crawl
pub const CRAWLER_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 6.0; Nexus 5 Build/MRA58N) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36 Edg/124.0.0.0";

/// Elements carrying a resource link, and the attribute holding it
const LINK_SOURCES: &[(&str, &str)] = &[
	("a[href]", "href"),
	("link[href]", "href"),
	("img[src]", "src"),
	("script[src]", "src"),
	("source[src]", "src"),
];

/// Parse a download target: an http or https URL naming a host by name.
/// IP-literal hosts are refused since the edge address comes from DoH.
pub fn parse_target(input: &str) -> Result<Url> {
	let url = Url::parse(input.trim()).with_context(|| format!("invalid URL {:?}", input))?;
	if !matches!(url.scheme(), "http" | "https") {
		bail!("URL {} must be http or https", url);
	}
	let Some(host) = url.host_str() else { bail!("URL {} has no host", url) };
	if is_ip_literal(host) {
		bail!("URL {} names an IP address, a hostname is needed to resolve edges", url);
	}
	Ok(url)
}

/// True for "192.0.2.1" and "[2001:db8::1]"
pub fn is_ip_literal(host: &str) -> bool {
	host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>().is_ok()
}

/// Read download URLs from a file, one per line.
/// Lines starting with '#' and blank lines are skipped.
pub fn read_url_file(path: &str) -> Result<Vec<Url>> {
	let content = fs::read_to_string(path)
		.with_context(|| format!("reading URL file {}", path))?;
	let mut urls = Vec::new();
	for (lineno, line) in content.lines().enumerate() {
		let line = line.trim();
		if line.is_empty() || line.starts_with('#') {
			continue;
		}
		let url = parse_target(line)
			.with_context(|| format!("{}:{}", path, lineno + 1))?;
		urls.push(url);
	}
	if urls.is_empty() {
		return Err(anyhow!("URL file {} contains no URLs", path));
	}
	Ok(urls)
}

fn is_blocked_host(url: &Url) -> bool {
	match url.host_str() {
		Some(host) => host == "gov.cn" || host.ends_with(".gov.cn"),
		None => true,
	}
}

fn accept_link(raw: &str) -> Option<Url> {
	let raw = raw.trim();
	if raw.starts_with("javascript:") {
		return None;
	}
	let absolute = if raw.starts_with("//") {
		format!("https:{}", raw)
	} else {
		raw.to_string()
	};
	let url = Url::parse(&absolute).ok()?;
	if !matches!(url.scheme(), "http" | "https") || is_blocked_host(&url) {
		return None;
	}
	if url.host_str().is_some_and(is_ip_literal) {
		return None;
	}
	Some(url)
}

/// Collect absolute resource links from an HTML page, in document order and
/// without duplicates. Relative links are not followed.
pub fn extract_links(html: &str) -> Vec<Url> {
	let document = Html::parse_document(html);
	let selectors: Vec<(Selector, &str)> = LINK_SOURCES.iter()
		.filter_map(|(css, attr)| Selector::parse(css).ok().map(|s| (s, *attr)))
		.collect();

	let mut seen = HashSet::new();
	let mut links = Vec::new();
	for element in document.root_element().descendants().filter_map(scraper::ElementRef::wrap) {
		for (selector, attr) in &selectors {
			if !selector.matches(&element) {
				continue;
			}
			if let Some(url) = element.value().attr(attr).and_then(accept_link) {
				if seen.insert(url.clone()) {
					links.push(url);
				}
			}
		}
	}
	links
}

async fn fetch_page(url: &Url, transport: &TransportSettings) -> Result<String> {
	let tls_config = tls::standard_config(&transport.tls, &["http/1.1"])?;
	let mut builder = Client::builder()
		.use_preconfigured_tls(tls_config)
		.no_proxy()
		.timeout(transport.timeout);
	if let Some(ip) = transport.local_ip {
		builder = builder.local_address(ip);
	}
	let client = builder.build()?;
	let response = client.get(url.clone())
		.header(reqwest::header::USER_AGENT, CRAWLER_USER_AGENT)
		.send()
		.await?;
	let status = response.status();
	if !status.is_success() {
		return Err(anyhow!("crawling {} returned status {}", url, status.as_u16()));
	}
	Ok(response.text().await?)
}

/// Fetch `url` once and return the links found on it. Falls back to `url`
/// itself when the page cannot be fetched or has no usable links.
pub async fn harvest_links(url: &Url, transport: Arc<TransportSettings>) -> Vec<Url> {
	match fetch_page(url, &transport).await {
		Ok(html) => {
			let links = extract_links(&html);
			if links.is_empty() {
				warn!(url = %url, "crawled page has no usable links, downloading the page itself");
				return vec![url.clone()];
			}
			info!(url = %url, links = links.len(), "crawled links");
			links
		}
		Err(e) => {
			warn!(url = %url, error = %e, "crawling failed, downloading the page itself");
			vec![url.clone()]
		}
	}
}
