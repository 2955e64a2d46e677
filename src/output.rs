use std::io::Write;
use std::net::IpAddr;

use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};

use crate::stats::{format_bytes, EdgeTotals, Snapshot};
use crate::transport::{ForwardedFor, TlsIdentity, RunConfig};

/// Print a summary of the run configuration before starting.
pub fn print_config_summary(config: &RunConfig, corpus: &str) {
	println!("DoH ECS Download Configuration");
	println!("==============================");
	println!("Targets:        {}", config.targets.len());
	for url in config.targets.iter().take(10) {
		println!("  - {}", url);
	}
	if config.targets.len() > 10 {
		println!("  ... and {} more", config.targets.len() - 10);
	}
	println!("DoH servers:    {}", config.dns.servers.len());
	for server in &config.dns.servers {
		println!("  - {}", server);
	}
	println!("DoH method:     {}", config.dns.method);
	let types: Vec<String> = config.dns.record_types.iter().map(|t| t.to_string()).collect();
	println!("Record types:   {}", types.join(", "));
	println!("Subnet corpus:  {}", corpus);
	println!("Parallelism:    {}", config.parallelism);
	println!("Iterations:     {}", config.download.iterations);
	println!("Timeout:        {} ms", config.transport.timeout.as_millis());
	if let Some(ip) = config.transport.local_ip {
		println!("Local IP:       {}", ip);
	}
	let reuse_label = if config.transport.reuse_conn { "yes" } else { "no" };
	println!("Reuse conns:    {}", reuse_label);
	let xff = match &config.download.forwarded_for {
		ForwardedFor::Off => "off".to_string(),
		ForwardedFor::Random => "random".to_string(),
		ForwardedFor::Fixed(addr) => addr.clone(),
	};
	println!("X-Forwarded-For: {}", xff);
	if config.download.post_body.is_some() {
		println!("Method:         POST");
	}
	if let TlsIdentity::Impersonate { profile, .. } = &config.download.tls {
		println!("Impersonate:    {}", profile);
	}
	if let Some(seed) = config.seed {
		println!("Seed:           {}", seed);
	}
	println!();
}

/// Overwrite the current console line with the aggregate throughput.
pub fn print_throughput(snapshot: &Snapshot) {
	print!(
		"\rTotal download speed: {} Mbps, Total downloaded: {}    ",
		snapshot.speed_mbps(),
		format_bytes(snapshot.total_bytes),
	);
	let _ = std::io::stdout().flush();
}

/// Build the per-edge table printed when the run stops.
pub fn edge_table(edges: &[(IpAddr, EdgeTotals)]) -> Table {
	let mut table = Table::new();
	table.load_preset(UTF8_FULL);
	table.set_content_arrangement(ContentArrangement::Dynamic);
	table.set_header(vec!["Edge IP", "Tasks", "Downloaded"]);

	for (ip, totals) in edges {
		table.add_row(vec![
			ip.to_string(),
			totals.tasks.to_string(),
			format_bytes(totals.bytes),
		]);
	}
	table
}

pub fn print_edge_table(edges: &[(IpAddr, EdgeTotals)]) {
	if edges.is_empty() {
		println!("\nNo edge was reached.");
		return;
	}
	println!("\n\nEdge Summary");
	println!("============\n");
	println!("{}", edge_table(edges));
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_edge_table_rows() {
		let edges = vec![
			("192.0.2.1".parse().unwrap(), EdgeTotals { tasks: 3, bytes: 3 * 1024 * 1024 }),
			("2001:db8::7".parse().unwrap(), EdgeTotals { tasks: 1, bytes: 512 }),
		];
		let rendered = edge_table(&edges).to_string();
		assert!(rendered.contains("Edge IP"));
		assert!(rendered.contains("192.0.2.1"));
		assert!(rendered.contains("3.00MB"));
		assert!(rendered.contains("2001:db8::7"));
		assert!(rendered.contains("512B"));
	}
}
