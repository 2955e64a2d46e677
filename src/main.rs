mod bench;
mod cli;
mod dns;
mod doh;
mod download;
mod links;
mod output;
mod resolver;
mod stats;
mod subnets;
#[cfg(test)]
mod test_support;
mod tls;
mod transport;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::bench::Orchestrator;
use crate::cli::Cli;
use crate::subnets::{CorpusProvider, EmbeddedCorpus, FileCorpus, SubnetSampler};
use crate::transport::{
	DnsSettings, DownloadSettings, EdnsRequest, ForwardedFor, HeaderFlags, HttpMethod,
	RunConfig, TlsIdentity, TlsSettings, TransportSettings,
};

fn init_logging(level: &str) {
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(level));

	tracing_subscriber::registry()
		.with(filter)
		.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
		.init();
}

fn tls_settings(cli: &Cli) -> TlsSettings {
	TlsSettings {
		insecure_skip_verify: cli.tls_insecure_skip_verify,
		server_name: cli.tls_server_name.clone(),
		min_version: cli.tls_min_version.clone(),
		max_version: cli.tls_max_version.clone(),
		next_protos: cli.tls_next_protos.clone(),
		cipher_suites: cli.tls_cipher_suites.clone(),
		curves: cli.tls_curves.clone(),
		client_cert: cli.tls_client_cert.as_ref().map(PathBuf::from),
		client_key: cli.tls_client_key.as_ref().map(PathBuf::from),
		key_log_file: cli.tls_key_log_file.as_ref().map(PathBuf::from),
	}
}

/// Turn the command line into the configuration record, validating every
/// field that can be checked before the first round.
async fn build_config(cli: &Cli) -> Result<RunConfig> {
	if cli.parallel == 0 {
		bail!("--parallel must be greater than 0");
	}

	let local_ip = resolver::validate_local_ip(&cli.local_ip)?;
	let tls = tls_settings(cli);
	// Surface bad TLS options now rather than inside the first task
	tls::standard_config(&tls, &[])?;

	let transport = Arc::new(TransportSettings {
		local_ip: Some(local_ip),
		timeout: Duration::from_millis(cli.timeout),
		reuse_conn: cli.reuse_conn,
		user_agent: cli.user_agent.clone(),
		tls: tls.clone(),
	});

	let servers = if cli.doh_servers.is_empty() {
		resolver::default_servers()
	} else {
		cli.doh_servers.iter()
			.map(|s| resolver::parse_server(s))
			.collect::<Result<Vec<_>, _>>()?
	};
	let method: HttpMethod = cli.doh_method.parse()?;
	let record_types = dns::parse_record_types(&cli.qtypes)?;

	let dns = DnsSettings {
		servers,
		method,
		record_types,
		class: cli.class,
		flags: HeaderFlags {
			authoritative: cli.aa,
			authentic_data: cli.ad,
			checking_disabled: cli.cd,
			recursion_desired: !cli.no_rd,
			recursion_available: cli.ra,
			zero: cli.z,
			truncated: cli.tc,
		},
		edns: EdnsRequest {
			dnssec_ok: cli.dnssec,
			nsid: cli.nsid,
			padding: cli.pad,
			client_subnet: None,
			udp_buffer: cli.udp_buffer,
		},
	};

	let download_tls = match cli.impersonate {
		Some(profile) => {
			tls::impersonated_config(profile, &tls)?;
			TlsIdentity::Impersonate { profile, settings: tls }
		}
		None => TlsIdentity::Standard(tls),
	};
	let download = DownloadSettings {
		iterations: cli.iterations,
		referer: cli.referer.clone(),
		forwarded_for: cli.x_forwarded_for.parse::<ForwardedFor>()
			.with_context(|| format!("--x-forwarded-for {:?} is not random, off, or an IP address", cli.x_forwarded_for))?,
		post_body: cli.post_body.clone(),
		tls: download_tls,
		max_restarts: cli.max_restarts,
	};

	let mut targets = Vec::new();
	if let Some(url) = &cli.url {
		targets.push(links::parse_target(url)?);
	}
	if let Some(path) = &cli.url_file {
		targets.extend(links::read_url_file(path)?);
	}
	if cli.crawler {
		let mut harvested = Vec::new();
		for url in &targets {
			harvested.extend(links::harvest_links(url, transport.clone()).await);
		}
		let mut seen = HashSet::new();
		harvested.retain(|url| seen.insert(url.clone()));
		targets = harvested;
	}
	info!(targets = targets.len(), "download targets ready");

	Ok(RunConfig {
		targets,
		parallelism: cli.parallel,
		transport,
		dns,
		download,
		subnet_file: cli.subnet_file.as_ref().map(PathBuf::from),
		report_interval: Duration::from_secs(cli.report_interval.max(1)),
		seed: cli.seed,
	})
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	init_logging(&cli.log_level);

	let config = build_config(&cli).await?;

	let corpus: Box<dyn CorpusProvider> = match &config.subnet_file {
		Some(path) => Box::new(FileCorpus::new(path.clone())),
		None => Box::new(EmbeddedCorpus::default()),
	};
	let sampler = SubnetSampler::new(corpus);

	output::print_config_summary(&config, &sampler.describe());

	let token = CancellationToken::new();
	let ctrl_c = token.clone();
	tokio::spawn(async move {
		match tokio::signal::ctrl_c().await {
			Ok(()) => {
				info!("interrupted, stopping");
				ctrl_c.cancel();
			}
			Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
		}
	});

	let mut orchestrator = Orchestrator::new(config, sampler)?;
	let board = orchestrator.board();
	let result = orchestrator.run(token).await;

	output::print_throughput(&board.snapshot());
	output::print_edge_table(&board.edge_summary());
	result
}
