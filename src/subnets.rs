use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor};
use std::path::PathBuf;

use rand::Rng;
use tracing::debug;

/// CIDR blocks bundled into the binary, one per line
const BUNDLED_CIDRS: &str = include_str!("../data/cidr.txt");

/// A source of newline-delimited CIDR blocks
pub trait CorpusProvider: Send + Sync {
	fn open(&self) -> io::Result<Box<dyn BufRead + '_>>;
	fn describe(&self) -> String;
}

pub struct EmbeddedCorpus {
	data: &'static str,
}

impl EmbeddedCorpus {
	pub fn new(data: &'static str) -> Self {
		Self { data }
	}
}

impl Default for EmbeddedCorpus {
	fn default() -> Self {
		Self::new(BUNDLED_CIDRS)
	}
}

impl CorpusProvider for EmbeddedCorpus {
	fn open(&self) -> io::Result<Box<dyn BufRead + '_>> {
		Ok(Box::new(Cursor::new(self.data.as_bytes())))
	}

	fn describe(&self) -> String {
		"bundled CIDR list".to_string()
	}
}

pub struct FileCorpus {
	path: PathBuf,
}

impl FileCorpus {
	pub fn new(path: PathBuf) -> Self {
		Self { path }
	}
}

impl CorpusProvider for FileCorpus {
	fn open(&self) -> io::Result<Box<dyn BufRead + '_>> {
		let file = File::open(&self.path)?;
		Ok(Box::new(BufReader::new(file)))
	}

	fn describe(&self) -> String {
		self.path.display().to_string()
	}
}

/// Draw min(k, n) lines uniformly from `reader` in one pass (Algorithm R).
///
/// Blank lines and '#' comments are not part of the corpus. A read error
/// discards the reservoir.
pub fn reservoir_sample<B: BufRead, R: Rng>(reader: B, k: usize, rng: &mut R) -> io::Result<Vec<String>> {
	let mut reservoir: Vec<String> = Vec::with_capacity(k);
	if k == 0 {
		return Ok(reservoir);
	}

	let mut seen: u64 = 0;
	for line in reader.lines() {
		let line = line?;
		let trimmed = line.trim();
		if trimmed.is_empty() || trimmed.starts_with('#') {
			continue;
		}
		seen += 1;
		if reservoir.len() < k {
			reservoir.push(trimmed.to_string());
		} else {
			let j = rng.gen_range(0..seen);
			if (j as usize) < k {
				reservoir[j as usize] = trimmed.to_string();
			}
		}
	}
	Ok(reservoir)
}

/// Samples client subnets from a corpus
pub struct SubnetSampler {
	corpus: Box<dyn CorpusProvider>,
}

impl SubnetSampler {
	pub fn new(corpus: Box<dyn CorpusProvider>) -> Self {
		Self { corpus }
	}

	pub fn describe(&self) -> String {
		self.corpus.describe()
	}

	pub fn sample<R: Rng>(&self, k: usize, rng: &mut R) -> io::Result<Vec<String>> {
		let reader = self.corpus.open()?;
		let subnets = reservoir_sample(reader, k, rng)?;
		debug!(corpus = %self.corpus.describe(), requested = k, drawn = subnets.len(), "sampled subnets");
		Ok(subnets)
	}
}
