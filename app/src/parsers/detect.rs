// ==============================================================================
// parsers/detect.rs - Raw File Format Detection
// ==============================================================================
// Description: Detects text encoding and column layout of uploaded genotype files
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================
// Supported layouts:
//   VCF            ##fileformat=VCFv4.x preamble
//   Header         first data line names the columns (rsid + genotype, or
//                  rsid + allele1/allele2; chromosome/position optional)
//   Headerless     4-column array export: rsid, chromosome, position, genotype
// Detection samples at most SAMPLE_BYTES of (decompressed) content and is run
// once per file; the result drives the whole parse.
// ==============================================================================

use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8};
use encoding_rs_io::DecodeReaderBytesBuilder;
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Bytes sampled for encoding and layout detection
pub const SAMPLE_BYTES: usize = 200 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

const RSID_ALIASES: &[&str] = &["rsid", "rs_id", "snp", "snp_id", "snpid", "marker", "name", "id"];
const CHROMOSOME_ALIASES: &[&str] = &["chromosome", "chrom", "chr"];
const POSITION_ALIASES: &[&str] = &["position", "pos", "bp", "coordinate"];
const GENOTYPE_ALIASES: &[&str] = &["genotype", "result", "call", "gt"];
const ALLELE1_ALIASES: &[&str] = &["allele1", "allele_1", "allele 1", "a1", "allele1 - forward", "allele1 - top"];
const ALLELE2_ALIASES: &[&str] = &["allele2", "allele_2", "allele 2", "a2", "allele2 - forward", "allele2 - top"];

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Unsupported header layout: '{0}' (need an rsid column plus genotype or allele1/allele2)")]
    UnsupportedLayout(String),
}

/// Where the allele information lives in a headed file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlleleColumns {
    /// Explicit allele1/allele2 columns
    Pair { allele1: usize, allele2: usize },
    /// Single genotype column, split into two alleles
    Genotype(usize),
}

/// Column indexes resolved from a header line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMap {
    pub rsid: usize,
    pub chromosome: Option<usize>,
    pub position: Option<usize>,
    pub alleles: AlleleColumns,
}

impl ColumnMap {
    /// Fewest fields a data line needs to be usable
    pub fn min_fields(&self) -> usize {
        let allele_max = match self.alleles {
            AlleleColumns::Pair { allele1, allele2 } => allele1.max(allele2),
            AlleleColumns::Genotype(idx) => idx,
        };
        [Some(self.rsid), self.chromosome, self.position, Some(allele_max)]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Build a column map from already lower-cased, trimmed header fields
    pub fn from_header(fields: &[String]) -> Option<Self> {
        let find = |aliases: &[&str]| fields.iter().position(|f| aliases.contains(&f.as_str()));

        let rsid = find(RSID_ALIASES)?;
        let alleles = match (find(ALLELE1_ALIASES), find(ALLELE2_ALIASES), find(GENOTYPE_ALIASES)) {
            (Some(allele1), Some(allele2), _) => AlleleColumns::Pair { allele1, allele2 },
            (_, _, Some(genotype)) => AlleleColumns::Genotype(genotype),
            _ => return None,
        };

        Some(Self {
            rsid,
            chromosome: find(CHROMOSOME_ALIASES),
            position: find(POSITION_ALIASES),
            alleles,
        })
    }
}

/// Column layout of a raw file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    Vcf,
    /// Header line present; data starts after it
    Header(ColumnMap),
    /// rsid, chromosome, position, genotype with no header
    Headerless,
    /// No data lines in the sampled prefix
    Empty,
}

/// Detection result, computed once per file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub encoding: &'static Encoding,
    pub layout: Layout,
    pub gzipped: bool,
}

/// Detect encoding and layout of a stored file
pub fn detect(path: &Path) -> Result<Detection, DetectError> {
    let gzipped = is_gzipped(path)?;
    let sample = read_sample(path, gzipped)?;
    let truncated = sample.len() == SAMPLE_BYTES;

    let encoding = detect_encoding(&sample);
    let (text, _, _) = encoding.decode(&sample);

    // Drop a trailing partial line when the sample was cut short
    let text = if truncated {
        match text.rfind('\n') {
            Some(idx) => &text[..idx],
            None => &text[..],
        }
    } else {
        &text[..]
    };

    let layout = detect_layout(text)?;
    debug!(
        "Detected {:?} layout, {} encoding (gzip: {}) for {:?}",
        layout,
        encoding.name(),
        gzipped,
        path
    );

    Ok(Detection {
        encoding,
        layout,
        gzipped,
    })
}

/// Open a detected file as a UTF-8 line stream
pub fn open_text(path: &Path, detection: &Detection) -> Result<Box<dyn BufRead + Send>, DetectError> {
    let file = File::open(path)?;
    let raw: Box<dyn Read + Send> = if detection.gzipped {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let decoded = DecodeReaderBytesBuilder::new()
        .encoding(Some(detection.encoding))
        .strip_bom(true)
        .build(raw);

    Ok(Box::new(BufReader::new(decoded)))
}

/// Split a line on tabs, falling back to runs of whitespace when too short
pub fn split_fields(line: &str, min_fields: usize) -> Vec<&str> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() >= min_fields {
        return fields;
    }
    line.split_whitespace().collect()
}

fn is_gzipped(path: &Path) -> Result<bool, DetectError> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let mut read = 0;
    while read < magic.len() {
        let n = file.read(&mut magic[read..])?;
        if n == 0 {
            return Ok(false);
        }
        read += n;
    }
    Ok(magic == GZIP_MAGIC)
}

fn read_sample(path: &Path, gzipped: bool) -> Result<Vec<u8>, DetectError> {
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if gzipped {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut sample = Vec::with_capacity(8192);
    reader.take(SAMPLE_BYTES as u64).read_to_end(&mut sample)?;
    Ok(sample)
}

/// BOM, then UTF-8 validity, then statistical detection; UTF-8 when inconclusive
pub fn detect_encoding(sample: &[u8]) -> &'static Encoding {
    if let Some((encoding, _)) = Encoding::for_bom(sample) {
        return encoding;
    }
    if sample.is_empty() {
        return UTF_8;
    }

    match std::str::from_utf8(sample) {
        Ok(_) => return UTF_8,
        // Sample ended inside a multi-byte sequence
        Err(e) if e.error_len().is_none() => return UTF_8,
        Err(_) => {}
    }

    let mut detector = EncodingDetector::new();
    detector.feed(sample, true);
    detector.guess(None, true)
}

fn detect_layout(text: &str) -> Result<Layout, DetectError> {
    let mut lines = text
        .lines()
        .map(|l| l.trim_start_matches('\u{feff}'))
        .filter(|l| !l.trim().is_empty());

    let first = match lines.next() {
        Some(line) => line,
        None => return Ok(Layout::Empty),
    };

    if first.starts_with("##fileformat=VCF") {
        return Ok(Layout::Vcf);
    }

    let header = match std::iter::once(first)
        .chain(lines)
        .find(|l| !l.trim_start().starts_with('#'))
    {
        Some(line) => line,
        None => return Ok(Layout::Empty),
    };

    let fields: Vec<String> = split_fields(header, 2)
        .into_iter()
        .map(|f| f.trim().to_lowercase())
        .collect();

    if let Some(map) = ColumnMap::from_header(&fields) {
        return Ok(Layout::Header(map));
    }

    // A line naming an rsid column without usable allele columns is a header we
    // cannot interpret; anything else is treated as the first data line.
    if fields.iter().any(|f| RSID_ALIASES.contains(&f.as_str())) {
        return Err(DetectError::UnsupportedLayout(header.to_string()));
    }

    Ok(Layout::Headerless)
}
