// ==============================================================================
// parsers/vcf.rs - VCF Call Normalizer
// ==============================================================================
// Description: Per-sample genotype calls and site streams from VCF files
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================
// References:
// - VCF 4.2 Spec: https://samtools.github.io/hts-specs/VCFv4.2.pdf
// - noodles-vcf: https://docs.rs/noodles-vcf/0.81.0/noodles_vcf/
// ==============================================================================

use noodles_vcf as vcf;
use std::io::{self, BufRead};

use crate::models::{CallRecord, JobId, NO_CALL};
use crate::parsers::genotype_array::{
    normalize_chromosome, parse_position, LineOutcome, NormalizeError, NormalizeSummary, SkipReason,
};

/// CHROM POS ID REF ALT QUAL FILTER INFO
pub const FIXED_COLUMNS: usize = 8;

const FORMAT_COLUMN: usize = 8;

/// Minimal header used for sites-only payloads
pub const SITES_ONLY_HEADER: &str = "##fileformat=VCFv4.2\n#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n";

/// Normalizer for VCF files: one call record per sample per site
#[derive(Debug, Clone)]
pub struct VcfNormalizer {
    job_id: JobId,
    sample_labels: Vec<String>,
}

impl VcfNormalizer {
    pub fn new(job_id: JobId, sample_labels: Vec<String>) -> Self {
        Self { job_id, sample_labels }
    }

    /// Read the VCF header and build a normalizer for its samples
    ///
    /// A single-sample file is labelled with `job_label`; multi-sample files
    /// keep the header's sample names. Returns the reader positioned at the
    /// first data line.
    pub fn from_reader<R: BufRead>(
        job_id: JobId,
        job_label: &str,
        reader: R,
    ) -> Result<(Self, vcf::io::Reader<R>), NormalizeError> {
        let mut reader = vcf::io::Reader::new(reader);
        let header = reader
            .read_header()
            .map_err(|e| NormalizeError::Vcf(format!("Failed to read VCF header: {}", e)))?;

        let names: Vec<String> = header.sample_names().iter().cloned().collect();
        let labels = if names.len() == 1 {
            vec![job_label.to_string()]
        } else {
            names
        };

        Ok((Self::new(job_id, labels), reader))
    }

    pub fn sample_labels(&self) -> &[String] {
        &self.sample_labels
    }

    /// Normalize one data line into one outcome per sample
    pub fn normalize_line(&self, line: &str) -> Vec<LineOutcome> {
        let line = line.trim_end_matches(['\r', '\n']);
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 5 {
            return vec![LineOutcome::Skipped(SkipReason::MalformedSite)];
        }
        if fields.len() <= FORMAT_COLUMN + 1 || self.sample_labels.is_empty() {
            return vec![LineOutcome::Skipped(SkipReason::NoSamples)];
        }

        let (chrom, pos, id, reference, alt) = (fields[0], fields[1], fields[2], fields[3], fields[4]);
        let alternates: Vec<&str> = alt.split(',').collect();
        let rsid = site_id(chrom, pos, id, reference, alt);
        let chromosome = normalize_chromosome(chrom);
        let position = parse_position(pos);
        let gt_index = fields[FORMAT_COLUMN].split(':').position(|key| key == "GT");

        fields[FORMAT_COLUMN + 1..]
            .iter()
            .zip(self.sample_labels.iter())
            .map(|(sample, label)| {
                let gt = gt_index.and_then(|idx| sample.split(':').nth(idx)).unwrap_or("");
                match resolve_gt(gt, reference, &alternates) {
                    Ok((allele1, allele2)) => LineOutcome::Accepted(CallRecord {
                        job_id: self.job_id,
                        sample_label: label.clone(),
                        rsid: rsid.clone(),
                        chromosome: chromosome.clone(),
                        position,
                        genotype: Some(gt.to_string()),
                        allele1: Some(allele1),
                        allele2: Some(allele2),
                        raw_line: line.to_string(),
                    }),
                    Err(reason) => LineOutcome::Skipped(reason),
                }
            })
            .collect()
    }

    /// Normalize every data line of a reader positioned after the header
    pub fn normalize<R: BufRead>(&self, reader: R) -> Result<(Vec<CallRecord>, NormalizeSummary), NormalizeError> {
        let mut records = Vec::new();
        let mut summary = NormalizeSummary::default();

        for (idx, line) in site_lines(reader).enumerate() {
            let line = line.map_err(|source| NormalizeError::Io { line: idx + 1, source })?;
            for outcome in self.normalize_line(&line) {
                match outcome {
                    LineOutcome::Accepted(record) => {
                        summary.accepted += 1;
                        records.push(record);
                    }
                    LineOutcome::Skipped(reason) => summary.record_skip(&reason),
                }
            }
        }

        Ok((records, summary))
    }
}

/// ID column, or `chrom:pos:ref:alt` when it is missing
fn site_id(chrom: &str, pos: &str, id: &str, reference: &str, alt: &str) -> String {
    match id.split(';').next().map(str::trim) {
        Some(first) if !first.is_empty() && first != "." => first.to_string(),
        _ => format!("{}:{}:{}:{}", chrom, pos, reference, alt),
    }
}

/// Translate a GT value into two allele strings
fn resolve_gt(gt: &str, reference: &str, alternates: &[&str]) -> Result<(String, String), SkipReason> {
    if gt.is_empty() {
        return Err(SkipReason::MissingGenotype);
    }

    let allele = |token: &str| -> Result<String, SkipReason> {
        if token == "." {
            return Ok(NO_CALL.to_string());
        }
        let index: usize = token
            .parse()
            .map_err(|_| SkipReason::UnrecognizedGenotype(gt.to_string()))?;
        match index {
            0 => Ok(reference.to_string()),
            n => alternates
                .get(n - 1)
                .map(|a| a.to_string())
                .ok_or_else(|| SkipReason::UnrecognizedGenotype(gt.to_string())),
        }
    };

    let tokens: Vec<&str> = gt.split(['/', '|']).collect();
    match tokens.as_slice() {
        [haploid] => {
            let a = allele(*haploid)?;
            Ok((a.clone(), a))
        }
        [first, second] => Ok((allele(*first)?, allele(*second)?)),
        _ => Err(SkipReason::UnrecognizedGenotype(gt.to_string())),
    }
}

/// Data lines of a VCF stream (header and meta lines skipped)
pub fn site_lines<R: BufRead>(reader: R) -> impl Iterator<Item = io::Result<String>> {
    reader.lines().filter(|line| match line {
        Ok(l) => !l.starts_with('#') && !l.trim().is_empty(),
        Err(_) => true,
    })
}

/// Truncate a data line to its eight fixed columns
pub fn sites_only(line: &str) -> &str {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.match_indices('\t').nth(FIXED_COLUMNS - 1) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}
