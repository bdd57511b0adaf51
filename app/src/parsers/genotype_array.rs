// ==============================================================================
// genotype_array.rs - Genotype Array Record Normalizer
// ==============================================================================
// Description: Maps consumer genotype array rows to canonical call records
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================
// Format examples:
//   23andMe (headerless after comments):
//     # rsid    chromosome    position    genotype
//     rs548049170    1    69869    TT
//     rs13328684    1    74792    --
//   AncestryDNA (header with allele columns):
//     rsid    chromosome    position    allele1    allele2
//     rs3131972    1    752721    A    G
// ==============================================================================

use std::collections::BTreeMap;
use std::io::BufRead;
use thiserror::Error;

use crate::models::{CallRecord, JobId, NO_CALL};
use crate::parsers::detect::{split_fields, AlleleColumns, ColumnMap, Layout};

/// Genotype tokens that mean "no call"
const NO_CALL_TOKENS: [&str; 3] = ["--", "00", "NN"];

/// Column count of the headerless export
const HEADERLESS_FIELDS: usize = 4;

/// Why a line did not produce a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    TooFewFields { found: usize, needed: usize },
    MissingRsid,
    MissingGenotype,
    UnrecognizedGenotype(String),
    /// VCF site without sample columns
    NoSamples,
    /// VCF line with malformed fixed columns
    MalformedSite,
}

impl SkipReason {
    pub fn kind(&self) -> &'static str {
        match self {
            SkipReason::TooFewFields { .. } => "too_few_fields",
            SkipReason::MissingRsid => "missing_rsid",
            SkipReason::MissingGenotype => "missing_genotype",
            SkipReason::UnrecognizedGenotype(_) => "unrecognized_genotype",
            SkipReason::NoSamples => "no_samples",
            SkipReason::MalformedSite => "malformed_site",
        }
    }
}

/// Result of normalizing one data line
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    Accepted(CallRecord),
    Skipped(SkipReason),
}

/// Errors that abort normalization of a file
#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("IO error at line {line}: {source}")]
    Io {
        line: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Layout {0:?} is not a genotype array layout")]
    WrongLayout(Layout),

    #[error("Invalid VCF input: {0}")]
    Vcf(String),
}

/// Per-file counts, logged and recorded on the job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeSummary {
    pub accepted: usize,
    pub skipped: BTreeMap<&'static str, usize>,
}

impl NormalizeSummary {
    pub fn record_skip(&mut self, reason: &SkipReason) {
        *self.skipped.entry(reason.kind()).or_insert(0) += 1;
    }

    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }

    pub fn merge(&mut self, other: NormalizeSummary) {
        self.accepted += other.accepted;
        for (kind, count) in other.skipped {
            *self.skipped.entry(kind).or_insert(0) += count;
        }
    }
}

/// Strip "chromosome"/"chr" prefixes and unify sex/mitochondrial codes
///
/// 23 -> X, 24 -> Y, M/MT -> MT. Blank input yields None.
pub fn normalize_chromosome(raw: &str) -> Option<String> {
    let mut token = raw.trim();
    for prefix in ["chromosome", "chr"] {
        if let Some(head) = token.get(..prefix.len()) {
            if head.eq_ignore_ascii_case(prefix) {
                token = token[prefix.len()..].trim_start_matches(['_', ' ']);
                break;
            }
        }
    }

    let token = token.trim().to_ascii_uppercase();
    match token.as_str() {
        "" => None,
        "23" => Some("X".to_string()),
        "24" => Some("Y".to_string()),
        "M" | "MT" => Some("MT".to_string()),
        _ => Some(token),
    }
}

/// Integer positions only; anything else is unknown
pub fn parse_position(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok()
}

/// Split a genotype token into two alleles
pub fn split_genotype(token: &str) -> Result<(String, String), SkipReason> {
    let token = token.trim();
    if token.is_empty() {
        return Err(SkipReason::MissingGenotype);
    }
    if is_no_call(token) {
        return Ok((NO_CALL.to_string(), NO_CALL.to_string()));
    }

    let alleles: Vec<char> = token.chars().filter(|c| !matches!(c, '/' | '|')).collect();
    match alleles.as_slice() {
        [single] => Ok((single.to_string(), single.to_string())),
        [first, second] => Ok((first.to_string(), second.to_string())),
        _ => Err(SkipReason::UnrecognizedGenotype(token.to_string())),
    }
}

fn is_no_call(token: &str) -> bool {
    NO_CALL_TOKENS.iter().any(|t| t.eq_ignore_ascii_case(token))
}

fn non_empty(field: Option<&&str>) -> Option<String> {
    field
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .map(str::to_string)
}

/// Normalizer for genotype array exports (header or headerless layouts)
#[derive(Debug, Clone)]
pub struct ArrayNormalizer {
    job_id: JobId,
    sample_label: String,
    columns: ArrayColumns,
}

#[derive(Debug, Clone, Copy)]
enum ArrayColumns {
    Header(ColumnMap),
    Headerless,
}

impl ArrayNormalizer {
    pub fn new(job_id: JobId, sample_label: impl Into<String>, layout: &Layout) -> Result<Self, NormalizeError> {
        let columns = match layout {
            Layout::Header(map) => ArrayColumns::Header(*map),
            Layout::Headerless | Layout::Empty => ArrayColumns::Headerless,
            other => return Err(NormalizeError::WrongLayout(other.clone())),
        };
        Ok(Self {
            job_id,
            sample_label: sample_label.into(),
            columns,
        })
    }

    fn min_fields(&self) -> usize {
        match self.columns {
            ArrayColumns::Header(map) => map.min_fields(),
            ArrayColumns::Headerless => HEADERLESS_FIELDS,
        }
    }

    /// Normalize one data line (caller has already dropped blanks, comments and the header)
    pub fn normalize_line(&self, line: &str) -> LineOutcome {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let needed = self.min_fields();
        let fields = split_fields(trimmed, needed);
        if fields.len() < needed {
            return LineOutcome::Skipped(SkipReason::TooFewFields {
                found: fields.len(),
                needed,
            });
        }

        let (rsid_idx, chrom_idx, pos_idx, alleles) = match self.columns {
            ArrayColumns::Header(map) => (map.rsid, map.chromosome, map.position, map.alleles),
            ArrayColumns::Headerless => (0, Some(1), Some(2), AlleleColumns::Genotype(3)),
        };

        let rsid = match non_empty(fields.get(rsid_idx)) {
            Some(rsid) => rsid,
            None => return LineOutcome::Skipped(SkipReason::MissingRsid),
        };

        let (allele1, allele2, genotype) = match alleles {
            AlleleColumns::Genotype(idx) => {
                let token = fields.get(idx).map(|f| f.trim()).unwrap_or("");
                match split_genotype(token) {
                    Ok((a1, a2)) => (Some(a1), Some(a2), Some(token.to_string())),
                    Err(reason) => return LineOutcome::Skipped(reason),
                }
            }
            AlleleColumns::Pair { allele1, allele2 } => {
                match (non_empty(fields.get(allele1)), non_empty(fields.get(allele2))) {
                    (None, None) => return LineOutcome::Skipped(SkipReason::MissingGenotype),
                    (Some(a1), Some(a2)) => {
                        let genotype = format!("{}{}", a1, a2);
                        if is_no_call(&genotype) {
                            (Some(NO_CALL.to_string()), Some(NO_CALL.to_string()), Some(genotype))
                        } else {
                            (Some(a1), Some(a2), Some(genotype))
                        }
                    }
                    (a1, a2) => (a1, a2, None),
                }
            }
        };

        LineOutcome::Accepted(CallRecord {
            job_id: self.job_id,
            sample_label: self.sample_label.clone(),
            rsid,
            chromosome: chrom_idx
                .and_then(|idx| fields.get(idx))
                .and_then(|c| normalize_chromosome(c)),
            position: pos_idx.and_then(|idx| fields.get(idx)).and_then(|p| parse_position(p)),
            allele1,
            allele2,
            genotype,
            raw_line: trimmed.to_string(),
        })
    }

    /// Normalize a whole line stream
    ///
    /// Bad lines are skipped and counted; only read errors abort.
    pub fn normalize<R: BufRead>(&self, reader: R) -> Result<(Vec<CallRecord>, NormalizeSummary), NormalizeError> {
        let mut records = Vec::new();
        let mut summary = NormalizeSummary::default();
        let mut header_pending = matches!(self.columns, ArrayColumns::Header(_));

        for (idx, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| NormalizeError::Io { line: idx + 1, source })?;
            let content = line.trim_start_matches('\u{feff}');
            if content.trim().is_empty() || content.trim_start().starts_with('#') {
                continue;
            }
            if header_pending {
                header_pending = false;
                continue;
            }

            match self.normalize_line(content) {
                LineOutcome::Accepted(record) => {
                    summary.accepted += 1;
                    records.push(record);
                }
                LineOutcome::Skipped(reason) => summary.record_skip(&reason),
            }
        }

        Ok((records, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::detect::detect;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    fn headed(alleles: AlleleColumns) -> Layout {
        Layout::Header(ColumnMap {
            rsid: 0,
            chromosome: None,
            position: None,
            alleles,
        })
    }

    fn accepted(outcome: LineOutcome) -> CallRecord {
        match outcome {
            LineOutcome::Accepted(record) => record,
            LineOutcome::Skipped(reason) => panic!("Expected record, skipped: {:?}", reason),
        }
    }

    #[test]
    fn test_genotype_column_splits_into_alleles() {
        let normalizer = ArrayNormalizer::new(1, "S1", &headed(AlleleColumns::Genotype(1))).unwrap();
        let (records, summary) = normalizer
            .normalize(Cursor::new("rsid\tgenotype\nrs123\tAG\n"))
            .unwrap();

        assert_eq!(summary.accepted, 1);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rsid, "rs123");
        assert_eq!(records[0].allele1.as_deref(), Some("A"));
        assert_eq!(records[0].allele2.as_deref(), Some("G"));
        assert_eq!(records[0].genotype.as_deref(), Some("AG"));
        assert_eq!(records[0].chromosome, None);
        assert_eq!(records[0].position, None);
        assert_eq!(records[0].raw_line, "rs123\tAG");
    }

    #[test]
    fn test_no_call_sentinels() {
        let normalizer = ArrayNormalizer::new(1, "S1", &Layout::Headerless).unwrap();
        for token in ["--", "00", "NN"] {
            let record = accepted(normalizer.normalize_line(&format!("rs1\t1\t100\t{}", token)));
            assert!(record.is_no_call(), "{} should be a no-call", token);
            assert_eq!(record.allele1.as_deref(), Some(NO_CALL));
            assert_eq!(record.genotype.as_deref(), Some(token));
        }
    }

    #[test]
    fn test_single_character_genotype_is_homozygous() {
        let normalizer = ArrayNormalizer::new(1, "S1", &Layout::Headerless).unwrap();
        let record = accepted(normalizer.normalize_line("rs1\tX\t5000\tA"));
        assert_eq!(record.allele1.as_deref(), Some("A"));
        assert_eq!(record.allele2.as_deref(), Some("A"));
    }

    #[test]
    fn test_chromosome_normalization() {
        assert_eq!(normalize_chromosome("chr23").as_deref(), Some("X"));
        assert_eq!(normalize_chromosome("24").as_deref(), Some("Y"));
        assert_eq!(normalize_chromosome("ChrM").as_deref(), Some("MT"));
        assert_eq!(normalize_chromosome("MT").as_deref(), Some("MT"));
        assert_eq!(normalize_chromosome("Chromosome 7").as_deref(), Some("7"));
        assert_eq!(normalize_chromosome("x").as_deref(), Some("X"));
        assert_eq!(normalize_chromosome(" 12 ").as_deref(), Some("12"));
        assert_eq!(normalize_chromosome(""), None);
        assert_eq!(normalize_chromosome("chr"), None);
    }

    #[test]
    fn test_position_is_integer_or_unknown() {
        assert_eq!(parse_position("69869"), Some(69869));
        assert_eq!(parse_position(" 12 "), Some(12));
        assert_eq!(parse_position("NOT_A_NUMBER"), None);
        assert_eq!(parse_position("1.5"), None);
        assert_eq!(parse_position(""), None);
    }

    #[test]
    fn test_headerless_with_whitespace_fallback() {
        let normalizer = ArrayNormalizer::new(7, "Sample_7", &Layout::Headerless).unwrap();
        let record = accepted(normalizer.normalize_line("rs9283150   chr23  565508 AA"));
        assert_eq!(record.job_id, 7);
        assert_eq!(record.chromosome.as_deref(), Some("X"));
        assert_eq!(record.position, Some(565508));
        assert_eq!(record.genotype.as_deref(), Some("AA"));
    }

    #[test]
    fn test_short_and_bad_lines_are_skipped_not_fatal() {
        let normalizer = ArrayNormalizer::new(1, "S1", &Layout::Headerless).unwrap();
        let input = "\
# comment
rs1\t1\t100\tAG

rs2\t1
rs3\t1\t300\tACGT
\t1\t400\tCC
rs5\t1\tbad\tTT
";
        let (records, summary) = normalizer.normalize(Cursor::new(input)).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[1].rsid, "rs5");
        assert_eq!(records[1].position, None);
        assert_eq!(summary.accepted, 2);
        assert_eq!(summary.skipped_total(), 3);
        assert_eq!(summary.skipped.get("too_few_fields"), Some(&1));
        assert_eq!(summary.skipped.get("missing_rsid"), Some(&1));
        assert_eq!(summary.skipped.get("unrecognized_genotype"), Some(&1));
    }

    #[test]
    fn test_allele_pair_layout() {
        let layout = Layout::Header(ColumnMap {
            rsid: 0,
            chromosome: Some(1),
            position: Some(2),
            alleles: AlleleColumns::Pair { allele1: 3, allele2: 4 },
        });
        let normalizer = ArrayNormalizer::new(3, "S", &layout).unwrap();
        let input = "rsid\tchromosome\tposition\tallele1\tallele2\nrs1\t1\t10\tA\tG\nrs2\t2\t20\t0\t0\nrs3\t3\t30\tT\t\n";
        let (records, _) = normalizer.normalize(Cursor::new(input)).unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].genotype.as_deref(), Some("AG"));
        assert!(records[1].is_no_call());
        assert_eq!(records[2].allele1.as_deref(), Some("T"));
        assert_eq!(records[2].allele2, None);
        assert_eq!(records[2].genotype, None);
    }

    #[test]
    fn test_detect_then_normalize_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "# This data file generated by 23andMe\n# rsid\tchromosome\tposition\tgenotype\nrs548049170\t1\t69869\tTT\nrs13328684\t1\t74792\t--\ni713426\t24\t2655180\tG\n"
        )
        .unwrap();
        file.flush().unwrap();

        let detection = detect(file.path()).unwrap();
        let normalizer = ArrayNormalizer::new(1, "S1", &detection.layout).unwrap();
        let reader = crate::parsers::detect::open_text(file.path(), &detection).unwrap();
        let (records, summary) = normalizer.normalize(reader).unwrap();

        assert_eq!(summary.accepted, 3);
        assert!(records[1].is_no_call());
        assert_eq!(records[2].chromosome.as_deref(), Some("Y"));
        assert_eq!(records[2].allele2.as_deref(), Some("G"));
    }

    #[test]
    fn test_vcf_layout_is_rejected() {
        assert!(matches!(
            ArrayNormalizer::new(1, "S", &Layout::Vcf),
            Err(NormalizeError::WrongLayout(Layout::Vcf))
        ));
    }
}
