// ==============================================================================
// schema.rs - Annotated Row Column Contract
// ==============================================================================
// Description: Fixed-arity output schema shared with downstream consumers
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================
// Changing the column list is a breaking change for every consumer of the
// annotated TSV and the annotated_variants table. Bump SCHEMA_VERSION with it.
// ==============================================================================

use std::fs;
use std::path::Path;
use thiserror::Error;

pub const SCHEMA_VERSION: u32 = 1;

/// Number of columns in every annotated row
pub const ANNOTATED_ARITY: usize = 33;

/// Output columns, in order
pub const ANNOTATED_COLUMNS: [&str; ANNOTATED_ARITY] = [
    "chrom",
    "pos",
    "ref",
    "alt",
    "rsid",
    "symbol",
    "gene_id",
    "feature_id",
    "biotype",
    "consequence",
    "impact",
    "hgvsc",
    "hgvsp",
    "canonical",
    "exon",
    "intron",
    "protein_position",
    "amino_acids",
    "codons",
    "strand",
    "existing_variation",
    "af",
    "af_afr",
    "af_amr",
    "af_eas",
    "af_eur",
    "af_sas",
    "clin_sig",
    "sift",
    "polyphen",
    "cadd_raw",
    "cadd_phred",
    "extra_json",
];

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Column count mismatch: got {got} expected {expected}")]
    ArityMismatch { got: usize, expected: usize },

    #[error("Column file {path}: {details}")]
    ColumnFile { path: String, details: String },

    #[error("Annotator output has data before a header line: {0}")]
    MissingHeader(String),

    #[error("Existing output header does not match the column contract")]
    HeaderMismatch,
}

/// One annotated variant row; construction enforces the column contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedRow(Vec<String>);

impl AnnotatedRow {
    pub fn new(fields: Vec<String>) -> Result<Self, SchemaError> {
        if fields.len() != ANNOTATED_ARITY {
            return Err(SchemaError::ArityMismatch {
                got: fields.len(),
                expected: ANNOTATED_ARITY,
            });
        }
        Ok(Self(fields))
    }

    pub fn fields(&self) -> &[String] {
        &self.0
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        ANNOTATED_COLUMNS
            .iter()
            .position(|c| *c == column)
            .map(|idx| self.0[idx].as_str())
    }
}

/// Header line of the annotated TSV (without trailing newline)
pub fn header_line() -> String {
    ANNOTATED_COLUMNS.join("\t")
}

/// Check an externally supplied column file (one name per line) against the contract
///
/// A missing, short, long or reordered file is a fatal contract error.
pub fn verify_column_file(path: &Path) -> Result<(), SchemaError> {
    let contents = fs::read_to_string(path).map_err(|e| SchemaError::ColumnFile {
        path: path.display().to_string(),
        details: e.to_string(),
    })?;

    let columns: Vec<&str> = contents
        .lines()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();

    if columns.len() != ANNOTATED_ARITY {
        return Err(SchemaError::ColumnFile {
            path: path.display().to_string(),
            details: format!("{} columns, expected {}", columns.len(), ANNOTATED_ARITY),
        });
    }

    if let Some((idx, (got, want))) = columns
        .iter()
        .zip(ANNOTATED_COLUMNS.iter())
        .enumerate()
        .find(|(_, (got, want))| got != want)
    {
        return Err(SchemaError::ColumnFile {
            path: path.display().to_string(),
            details: format!("column {} is '{}', expected '{}'", idx + 1, got, want),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_row_arity_is_enforced() {
        let ok = AnnotatedRow::new(vec![String::new(); ANNOTATED_ARITY]);
        assert!(ok.is_ok());

        let short = AnnotatedRow::new(vec![String::new(); ANNOTATED_ARITY - 1]);
        assert!(matches!(
            short,
            Err(SchemaError::ArityMismatch { got: 32, expected: 33 })
        ));

        let long = AnnotatedRow::new(vec![String::new(); ANNOTATED_ARITY + 1]);
        assert!(long.is_err());
    }

    #[test]
    fn test_get_by_column_name() {
        let mut fields = vec![String::new(); ANNOTATED_ARITY];
        fields[0] = "7".to_string();
        fields[32] = "{}".to_string();
        let row = AnnotatedRow::new(fields).unwrap();
        assert_eq!(row.get("chrom"), Some("7"));
        assert_eq!(row.get("extra_json"), Some("{}"));
        assert_eq!(row.get("nope"), None);
    }

    #[test]
    fn test_column_file_matching_contract() {
        let mut file = NamedTempFile::new().unwrap();
        for column in ANNOTATED_COLUMNS {
            writeln!(file, "{}", column).unwrap();
        }
        writeln!(file).unwrap();
        file.flush().unwrap();
        assert!(verify_column_file(file.path()).is_ok());
    }

    #[test]
    fn test_column_file_mismatch_is_fatal() {
        let mut file = NamedTempFile::new().unwrap();
        for column in ANNOTATED_COLUMNS.iter().skip(1) {
            writeln!(file, "{}", column).unwrap();
        }
        file.flush().unwrap();
        assert!(matches!(
            verify_column_file(file.path()),
            Err(SchemaError::ColumnFile { .. })
        ));

        assert!(verify_column_file(Path::new("/nonexistent/columns.tsv")).is_err());
    }

    #[test]
    fn test_header_line() {
        let header = header_line();
        assert!(header.starts_with("chrom\tpos\tref\talt"));
        assert_eq!(header.split('\t').count(), ANNOTATED_ARITY);
    }
}
