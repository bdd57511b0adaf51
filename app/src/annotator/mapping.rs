// ==============================================================================
// annotator/mapping.rs - Annotation Report Mapping
// ==============================================================================
// Description: Parses tabular tool output and maps it onto the 33-column schema
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================
// Report layout:
//   ## ...                         metadata, ignored
//   #Location  Allele  Gene ...    header (leading '#' optional)
//   1:12345    G       ENSG...     data, one line per transcript consequence
// The optional Extra column holds KEY=VALUE pairs separated by ';'. Bare keys
// are flags and map to `true` in extra_json.
// ==============================================================================

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::schema::{AnnotatedRow, SchemaError};

/// One report line keyed by header name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolRecord {
    fields: HashMap<String, String>,
    extra: Map<String, Value>,
}

impl ToolRecord {
    pub fn from_columns(header: &[String], values: &[&str]) -> Self {
        let mut fields = HashMap::new();
        let mut extra = Map::new();

        for (name, value) in header.iter().zip(values.iter()) {
            if name == "Extra" {
                extra = parse_extra(value);
            } else {
                fields.insert(name.clone(), value.to_string());
            }
        }

        Self { fields, extra }
    }

    /// Non-empty, non-placeholder value of a report column
    fn field(&self, key: &str) -> &str {
        match self.fields.get(key).map(|v| v.trim()) {
            Some("-") | None => "",
            Some(v) => v,
        }
    }

    fn extra_str(&self, key: &str) -> &str {
        match self.extra.get(key) {
            Some(Value::String(s)) if s != "-" => s.as_str(),
            _ => "",
        }
    }

    /// Extra first, then a same-named report column
    fn extra_or_field(&self, key: &str) -> &str {
        first_non_empty(&[self.extra_str(key), self.field(key)])
    }

    /// Map onto the annotated column contract
    pub fn to_row(&self) -> Result<AnnotatedRow, SchemaError> {
        let location = self.field("Location");
        let (loc_chrom, loc_pos) = split_location(location);

        let canonical = self.field("CANONICAL") == "YES" || self.extra_str("CANONICAL") == "YES";
        let strand = match self.extra_or_field("STRAND") {
            "+" | "1" => "1",
            "-" | "-1" => "-1",
            _ => "",
        };

        let ordered: Vec<String> = vec![
            loc_chrom.to_string(),
            first_non_empty(&[self.field("Start"), self.field("POS"), loc_pos]).to_string(),
            first_non_empty(&[self.field("REF"), self.field("REF_ALLELE"), self.extra_str("REF_ALLELE")]).to_string(),
            self.field("Allele").to_string(),
            first_non_empty(&[self.field("Existing_variation"), self.extra_str("RSID")]).to_string(),
            self.field("SYMBOL").to_string(),
            self.field("Gene").to_string(),
            self.field("Feature").to_string(),
            first_non_empty(&[self.field("BIOTYPE"), self.extra_str("BIOTYPE")]).to_string(),
            self.field("Consequence").to_string(),
            self.field("IMPACT").to_string(),
            self.field("HGVSc").to_string(),
            self.field("HGVSp").to_string(),
            canonical.to_string(),
            self.field("EXON").to_string(),
            self.field("INTRON").to_string(),
            self.field("Protein_position").to_string(),
            self.field("Amino_acids").to_string(),
            self.field("Codons").to_string(),
            strand.to_string(),
            self.field("Existing_variation").to_string(),
            numeric(first_non_empty(&[self.extra_or_field("gnomAD_AF"), self.extra_or_field("AF")])),
            numeric(self.extra_or_field("gnomAD_AFR_AF")),
            numeric(self.extra_or_field("gnomAD_AMR_AF")),
            numeric(self.extra_or_field("gnomAD_EAS_AF")),
            numeric(self.extra_or_field("gnomAD_NFE_AF")),
            numeric(self.extra_or_field("gnomAD_SAS_AF")),
            self.extra_or_field("CLIN_SIG").to_string(),
            self.field("SIFT").to_string(),
            self.field("PolyPhen").to_string(),
            numeric(self.extra_or_field("CADD_RAW")),
            numeric(self.extra_or_field("CADD_PHRED")),
            Value::Object(self.extra.clone()).to_string(),
        ];

        AnnotatedRow::new(ordered)
    }
}

/// Parse a whole tool report into annotated rows, preserving line order
pub fn parse_report(report: &str) -> Result<Vec<AnnotatedRow>, SchemaError> {
    let mut header: Option<Vec<String>> = None;
    let mut rows = Vec::new();

    for line in report.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with("##") {
            continue;
        }
        if line.starts_with('#') || line.starts_with("Location\t") {
            header = Some(
                line.trim_start_matches('#')
                    .split('\t')
                    .map(|h| h.trim().to_string())
                    .collect(),
            );
            continue;
        }

        let columns = header
            .as_ref()
            .ok_or_else(|| SchemaError::MissingHeader(line.chars().take(200).collect()))?;
        let values: Vec<&str> = line.split('\t').collect();
        rows.push(ToolRecord::from_columns(columns, &values).to_row()?);
    }

    Ok(rows)
}

fn parse_extra(raw: &str) -> Map<String, Value> {
    let mut extra = Map::new();
    for pair in raw.split(';').map(str::trim).filter(|p| !p.is_empty() && *p != "-") {
        match pair.split_once('=') {
            Some((key, value)) => {
                extra.insert(key.to_string(), Value::String(value.to_string()));
            }
            None => {
                extra.insert(pair.to_string(), Value::Bool(true));
            }
        }
    }
    extra
}

fn split_location(location: &str) -> (&str, &str) {
    match location.split_once(':') {
        Some((chrom, rest)) => (chrom, rest.split('-').next().unwrap_or("")),
        None => (location, ""),
    }
}

fn first_non_empty<'a>(candidates: &[&'a str]) -> &'a str {
    candidates.iter().copied().find(|c| !c.is_empty()).unwrap_or("")
}

/// Numeric columns keep parseable values only; multi-valued entries use the first
fn numeric(raw: &str) -> String {
    raw.split(['&', ','])
        .next()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .map(|v| v.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ANNOTATED_ARITY;

    const REPORT: &str = "\
## ENSEMBL VARIANT EFFECT PREDICTOR v110
## Column descriptions:
#Location\tAllele\tGene\tSYMBOL\tFeature\tBIOTYPE\tConsequence\tIMPACT\tEXON\tINTRON\tHGVSc\tHGVSp\tProtein_position\tAmino_acids\tCodons\tSTRAND\tExisting_variation\tSIFT\tPolyPhen\tCANONICAL\tREF_ALLELE\tExtra
7:117559590-117559592\tT\tENSG00000001626\tCFTR\tENST00000003084\tprotein_coding\tmissense_variant\tMODERATE\t11/27\t-\tc.1521C>T\tp.Phe508Leu\t508\tF/L\tttC/ttT\t1\trs113993960\tdeleterious(0.01)\tprobably_damaging(0.99)\tYES\tC\tgnomAD_AF=0.0123;gnomAD_NFE_AF=1.5e-2;CLIN_SIG=pathogenic;CADD_PHRED=23.4;HGVS_OFFSET
1:69869\tA\t-\t-\t-\t-\tintergenic_variant\tMODIFIER\t-\t-\t-\t-\t-\t-\t-\t-\t-\t-\t-\t-\tT\t-
";

    #[test]
    fn test_report_maps_to_contract() {
        let rows = parse_report(REPORT).unwrap();
        assert_eq!(rows.len(), 2);

        let row = &rows[0];
        assert_eq!(row.fields().len(), ANNOTATED_ARITY);
        assert_eq!(row.get("chrom"), Some("7"));
        assert_eq!(row.get("pos"), Some("117559590"));
        assert_eq!(row.get("ref"), Some("C"));
        assert_eq!(row.get("alt"), Some("T"));
        assert_eq!(row.get("rsid"), Some("rs113993960"));
        assert_eq!(row.get("symbol"), Some("CFTR"));
        assert_eq!(row.get("canonical"), Some("true"));
        assert_eq!(row.get("strand"), Some("1"));
        assert_eq!(row.get("af"), Some("0.0123"));
        assert_eq!(row.get("af_eur"), Some("0.015"));
        assert_eq!(row.get("af_afr"), Some(""));
        assert_eq!(row.get("clin_sig"), Some("pathogenic"));
        assert_eq!(row.get("cadd_phred"), Some("23.4"));
        assert_eq!(row.get("cadd_raw"), Some(""));

        let extra: Value = serde_json::from_str(row.get("extra_json").unwrap()).unwrap();
        assert_eq!(extra["CLIN_SIG"], Value::String("pathogenic".to_string()));
        assert_eq!(extra["HGVS_OFFSET"], Value::Bool(true));
    }

    #[test]
    fn test_placeholders_become_empty() {
        let rows = parse_report(REPORT).unwrap();
        let row = &rows[1];
        assert_eq!(row.get("chrom"), Some("1"));
        assert_eq!(row.get("pos"), Some("69869"));
        assert_eq!(row.get("ref"), Some("T"));
        assert_eq!(row.get("symbol"), Some(""));
        assert_eq!(row.get("canonical"), Some("false"));
        assert_eq!(row.get("strand"), Some(""));
        assert_eq!(row.get("extra_json"), Some("{}"));
    }

    #[test]
    fn test_plain_location_header() {
        let report = "Location\tAllele\tSTRAND\n2:500\tG\t-\n";
        let rows = parse_report(report).unwrap();
        assert_eq!(rows[0].get("chrom"), Some("2"));
        // A bare "-" is the report's empty placeholder, not a strand
        assert_eq!(rows[0].get("strand"), Some(""));

        let report = "Location\tAllele\tSTRAND\n2:500\tG\t-1\n";
        assert_eq!(parse_report(report).unwrap()[0].get("strand"), Some("-1"));
    }

    #[test]
    fn test_data_before_header_is_schema_error() {
        assert!(matches!(
            parse_report("1:100\tA\n"),
            Err(SchemaError::MissingHeader(_))
        ));
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(numeric("0.5"), "0.5");
        assert_eq!(numeric("1e-3"), "0.001");
        assert_eq!(numeric("0.2&0.3"), "0.2");
        assert_eq!(numeric("n/a"), "");
        assert_eq!(numeric(""), "");
    }
}
