// ==============================================================================
// annotator/tool.rs - External Annotation Tool
// ==============================================================================
// Description: Subprocess invocation of the variant effect predictor per chunk
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::ToolSettings;

/// Report fields requested from the tool
pub const REPORT_FIELDS: &str = "Location,Allele,Gene,SYMBOL,Feature,BIOTYPE,Consequence,IMPACT,EXON,INTRON,HGVSc,HGVSp,Protein_position,Amino_acids,Codons,STRAND,Existing_variation,SIFT,PolyPhen,CANONICAL,REF_ALLELE";

/// Stderr kept in error messages
const STDERR_LIMIT: usize = 1000;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Failed to start annotation tool: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Failed to write chunk payload: {0}")]
    Payload(#[source] std::io::Error),

    #[error("Annotation tool failed (exit {code:?}): {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },
}

/// An annotation backend: takes a sites-only VCF, returns a tab-delimited report
#[async_trait]
pub trait AnnotationTool: Send + Sync {
    async fn annotate(&self, input_vcf: &Path) -> Result<String, ToolError>;
}

#[async_trait]
impl<T: AnnotationTool + ?Sized> AnnotationTool for Box<T> {
    async fn annotate(&self, input_vcf: &Path) -> Result<String, ToolError> {
        (**self).annotate(input_vcf).await
    }
}

/// Ensembl VEP in offline cache mode
#[derive(Debug, Clone)]
pub struct VepCommand {
    settings: ToolSettings,
}

impl VepCommand {
    pub fn new(settings: ToolSettings) -> Self {
        Self { settings }
    }

    /// Full argument list for one chunk payload
    pub fn args(&self, input_vcf: &Path) -> Vec<String> {
        let s = &self.settings;
        vec![
            "--offline".to_string(),
            "--assembly".to_string(),
            s.assembly.to_string(),
            "--dir_cache".to_string(),
            s.cache_dir.display().to_string(),
            "--fasta".to_string(),
            s.fasta_path().display().to_string(),
            "--everything".to_string(),
            "--fork".to_string(),
            s.forks.to_string(),
            "--input_file".to_string(),
            input_vcf.display().to_string(),
            "--format".to_string(),
            "vcf".to_string(),
            "--tab".to_string(),
            "--output_file".to_string(),
            "STDOUT".to_string(),
            "--fields".to_string(),
            REPORT_FIELDS.to_string(),
            "--no_stats".to_string(),
            "--cache".to_string(),
        ]
    }
}

#[async_trait]
impl AnnotationTool for VepCommand {
    async fn annotate(&self, input_vcf: &Path) -> Result<String, ToolError> {
        let args = self.args(input_vcf);
        debug!("Running {:?} {}", self.settings.vep_path, args.join(" "));

        let output = Command::new(&self.settings.vep_path)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(ToolError::NonZeroExit {
                code: output.status.code(),
                stderr: truncate_chars(&String::from_utf8_lossy(&output.stderr), STDERR_LIMIT),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Keep at most `limit` characters, never splitting a character
pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
