// ==============================================================================
// parsers/mod.rs - File parser modules
// ==============================================================================
// Description: Format detection and record normalization for raw genotype files
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================

pub mod detect;
pub mod genotype_array;
pub mod vcf;

pub use detect::{detect, open_text, Detection, DetectError, Layout};
pub use genotype_array::{ArrayNormalizer, LineOutcome, NormalizeError, NormalizeSummary, SkipReason};
pub use vcf::VcfNormalizer;
