// ==============================================================================
// lib.rs - Genomics Ingest Library
// ==============================================================================
// Description: Job queue, format detection, normalization and chunked
//              annotation modules shared by the CLI and the worker
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================

pub mod annotator;
pub mod config;
pub mod dispatcher;
pub mod models;
pub mod parsers;
pub mod processor;
pub mod schema;
pub mod store;
