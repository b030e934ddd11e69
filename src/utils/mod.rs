//! # Utilities Module
//!
//! Cross-cutting helpers that don't belong in domain-specific modules.
//!
//! - `telemetry`: tracing subscriber setup for span timing output

pub mod telemetry;

pub use telemetry::init_tracing;
