//! Ledger ingestion and materialized views
//!
//! `streamer_core` talks to the upstream mirror (REST pages and push
//! streams); `pipeline` decodes, ingests and serves the derived state.

pub mod pipeline;
pub mod streamer_core;
