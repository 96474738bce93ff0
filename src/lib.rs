//! `galsync`: Global Address List search and sync.
//!
//! This crate provides the control plane behind GAL search, autocomplete
//! and incremental sync: it prefers a GAL sync account mailbox, proxies to
//! the node hosting it when it lives elsewhere, and falls back to a live
//! directory search. Sync tokens, structured entry filters and per-domain
//! sync admission live here too.

pub mod backend;
pub mod config;
pub mod error;
pub mod filter;
pub mod model;
pub mod search;
pub mod service;
pub mod token;
