//! # Shutterflow Server
//!
//! HTTP control plane for the shutterflow archival pipeline. Exposes the
//! core stage runners and the orchestrator over a small versioned REST
//! surface, guarded by an optional shared API key.

#![allow(missing_docs)]

pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod routes;
pub mod state;
