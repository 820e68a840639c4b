//! Durachat - offline-first local state engine for an assistant chat client.
//!
//! Keeps the on-screen transcript, the durable local history, and the network
//! in consistent order under interruption, re-entry, and partial failure.

// ============================================================================
// Core Infrastructure
// ============================================================================

pub mod config;
pub mod store;

// ============================================================================
// Network & Streaming
// ============================================================================

pub mod cache;
pub mod client;
pub mod sse;

// ============================================================================
// Domain
// ============================================================================

pub mod notify;
pub mod orchestrator;
pub mod title;
