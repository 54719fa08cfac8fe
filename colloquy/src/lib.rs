//! Colloquy: client-side chat engine for one conversation with a remote
//! message service.
//!
//! The engine keeps a local message list in sync with paged server
//! history, drives the send lifecycle of user messages, batches read and
//! typing signals, and mirrors everything into local storage.

pub mod chat;
pub mod config;
pub mod reachability;
pub mod transport;
