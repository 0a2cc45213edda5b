//! meshmon - mesh network health agent for AREDN nodes.
//!
//! The agent measures end-to-end and per-hop network quality toward other
//! mesh nodes (UDP echo probes annotated with routing-daemon topology),
//! measures reachability and call quality of SIP phones registered with the
//! local server, tracks its own process health, and publishes everything as
//! `meshmon.v1` JSON documents.

pub mod cli;
pub mod config;
pub mod core;
