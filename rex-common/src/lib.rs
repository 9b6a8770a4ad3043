//! Shared plumbing for the rex remote execution tools.
//!
//! This crate holds everything the daemon (`rexd`) and the control-plane
//! CLI (`rex`) agree on: the wire protocol, the mini-YAML config dialect,
//! the log tail reader, path helpers, and the self-update machinery.

pub mod mask;
pub mod miniyaml;
pub mod pathutil;
pub mod protocol;
pub mod selfupdate;
pub mod tail;
pub mod timeutil;

pub use protocol::{
    CancelResponse, ExecRecord, ExecStartRequest, ExecStartResponse, ExecStatus, WatchEvent,
};
