//! CLI-side plumbing: the control-socket client and the command
//! implementations invoked from the `wormhole` binary.

pub mod client;
pub mod commands;
