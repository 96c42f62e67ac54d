//! Single-process TCP relay: peers connect, send raw byte messages, and the
//! server rebroadcasts each message to every other connected peer.
//!
//! Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`registry`] is the fixed-capacity slot table holding connected peers.
//! - [`server`] runs the single-task multiplex loop: it waits for readiness
//!   on the listener, every connected socket, and a control input, then
//!   accepts, receives, and broadcasts between waits.
//! - [`client`] connects to a relay and multiplexes stdin with incoming
//!   messages for a terminal user.
//!
//! There is no wire format: the payload of one receive call is relayed
//! verbatim as one message. Integration tests use this crate directly to
//! exercise the registry and the multiplex loop.

pub mod cli;
pub mod client;
pub mod registry;
pub mod server;
