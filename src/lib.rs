//! Network Block Device (NBD) protocol core for clients and servers.
//!
//! This crate provides both halves of an NBD connection:
//!
//! - [`crate::connection::Connection`]: a client that negotiates an export
//!   and issues read, write, flush, trim, zero and cache requests
//! - [`crate::server::NbdServer`]: a server that validates requests against
//!   the capabilities of a [`crate::plugin::Plugin`] and dispatches them
//! - [`crate::transport::Transport`]: the byte stream underneath, over TCP,
//!   a Unix socket or the standard streams of a spawned server
//! - [`crate::errors`]: the error model, where every failure exposes a
//!   message, a POSIX errno and the raw protocol error number
//!
//! # Protocol Compliance
//!
//! This implementation follows the NBD protocol specification as defined at
//! [NetworkBlockDevice/nbd](https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md).
//! Only fixed newstyle negotiation and simple replies are spoken.
//!
//! # Security Considerations
//!
//! NBD does not provide built-in authentication or encryption. For secure deployments:
//!
//! - Use on trusted networks only
//! - Use firewall rules to restrict access

pub mod capability;
pub mod command_request;
pub mod config;
pub mod connection;
pub mod errors;
pub mod flags;
mod info;
mod io;
mod magic;
pub mod memory;
pub mod negotiate;
mod option_reply;
mod option_request;
pub mod plugin;
pub mod server;
pub mod transport;
