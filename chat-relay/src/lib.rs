//! Real-time chat relay over TCP.
//!
//! Every connected client gets a server-assigned identity (`user_1`,
//! `user_2`, ...). Each message a client sends is stamped by the relay and
//! fanned out to every connected client, the sender included.
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`message`] defines [`message::ChatMessage`] and the JSON line framing.
//! - [`registry`] maps identities to outbound handles and hands out identities.
//! - [`hub`] stamps inbound messages and fans them out concurrently.
//! - [`session`] drives one connection from registration to teardown.
//! - [`relay`] accepts TCP connections and spawns a session for each.
//! - [`client`] races a stdin send loop against a receive loop for a terminal user.

pub mod cli;
pub mod client;
pub mod hub;
pub mod message;
pub mod registry;
pub mod relay;
pub mod session;
