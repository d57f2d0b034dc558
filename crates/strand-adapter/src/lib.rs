//! Listening side of a strand object adapter.
//!
//! A [`Listener`] accepts transports from an [`Acceptor`], wraps each one in an incoming
//! [`strand_rpc::Connection`], bounds how many stay alive, and moves them through the
//! adapter's activate/hold/destroy lifecycle.

mod listener;
pub mod tcp;

pub use listener::{Acceptor, Listener, ListenerOptions, ListenerState};
