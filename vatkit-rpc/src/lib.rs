// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see broken.rs for the full text.

//! The capability-RPC runtime: the local dispatch/pipelining core
//! (`local`, `queued`, `broken`, `rpc`) and the two-party wire connection
//! built on top of it (`twoparty`).

pub mod broken;
pub mod flow_control;
pub mod id_pool;
pub mod local;
pub mod queued;
pub mod rpc;
pub mod sender_queue;
pub mod split;
pub mod twoparty;

pub use rpc::{ErrorReporter, Options};
pub use twoparty::{connect, RpcSystem};

/// Converts a canceled one-shot receiver (the sender side dropped without
/// ever sending) into a reportable `Error`. Every oneshot wired up in this
/// crate is paired with a sender that always fires exactly once unless its
/// owning task is torn down, so cancellation here always means "the
/// connection or capability this was waiting on went away".
pub fn canceled_to_error(_: tokio::sync::oneshot::error::RecvError) -> vatkit::Error {
    vatkit::Error::disconnected("the other end of this operation was dropped".into())
}
