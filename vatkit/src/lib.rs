// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see any_pointer.rs for the full text.

//! Capability hooks and the untyped pointer model the RPC runtime dispatches
//! calls on. This crate is the "no schema codegen" half of the split the
//! original Cap'n Proto crate makes between `capnp` (pointer layout,
//! capability hooks) and `capnp-rpc` (the wire protocol and connection
//! machinery): the promise/pipelining semantics, capability lifetime rules,
//! and struct-field transforms all live here; `vatkit-rpc` builds the vat
//! connection and question/answer/export tables on top.

pub mod any_pointer;
pub mod capability;
pub mod error;
pub mod introspect;
pub mod message;
pub mod private;
pub mod schema;
pub mod traits;

pub use error::{Error, ErrorKind, Result};

/// An estimate of how large a message will be once filled in, used to size
/// the initial allocation. Purely advisory: every `Ptr`-backed builder in
/// this crate grows on demand regardless of the hint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageSize {
    pub word_count: u64,
    pub cap_count: u32,
}
