// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see ../any_pointer.rs for the full text.

//! The hook traits a capability implementation (local server dispatch, the
//! two-party RPC connection, a queued promise-capability, a broken/error
//! capability) plugs into. `capability::Client`/`Request`/`Response`/
//! `Params`/`Results` are thin typed wrappers around these; everything that
//! differs between "this capability lives in-process" and "this capability
//! lives across a connection" lives behind a hook implementation instead.

use crate::any_pointer;
use crate::{Error, MessageSize, Result};

use super::super::capability::{Promise, RemotePromise, Request};

/// A step in a `PromisedAnswer.Op` transform list.
pub use crate::any_pointer::PipelineOp;

/// The client side of a capability: something method calls can be made on.
///
/// `ClientHook` is the seam the whole runtime pivots on. A local server
/// (`local::Client`), a still-unresolved promise (`queued::Client`), an
/// already-broken capability (`broken::Client`), and a capability that
/// lives on the far end of a connection (the two-party `import::Client`)
/// are all just different `ClientHook` implementations behind the same
/// `Box<dyn ClientHook>`.
pub trait ClientHook {
    /// Creates a new reference to the same capability.
    fn add_ref(&self) -> Box<dyn ClientHook>;

    /// Allocates a typeless request that will eventually call this
    /// capability's `interface_id`/`method_id` method.
    fn new_call(
        &self,
        interface_id: u64,
        method_id: u16,
        size_hint: Option<MessageSize>,
    ) -> Request<any_pointer::Owned, any_pointer::Owned>;

    /// Starts the call immediately, without waiting for a tick. Callers
    /// (`RequestHook::send`) are responsible for deferring any
    /// caller-visible side effect until after this returns, so that the
    /// callee never observes a call before the caller's request object
    /// does.
    fn call(
        &self,
        interface_id: u64,
        method_id: u16,
        params: Box<dyn ParamsHook>,
        results: Box<dyn ResultsHook>,
    ) -> Promise<(), Error>;

    /// An opaque, stable-for-the-lifetime-of-the-capability identifier.
    /// Two `ClientHook`s backed by the same underlying object return the
    /// same pointer; used to detect "this answer already points back at a
    /// capability the caller already holds" — the export table's
    /// same-identity reuse rule.
    fn get_ptr(&self) -> usize;

    /// An opaque brand identifying which `RpcSystem`/network this
    /// capability was hosted by, used to recognize when a capability
    /// received back from a peer is in fact one the peer received from us
    /// (the "shortening" case) — 0 for capabilities with no such brand.
    fn get_brand(&self) -> usize;

    /// If this capability is a promise that has already resolved, returns
    /// a reference to what it resolved to. Local clients and broken
    /// clients always return `None`.
    fn get_resolved(&self) -> Option<Box<dyn ClientHook>>;

    /// A promise that fires with the next resolution step, or `None` if
    /// this capability never resolves further.
    fn when_more_resolved(&self) -> Option<Promise<Box<dyn ClientHook>, Error>>;

    /// Resolves once this capability has reached its final destination
    /// (or forever, for a capability that never needed resolving).
    fn when_resolved(&self) -> Promise<(), Error>;

    /// True for capabilities dispatched entirely within this process.
    fn is_local_client(&self) -> bool;
}

impl Clone for Box<dyn ClientHook> {
    fn clone(&self) -> Self {
        self.add_ref()
    }
}

/// Accessor for a method call's parameter struct, as seen by the server.
pub trait ParamsHook {
    fn get(&self) -> Result<any_pointer::Reader>;
}

/// Accessor for a method call's response, as seen by the client, once the
/// call has returned.
pub trait ResponseHook {
    fn get(&self) -> Result<any_pointer::Reader>;
}

/// Accessor for a method call's return struct, as seen by the server,
/// while the call is still executing.
pub trait ResultsHook {
    fn get(&mut self) -> Result<any_pointer::Builder>;

    /// Redirects the results to come from the result of `request` instead
    /// (a tail call — implementors in this workspace are not required to
    /// support it).
    fn tail_call(self: Box<Self>, request: Box<dyn RequestHook>) -> Promise<(), Error>;

    fn direct_tail_call(
        self: Box<Self>,
        request: Box<dyn RequestHook>,
    ) -> (Promise<(), Error>, Box<dyn PipelineHook>);

    /// Hints that the server is fine with the call being canceled if the
    /// caller drops interest.
    fn allow_cancellation(&self);
}

/// An unsent method call.
pub trait RequestHook {
    fn get(&mut self) -> any_pointer::Builder;
    fn get_brand(&self) -> usize;
    fn send(self: Box<Self>) -> RemotePromise<any_pointer::Owned>;
    fn tail_send(self: Box<Self>) -> Option<(u32, Promise<(), Error>, Box<dyn PipelineHook>)>;
}

/// The answer side of a call: lets a pipelined request reach into the
/// eventual result before it exists. `queued::Pipeline`
/// buffers calls against a not-yet-resolved answer; `local::Pipeline` and
/// the two-party `rpc::Pipeline` read straight through to a resolved one.
pub trait PipelineHook {
    fn add_ref(&self) -> Box<dyn PipelineHook>;
    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Box<dyn ClientHook>;
}

impl Clone for Box<dyn PipelineHook> {
    fn clone(&self) -> Self {
        self.add_ref()
    }
}
