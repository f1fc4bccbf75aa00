// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see vatkit's any_pointer.rs for the full text.

//! A capability that is already known to be broken. Every method call
//! fails immediately with the stored error. Used for a rejected promise
//! capability, a pipelined call made against a transform that didn't
//! resolve to a capability, and an import whose connection has gone away.

use std::rc::Rc;

use vatkit::any_pointer;
use vatkit::capability::{self, Promise};
use vatkit::private::capability::{ClientHook, ParamsHook, PipelineOp, ResultsHook};
use vatkit::{Error, MessageSize};

struct Inner {
    error: Error,
    resolved: bool,
    brand: usize,
}

#[derive(Clone)]
pub struct Client {
    inner: Rc<Inner>,
}

impl Client {
    pub fn new(error: Error, resolved: bool, brand: usize) -> Self {
        Self {
            inner: Rc::new(Inner {
                error,
                resolved,
                brand,
            }),
        }
    }
}

impl ClientHook for Client {
    fn add_ref(&self) -> Box<dyn ClientHook> {
        Box::new(self.clone())
    }

    fn new_call(
        &self,
        _interface_id: u64,
        _method_id: u16,
        _size_hint: Option<MessageSize>,
    ) -> capability::Request<any_pointer::Owned, any_pointer::Owned> {
        capability::Request::new(Box::new(Request {
            error: self.inner.error.clone(),
        }))
    }

    fn call(
        &self,
        _interface_id: u64,
        _method_id: u16,
        _params: Box<dyn ParamsHook>,
        _results: Box<dyn ResultsHook>,
    ) -> Promise<(), Error> {
        Promise::err(self.inner.error.clone())
    }

    fn get_ptr(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }

    fn get_brand(&self) -> usize {
        self.inner.brand
    }

    fn get_resolved(&self) -> Option<Box<dyn ClientHook>> {
        None
    }

    fn when_more_resolved(&self) -> Option<Promise<Box<dyn ClientHook>, Error>> {
        None
    }

    fn when_resolved(&self) -> Promise<(), Error> {
        if self.inner.resolved {
            Promise::ok(())
        } else {
            Promise::err(self.inner.error.clone())
        }
    }

    fn is_local_client(&self) -> bool {
        true
    }
}

/// A request built against a broken client always fails the same way on
/// `send()`, without ever constructing a `Params`/`Results` pair.
struct Request {
    error: Error,
}

impl vatkit::private::capability::RequestHook for Request {
    fn get(&mut self) -> any_pointer::Builder<'_> {
        unreachable!("requests built against a broken capability are never filled in")
    }

    fn get_brand(&self) -> usize {
        0
    }

    fn send(self: Box<Self>) -> capability::RemotePromise<any_pointer::Owned> {
        capability::RemotePromise {
            promise: Promise::err(self.error),
            pipeline: never_pipeline(),
        }
    }

    fn tail_send(
        self: Box<Self>,
    ) -> Option<(u32, Promise<(), Error>, Box<dyn vatkit::private::capability::PipelineHook>)>
    {
        None
    }
}

struct NeverPipeline;

impl vatkit::private::capability::PipelineHook for NeverPipeline {
    fn add_ref(&self) -> Box<dyn vatkit::private::capability::PipelineHook> {
        Box::new(NeverPipeline)
    }

    fn get_pipelined_cap(&self, _ops: &[PipelineOp]) -> Box<dyn ClientHook> {
        Box::new(Client::new(
            Error::failed("pipelined call on a broken capability".into()),
            true,
            0,
        ))
    }
}

fn never_pipeline() -> any_pointer::Pipeline {
    any_pointer::Pipeline::new(Box::new(NeverPipeline))
}

/// A pipeline whose every pipelined capability fails with the given error —
/// used to reject an answer's local pipeline after a finish-before-return
/// race, without touching the `Return` already on its way to the peer.
pub fn broken_pipeline(error: Error) -> Box<dyn vatkit::private::capability::PipelineHook> {
    Box::new(BrokenPipeline { error })
}

struct BrokenPipeline {
    error: Error,
}

impl vatkit::private::capability::PipelineHook for BrokenPipeline {
    fn add_ref(&self) -> Box<dyn vatkit::private::capability::PipelineHook> {
        Box::new(BrokenPipeline {
            error: self.error.clone(),
        })
    }

    fn get_pipelined_cap(&self, _ops: &[PipelineOp]) -> Box<dyn ClientHook> {
        Box::new(Client::new(self.error.clone(), true, 0))
    }
}
