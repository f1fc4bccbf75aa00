// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see vatkit's any_pointer.rs for the full text.

//! A capability, or a pipeline slot, that doesn't have a final destination
//! yet. `queued::Client` buffers every `.call()` made on it in the order
//! received and replays them once the destination is known; `queued::Pipeline`
//! does the same for `get_pipelined_cap` queries against an answer that
//! hasn't returned. Both reuse `SenderQueue` — pushing a unit value and
//! getting back a promise for the eventual destination is exactly
//! `SenderQueue`'s shape, just with the "value consumed" signal repurposed
//! as "the promise resolved".

use std::cell::RefCell;
use std::rc::Rc;

use vatkit::any_pointer;
use vatkit::capability::{self, Promise};
use vatkit::private::capability::{ClientHook, ParamsHook, PipelineHook, PipelineOp, ResultsHook};
use vatkit::{Error, MessageSize, Result};

use crate::sender_queue::SenderQueue;

enum ClientState {
    Pending { waiters: SenderQueue<(), Box<dyn ClientHook>> },
    Resolved(Box<dyn ClientHook>),
    Broken(Error),
}

/// A promise capability: every call made on it before resolution is held
/// until the capability it stands in for is known, then replayed against
/// that capability in submission order (because each deferred call awaits
/// the very same resolution promise and then issues its own `.call()`, so
/// the surrounding executor's FIFO polling order — not an explicit queue
/// rebuild — is what preserves the ordering).
pub struct Client {
    inner: Rc<RefCell<ClientState>>,
}

impl Client {
    /// Creates a queued client that resolves once `promise` does. Calls
    /// made in the meantime wait for `promise`.
    pub fn new(promise: Promise<Box<dyn ClientHook>, Error>) -> Self {
        let inner = Rc::new(RefCell::new(ClientState::Pending {
            waiters: SenderQueue::new(),
        }));
        let resolve_into = inner.clone();
        tokio::task::spawn_local(async move {
            let result = promise.await;
            let waiters = {
                let mut state = resolve_into.borrow_mut();
                match &mut *state {
                    ClientState::Pending { waiters } => std::mem::replace(waiters, SenderQueue::new()),
                    _ => return,
                }
            };
            match result {
                Ok(hook) => {
                    for (_, tx) in waiters.drain() {
                        let _ = tx.send(hook.add_ref());
                    }
                    *resolve_into.borrow_mut() = ClientState::Resolved(hook);
                }
                Err(e) => {
                    for (_, tx) in waiters.drain() {
                        let _ = tx.send(broken_hook(&e));
                    }
                    *resolve_into.borrow_mut() = ClientState::Broken(e);
                }
            }
        });
        Self { inner }
    }
}

impl Clone for Client {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn broken_hook(e: &Error) -> Box<dyn ClientHook> {
    Box::new(crate::broken::Client::new(e.clone(), true, 0))
}

impl ClientHook for Client {
    fn add_ref(&self) -> Box<dyn ClientHook> {
        Box::new(self.clone())
    }

    fn new_call(
        &self,
        interface_id: u64,
        method_id: u16,
        size_hint: Option<MessageSize>,
    ) -> capability::Request<any_pointer::Owned, any_pointer::Owned> {
        capability::Request::new(Box::new(crate::local::Request::new(
            interface_id,
            method_id,
            size_hint,
            self.add_ref(),
        )))
    }

    fn call(
        &self,
        interface_id: u64,
        method_id: u16,
        params: Box<dyn ParamsHook>,
        results: Box<dyn ResultsHook>,
    ) -> Promise<(), Error> {
        let mut state = self.inner.borrow_mut();
        match &mut *state {
            ClientState::Resolved(hook) => hook.call(interface_id, method_id, params, results),
            ClientState::Broken(e) => Promise::err(e.clone()),
            ClientState::Pending { waiters } => {
                let wait = waiters.push(());
                Promise::from_future(async move {
                    let hook = wait.await?;
                    hook.call(interface_id, method_id, params, results).await
                })
            }
        }
    }

    fn get_ptr(&self) -> usize {
        match &*self.inner.borrow() {
            ClientState::Resolved(hook) => hook.get_ptr(),
            _ => Rc::as_ptr(&self.inner) as usize,
        }
    }

    fn get_brand(&self) -> usize {
        match &*self.inner.borrow() {
            ClientState::Resolved(hook) => hook.get_brand(),
            _ => 0,
        }
    }

    fn get_resolved(&self) -> Option<Box<dyn ClientHook>> {
        match &*self.inner.borrow() {
            ClientState::Resolved(hook) => Some(hook.add_ref()),
            ClientState::Broken(e) => Some(broken_hook(e)),
            ClientState::Pending { .. } => None,
        }
    }

    fn when_more_resolved(&self) -> Option<Promise<Box<dyn ClientHook>, Error>> {
        match &mut *self.inner.borrow_mut() {
            ClientState::Resolved(hook) => Some(Promise::ok(hook.add_ref())),
            ClientState::Broken(e) => Some(Promise::err(e.clone())),
            ClientState::Pending { waiters } => Some(waiters.push(())),
        }
    }

    fn when_resolved(&self) -> Promise<(), Error> {
        crate::rpc::default_when_resolved_impl(self)
    }

    fn is_local_client(&self) -> bool {
        match &*self.inner.borrow() {
            ClientState::Resolved(hook) => hook.is_local_client(),
            _ => false,
        }
    }
}

enum PipelineState {
    Unresolved {
        waiters: SenderQueue<Vec<PipelineOp>, Box<dyn ClientHook>>,
    },
    Resolved(Box<dyn PipelineHook>),
    Broken(Error),
}

/// The sending half of a `Pipeline`: lets whoever is producing the answer
/// hand over the real `PipelineHook` once it's known.
pub struct PipelineSender {
    inner: Rc<RefCell<PipelineState>>,
}

impl PipelineSender {
    pub fn complete(self, hook: Box<dyn PipelineHook>) {
        let waiters = {
            let mut state = self.inner.borrow_mut();
            match &mut *state {
                PipelineState::Unresolved { waiters } => {
                    std::mem::replace(waiters, SenderQueue::new())
                }
                _ => return,
            }
        };
        for (ops, tx) in waiters.drain() {
            let _ = tx.send(hook.get_pipelined_cap(&ops));
        }
        *self.inner.borrow_mut() = PipelineState::Resolved(hook);
    }
}

/// The answer to a call that hasn't come back yet. `get_pipelined_cap`
/// queries made before resolution each get their own `queued::Client`,
/// which will replay its calls once this pipeline resolves.
pub struct Pipeline {
    inner: Rc<RefCell<PipelineState>>,
}

impl Pipeline {
    pub fn new() -> (PipelineSender, Pipeline) {
        let inner = Rc::new(RefCell::new(PipelineState::Unresolved {
            waiters: SenderQueue::new(),
        }));
        (
            PipelineSender {
                inner: inner.clone(),
            },
            Pipeline { inner },
        )
    }

    /// Drives `fut` to completion in the background; if it resolves to an
    /// error before `PipelineSender::complete` was called, every
    /// outstanding and future `get_pipelined_cap` query is answered with
    /// that error instead of hanging forever.
    pub fn drive<F>(&mut self, fut: F)
    where
        F: std::future::Future<Output = Result<()>> + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_local(async move {
            if let Err(e) = fut.await {
                let waiters = {
                    let mut state = inner.borrow_mut();
                    match &mut *state {
                        PipelineState::Unresolved { waiters } => {
                            std::mem::replace(waiters, SenderQueue::new())
                        }
                        _ => return,
                    }
                };
                for (_, tx) in waiters.drain() {
                    let _ = tx.send(broken_hook(&e));
                }
                *inner.borrow_mut() = PipelineState::Broken(e);
            }
        });
    }
}

impl Clone for Pipeline {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl PipelineHook for Pipeline {
    fn add_ref(&self) -> Box<dyn PipelineHook> {
        Box::new(self.clone())
    }

    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Box<dyn ClientHook> {
        let mut state = self.inner.borrow_mut();
        match &mut *state {
            PipelineState::Resolved(hook) => hook.get_pipelined_cap(ops),
            PipelineState::Broken(e) => broken_hook(e),
            PipelineState::Unresolved { waiters } => {
                let promise = waiters.push(ops.to_vec());
                Box::new(Client::new(promise))
            }
        }
    }
}
