// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see broken.rs for the full text.

//! Pieces shared by every connection-side implementation (currently just
//! `twoparty`): how a connection reports protocol-fatal errors, how a
//! `ClientHook` resolves itself all the way down, and the embargo wrapper
//! that holds a disembargoed-pending capability's calls until the
//! round-trip that proves reordering can't happen completes.

use std::cell::RefCell;
use std::rc::Rc;

use vatkit::any_pointer;
use vatkit::capability::{self, Promise};
use vatkit::private::capability::{ClientHook, ParamsHook, PipelineOp, ResultsHook};
use vatkit::{Error, MessageSize};

/// Where a connection sends reports of errors it can't hand back to a
/// caller (a malformed message, a send failure) instead of panicking.
pub trait ErrorReporter {
    fn report_error(&self, error: Error);
}

/// Reports every error through `tracing`, tagged with the connection's
/// debug name. The default for demos and tests: log it and move on.
pub struct TracingErrorReporter {
    pub connection_name: String,
}

impl ErrorReporter for TracingErrorReporter {
    fn report_error(&self, error: Error) {
        tracing::error!(connection = %self.connection_name, kind = ?error.kind, "{}", error.description);
    }
}

/// Construction-time configuration for a connection: the bootstrap
/// capability to offer the peer, where to report errors, and how outgoing
/// message bytes are throttled. Passed to `twoparty::connect` directly
/// rather than read from an environment or config file.
pub struct Options {
    pub bootstrap: Option<capability::Client>,
    pub error_reporter: Rc<dyn ErrorReporter>,
    pub flow_limiter: Rc<dyn crate::flow_control::FlowLimiter>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            bootstrap: None,
            error_reporter: Rc::new(TracingErrorReporter {
                connection_name: "vatkit".into(),
            }),
            flow_limiter: Rc::new(crate::flow_control::FixedLimiter::new(64 * 1024 * 1024)),
        }
    }
}

/// Walks `hook.when_more_resolved()` until it bottoms out, the standard
/// implementation of `ClientHook::when_resolved` for any hook that can
/// resolve further (`local::Client` and `queued::Client` both delegate
/// here).
pub fn default_when_resolved_impl(hook: &dyn ClientHook) -> Promise<(), Error> {
    match hook.when_more_resolved() {
        None => Promise::ok(()),
        Some(promise) => Promise::from_future(async move {
            let mut current = promise.await?;
            while let Some(next) = current.when_more_resolved() {
                current = next.await?;
            }
            Ok(())
        }),
    }
}

enum EmbargoState {
    Embargoed { waiters: Vec<oneshot::Sender<()>> },
    Lifted,
}

use tokio::sync::oneshot;

/// Wraps a capability that a connection has determined now points back at
/// something local (or at least, not behind the peer that handed it to us)
/// but which must not be called yet: earlier pipelined calls to the same
/// capability, sent to the peer before the promise resolved, might still be
/// in flight and must be delivered first. Calls queue until `lift()` is
/// called, exactly like `queued::Client` queues on an unresolved promise —
/// the difference is what it's waiting for (a Disembargo round-trip, not a
/// Return).
pub struct Embargo {
    target: Box<dyn ClientHook>,
    state: Rc<RefCell<EmbargoState>>,
}

impl Embargo {
    pub fn new(target: Box<dyn ClientHook>) -> Self {
        Self {
            target,
            state: Rc::new(RefCell::new(EmbargoState::Embargoed {
                waiters: Vec::new(),
            })),
        }
    }

    /// Releases every call queued so far, and any call made from now on,
    /// straight through to the target. Must be called at most once.
    pub fn lift(&self) {
        let waiters = {
            let mut state = self.state.borrow_mut();
            match std::mem::replace(&mut *state, EmbargoState::Lifted) {
                EmbargoState::Embargoed { waiters } => waiters,
                EmbargoState::Lifted => return,
            }
        };
        for tx in waiters {
            let _ = tx.send(());
        }
    }

    fn wait_for_lift(&self) -> Option<oneshot::Receiver<()>> {
        let mut state = self.state.borrow_mut();
        match &mut *state {
            EmbargoState::Lifted => None,
            EmbargoState::Embargoed { waiters } => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(rx)
            }
        }
    }
}

impl Clone for Embargo {
    fn clone(&self) -> Self {
        Self {
            target: self.target.add_ref(),
            state: self.state.clone(),
        }
    }
}

impl ClientHook for Embargo {
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
        match self.wait_for_lift() {
            None => self.target.call(interface_id, method_id, params, results),
            Some(rx) => {
                let target = self.target.add_ref();
                Promise::from_future(async move {
                    let _ = rx.await;
                    target.call(interface_id, method_id, params, results).await
                })
            }
        }
    }

    fn get_ptr(&self) -> usize {
        self.target.get_ptr()
    }

    fn get_brand(&self) -> usize {
        self.target.get_brand()
    }

    fn get_resolved(&self) -> Option<Box<dyn ClientHook>> {
        match &*self.state.borrow() {
            EmbargoState::Lifted => Some(self.target.add_ref()),
            EmbargoState::Embargoed { .. } => None,
        }
    }

    fn when_more_resolved(&self) -> Option<Promise<Box<dyn ClientHook>, Error>> {
        match self.wait_for_lift() {
            None => None,
            Some(rx) => {
                let target = self.target.add_ref();
                Some(Promise::from_future(async move {
                    let _ = rx.await;
                    Ok(target)
                }))
            }
        }
    }

    fn when_resolved(&self) -> Promise<(), Error> {
        default_when_resolved_impl(self)
    }

    fn is_local_client(&self) -> bool {
        false
    }
}

/// Applies a pipeline transform's field indices against a capability
/// already on hand — used when a `PromisedAnswer` target resolves to a
/// local answer's results.
pub fn pipelined_cap(hook: &dyn vatkit::private::capability::PipelineHook, fields: &[u16]) -> Box<dyn ClientHook> {
    let ops: Vec<PipelineOp> = fields.iter().copied().map(PipelineOp::field).collect();
    hook.get_pipelined_cap(&ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vatkit::any_pointer::Ptr;
    use vatkit::private::capability::{RequestHook, PipelineHook};

    struct NoopHook;
    impl ClientHook for NoopHook {
        fn add_ref(&self) -> Box<dyn ClientHook> {
            Box::new(NoopHook)
        }
        fn new_call(
            &self,
            _interface_id: u64,
            _method_id: u16,
            _size_hint: Option<MessageSize>,
        ) -> capability::Request<any_pointer::Owned, any_pointer::Owned> {
            unimplemented!()
        }
        fn call(
            &self,
            _interface_id: u64,
            _method_id: u16,
            _params: Box<dyn ParamsHook>,
            _results: Box<dyn ResultsHook>,
        ) -> Promise<(), Error> {
            Promise::ok(())
        }
        fn get_ptr(&self) -> usize {
            0
        }
        fn get_brand(&self) -> usize {
            0
        }
        fn get_resolved(&self) -> Option<Box<dyn ClientHook>> {
            None
        }
        fn when_more_resolved(&self) -> Option<Promise<Box<dyn ClientHook>, Error>> {
            None
        }
        fn when_resolved(&self) -> Promise<(), Error> {
            Promise::ok(())
        }
        fn is_local_client(&self) -> bool {
            true
        }
    }

    struct NoopParams;
    impl ParamsHook for NoopParams {
        fn get(&self) -> vatkit::Result<any_pointer::Reader> {
            Ok(any_pointer::Reader::new(Ptr::Null))
        }
    }
    struct NoopResults;
    impl ResultsHook for NoopResults {
        fn get(&mut self) -> vatkit::Result<any_pointer::Builder> {
            Err(Error::failed("unused".into()))
        }
        fn tail_call(self: Box<Self>, _request: Box<dyn RequestHook>) -> Promise<(), Error> {
            unimplemented!()
        }
        fn direct_tail_call(
            self: Box<Self>,
            _request: Box<dyn RequestHook>,
        ) -> (Promise<(), Error>, Box<dyn PipelineHook>) {
            unimplemented!()
        }
        fn allow_cancellation(&self) {}
    }

    #[tokio::test]
    async fn calls_wait_for_lift_then_go_through() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let embargo = Embargo::new(Box::new(NoopHook));
                let call = embargo.call(0, 0, Box::new(NoopParams), Box::new(NoopResults));
                let handle = tokio::task::spawn_local(call);
                tokio::task::yield_now().await;
                embargo.lift();
                handle.await.unwrap().unwrap();
            })
            .await;
    }
}
