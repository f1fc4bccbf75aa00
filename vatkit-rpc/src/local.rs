// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! The local server dispatcher: a `ClientHook` in front of an in-process
//! `capability::Server`. Calls against the same client are delivered in
//! submission order — each call's body doesn't start running until the one
//! ahead of it has finished — by chaining a one-shot "go ahead" signal from
//! one call to the next, instead of a mutex, so the ordering survives
//! `dispatch_call` implementations that themselves await other capabilities.

use vatkit::Error;
use vatkit::capability::{self, Promise};
use vatkit::private::capability::{
    ClientHook, ParamsHook, PipelineHook, PipelineOp, RequestHook, ResponseHook, ResultsHook,
};
use vatkit::{any_pointer, message};

use futures_util::TryFutureExt;
use tokio::sync::oneshot;

use std::cell::RefCell;
use std::rc::Rc;

pub trait ResultsDoneHook {
    fn add_ref(&self) -> Box<dyn ResultsDoneHook>;
    fn get(&self) -> vatkit::Result<any_pointer::Reader>;
}

impl Clone for Box<dyn ResultsDoneHook> {
    fn clone(&self) -> Self {
        self.add_ref()
    }
}

pub struct Response {
    results: Box<dyn ResultsDoneHook>,
}

impl Response {
    fn new(results: Box<dyn ResultsDoneHook>) -> Self {
        Self { results }
    }
}

impl ResponseHook for Response {
    fn get(&self) -> vatkit::Result<any_pointer::Reader> {
        self.results.get()
    }
}

pub(crate) struct Params {
    request: message::Builder<message::HeapAllocator>,
}

impl Params {
    pub(crate) fn new(request: message::Builder<message::HeapAllocator>) -> Self {
        Self { request }
    }
}

impl ParamsHook for Params {
    fn get(&self) -> vatkit::Result<any_pointer::Reader> {
        self.request.get_root_as_reader()
    }
}

pub(crate) struct Results {
    message: Option<message::Builder<message::HeapAllocator>>,
    results_done_fulfiller: Option<oneshot::Sender<Box<dyn ResultsDoneHook>>>,
}

impl Results {
    pub(crate) fn new(fulfiller: oneshot::Sender<Box<dyn ResultsDoneHook>>) -> Self {
        Self {
            message: Some(message::Builder::new_default()),
            results_done_fulfiller: Some(fulfiller),
        }
    }
}

impl Drop for Results {
    fn drop(&mut self) {
        if let (Some(message), Some(fulfiller)) =
            (self.message.take(), self.results_done_fulfiller.take())
        {
            let _ = fulfiller.send(Box::new(ResultsDone::new(message)));
        } else {
            unreachable!()
        }
    }
}

impl ResultsHook for Results {
    fn get(&mut self) -> vatkit::Result<any_pointer::Builder> {
        match self.message {
            Some(ref mut message) => message.get_root(),
            None => unreachable!(),
        }
    }

    fn tail_call(self: Box<Self>, _request: Box<dyn RequestHook>) -> Promise<(), Error> {
        Promise::err(Error::unimplemented("tail calls are not supported".into()))
    }

    fn direct_tail_call(
        self: Box<Self>,
        _request: Box<dyn RequestHook>,
    ) -> (Promise<(), Error>, Box<dyn PipelineHook>) {
        unimplemented!("tail calls are not supported")
    }

    fn allow_cancellation(&self) {}
}

struct ResultsDoneInner {
    message: message::Builder<message::HeapAllocator>,
}

struct ResultsDone {
    inner: Rc<ResultsDoneInner>,
}

impl ResultsDone {
    fn new(message: message::Builder<message::HeapAllocator>) -> Self {
        Self {
            inner: Rc::new(ResultsDoneInner { message }),
        }
    }
}

impl ResultsDoneHook for ResultsDone {
    fn add_ref(&self) -> Box<dyn ResultsDoneHook> {
        Box::new(Self {
            inner: self.inner.clone(),
        })
    }
    fn get(&self) -> vatkit::Result<any_pointer::Reader> {
        self.inner.message.get_root_as_reader()
    }
}

pub struct Request {
    message: message::Builder<message::HeapAllocator>,
    interface_id: u64,
    method_id: u16,
    client: Box<dyn ClientHook>,
}

impl Request {
    pub fn new(
        interface_id: u64,
        method_id: u16,
        _size_hint: Option<vatkit::MessageSize>,
        client: Box<dyn ClientHook>,
    ) -> Self {
        Self {
            message: message::Builder::new_default(),
            interface_id,
            method_id,
            client,
        }
    }
}

impl RequestHook for Request {
    fn get(&mut self) -> any_pointer::Builder<'_> {
        self.message.get_root().unwrap()
    }
    fn get_brand(&self) -> usize {
        0
    }
    fn send(self: Box<Self>) -> capability::RemotePromise<any_pointer::Owned> {
        let Self {
            message,
            interface_id,
            method_id,
            client,
        } = *self;
        let params = Params::new(message);

        let (results_done_fulfiller, results_done_promise) =
            oneshot::channel::<Box<dyn ResultsDoneHook>>();
        let results_done_promise = results_done_promise.map_err(crate::canceled_to_error);
        let results = Results::new(results_done_fulfiller);
        let promise = client.call(interface_id, method_id, Box::new(params), Box::new(results));

        let (pipeline_sender, mut pipeline) = crate::queued::Pipeline::new();

        let p = futures_util::future::try_join(promise, results_done_promise).and_then(
            move |((), results_done_hook)| {
                pipeline_sender.complete(
                    Box::new(Pipeline::new(results_done_hook.add_ref())) as Box<dyn PipelineHook>
                );
                Promise::ok((
                    capability::Response::new(Box::new(Response::new(results_done_hook))),
                    (),
                ))
            },
        );

        let (left, right) = crate::split::split(p);

        pipeline.drive(right);
        let pipeline = any_pointer::Pipeline::new(Box::new(pipeline));

        capability::RemotePromise {
            promise: Promise::from_future(left),
            pipeline,
        }
    }
    fn tail_send(self: Box<Self>) -> Option<(u32, Promise<(), Error>, Box<dyn PipelineHook>)> {
        None
    }
}

struct PipelineInner {
    results: Box<dyn ResultsDoneHook>,
}

pub struct Pipeline {
    inner: Rc<RefCell<PipelineInner>>,
}

impl Pipeline {
    pub fn new(results: Box<dyn ResultsDoneHook>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(PipelineInner { results })),
        }
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
        let root = match self.inner.borrow_mut().results.get() {
            Ok(root) => root,
            Err(e) => return Box::new(crate::broken::Client::new(e, true, 0)),
        };
        match root.get_pipelined_cap(ops) {
            Ok(v) => v,
            Err(e) => Box::new(crate::broken::Client::new(e, true, 0)),
        }
    }
}

/// Chains one-at-a-time call delivery across however many `Client` handles
/// share the same server instance, so calls made through different clones
/// of the same `Client` still serialize against each other.
struct Serializer {
    tail: RefCell<oneshot::Receiver<()>>,
}

impl Serializer {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(());
        Self {
            tail: RefCell::new(rx),
        }
    }

    /// Returns a receiver that resolves once every call queued ahead of
    /// this one has finished, and a sender this call must fire (exactly
    /// once, when its own dispatch completes) to release whatever is
    /// queued behind it.
    fn enqueue(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (tx, next_rx) = oneshot::channel();
        let prev_rx = self.tail.replace(next_rx);
        (prev_rx, tx)
    }
}

pub struct Client<S>
where
    S: capability::Server + Clone,
{
    inner: S,
    order: Rc<Serializer>,
}

impl<S> Client<S>
where
    S: capability::Server + Clone,
{
    pub fn new(server: S) -> Self {
        Self {
            inner: server,
            order: Rc::new(Serializer::new()),
        }
    }
}

impl<S> Clone for Client<S>
where
    S: capability::Server + Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            order: self.order.clone(),
        }
    }
}

impl<S> ClientHook for Client<S>
where
    S: capability::Server + 'static + Clone,
{
    fn add_ref(&self) -> Box<dyn ClientHook> {
        Box::new(self.clone())
    }
    fn new_call(
        &self,
        interface_id: u64,
        method_id: u16,
        size_hint: Option<vatkit::MessageSize>,
    ) -> capability::Request<any_pointer::Owned, any_pointer::Owned> {
        capability::Request::new(Box::new(Request::new(
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
        // The call is queued rather than dispatched synchronously, so the
        // callee never observes a call before the caller's own request
        // object has been returned (avoiding a class of reentrancy races).
        // It additionally waits its turn behind every call already queued
        // on this client, so capability methods see E-order delivery
        // regardless of how the executor interleaves their futures. A
        // `dispatch_call` body that calls `context.ack()` releases the next
        // queued call right away instead of waiting for its own return,
        // matching `Go()`'s concurrent relaxation; one that never acks still
        // releases the next call the ordinary way, once it finishes.
        let inner = self.inner.clone();
        let (wait_for_turn, release_next) = self.order.enqueue();
        Promise::from_future(async move {
            let previous_abandoned = wait_for_turn.await.is_err();
            let release_next = Rc::new(RefCell::new(Some(release_next)));
            let ack_release = release_next.clone();
            let context = capability::Context::new(
                Box::new(move || {
                    if let Some(tx) = ack_release.borrow_mut().take() {
                        let _ = tx.send(());
                    }
                }),
                previous_abandoned,
            );
            let result = inner
                .dispatch_call(
                    interface_id,
                    method_id,
                    capability::Params::new(params),
                    capability::Results::new(results),
                    context,
                )
                .await;
            if let Some(tx) = release_next.borrow_mut().take() {
                let _ = tx.send(());
            }
            result
        })
    }

    fn get_ptr(&self) -> usize {
        self.inner.get_ptr()
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
        crate::rpc::default_when_resolved_impl(self)
    }

    fn is_local_client(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Records the arrival order of calls. The first call yields to the
    /// scheduler a few times before recording itself, so a dispatcher that
    /// ran calls concurrently instead of serializing them would let later
    /// calls record out of order.
    #[derive(Clone)]
    struct RecordingServer {
        order: Rc<RefCell<Vec<u32>>>,
        next_id: Rc<Cell<u32>>,
    }

    impl capability::Server for RecordingServer {
        async fn dispatch_call(
            self,
            _interface_id: u64,
            _method_id: u16,
            _params: capability::Params<any_pointer::Owned>,
            _results: capability::Results<any_pointer::Owned>,
            _context: capability::Context,
        ) -> vatkit::Result<()> {
            let id = self.next_id.get();
            self.next_id.set(id + 1);
            if id == 0 {
                for _ in 0..8 {
                    tokio::task::yield_now().await;
                }
            }
            self.order.borrow_mut().push(id);
            Ok(())
        }
        fn get_ptr(&self) -> usize {
            Rc::as_ptr(&self.order) as usize
        }
    }

    /// Acks immediately on its first call, then stalls for a while before
    /// returning; every other call returns as soon as it starts.
    #[derive(Clone)]
    struct AckingServer {
        log: Rc<RefCell<Vec<String>>>,
        next_id: Rc<Cell<u32>>,
    }

    impl capability::Server for AckingServer {
        async fn dispatch_call(
            self,
            _interface_id: u64,
            _method_id: u16,
            _params: capability::Params<any_pointer::Owned>,
            _results: capability::Results<any_pointer::Owned>,
            context: capability::Context,
        ) -> vatkit::Result<()> {
            let id = self.next_id.get();
            self.next_id.set(id + 1);
            self.log.borrow_mut().push(format!("start:{id}"));
            if id == 0 {
                context.ack();
                for _ in 0..8 {
                    tokio::task::yield_now().await;
                }
            }
            self.log.borrow_mut().push(format!("end:{id}"));
            Ok(())
        }
        fn get_ptr(&self) -> usize {
            Rc::as_ptr(&self.log) as usize
        }
    }

    #[tokio::test]
    async fn ack_releases_the_next_call_before_this_one_finishes() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let log = Rc::new(RefCell::new(Vec::new()));
                let client = Client::new(AckingServer {
                    log: log.clone(),
                    next_id: Rc::new(Cell::new(0)),
                });

                let first = client
                    .add_ref()
                    .call(0, 0, Box::new(NoopParams), Box::new(NoopResults));
                let second = client
                    .add_ref()
                    .call(0, 0, Box::new(NoopParams), Box::new(NoopResults));
                let h1 = tokio::task::spawn_local(async move {
                    first.await.unwrap();
                });
                let h2 = tokio::task::spawn_local(async move {
                    second.await.unwrap();
                });
                h1.await.unwrap();
                h2.await.unwrap();

                let log = log.borrow();
                let start_1 = log.iter().position(|e| e == "start:1").unwrap();
                let end_0 = log.iter().position(|e| e == "end:0").unwrap();
                assert!(
                    start_1 < end_0,
                    "second call should start before the first (which acked) finishes: {log:?}"
                );
            })
            .await;
    }

    #[tokio::test]
    async fn calls_are_delivered_in_submission_order() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let order = Rc::new(RefCell::new(Vec::new()));
                let client = Client::new(RecordingServer {
                    order: order.clone(),
                    next_id: Rc::new(Cell::new(0)),
                });

                // `call()` enqueues synchronously, establishing submission
                // order, before any of the returned promises are polled.
                let mut handles = Vec::new();
                for _ in 0..5u32 {
                    let hook = client.add_ref();
                    let promise = hook.call(0, 0, Box::new(NoopParams), Box::new(NoopResults));
                    handles.push(tokio::task::spawn_local(async move {
                        promise.await.unwrap();
                    }));
                }
                for h in handles {
                    h.await.unwrap();
                }
                assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
            })
            .await;
    }

    struct NoopParams;
    impl ParamsHook for NoopParams {
        fn get(&self) -> vatkit::Result<any_pointer::Reader> {
            Ok(any_pointer::Reader::new(any_pointer::Ptr::Null))
        }
    }

    struct NoopResults;
    impl ResultsHook for NoopResults {
        fn get(&mut self) -> vatkit::Result<any_pointer::Builder> {
            Err(Error::failed("unused in this test".into()))
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
}
