// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see broken.rs for the full text.

//! The two-party connection: a wire protocol over one `AsyncRead`/
//! `AsyncWrite` pair, plus the question/answer/export/import tables that
//! turn frames into `ClientHook`s and back.
//!
//! One corner is intentionally narrower than a full three-party-capable
//! implementation: `sendCap` here never emits
//! `CapDescriptor::ReceiverAnswer` (a capability pointing at one of the
//! peer's own in-flight calls always falls through to a fresh
//! `SenderHosted` export instead). Every `Call` we make while its target
//! answer hasn't resolved still pipelines properly: it addresses the peer
//! directly with `MessageTarget::PromisedAnswer`, which the receiving
//! dispatch loop resolves against its own answer table.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use futures_util::TryFutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use vatkit::capability::{self, Promise};
use vatkit::private::capability::{ClientHook, ParamsHook, PipelineHook, PipelineOp, ResultsHook};
use vatkit::{any_pointer, message, Error, Result};

use crate::id_pool::IdPool;
use crate::rpc::Options;

/// A tagged pointer value, the wire counterpart of `any_pointer::Ptr`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum WireValue {
    Null,
    Struct(Vec<WireValue>),
    List(Vec<WireValue>),
    /// Index into the accompanying `WirePayload::cap_table`.
    Capability(u32),
}

/// How a capability referenced from a payload is hosted, mirroring
/// `rpc.capnp`'s `CapDescriptor` union (minus `senderPromise` — see the
/// module doc comment).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum CapDescriptor {
    None,
    /// An export on the sender's side; the receiver should import it.
    SenderHosted(u32),
    /// One of the receiver's own exports, being handed back to it.
    ReceiverHosted(u32),
    /// A capability extracted from one of the receiver's own in-flight
    /// answers.
    ReceiverAnswer { question_id: u32, transform: Vec<u16> },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WirePayload {
    pub content: WireValue,
    pub cap_table: Vec<CapDescriptor>,
}

/// What a `Call` is addressed to.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum MessageTarget {
    /// One of the receiver's exports.
    ImportedCap(u32),
    /// A field path into one of the receiver's own in-flight answers —
    /// the payload that makes promise pipelining work across a connection.
    PromisedAnswer { question_id: u32, transform: Vec<u16> },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum ReturnResult {
    Results(WirePayload),
    Exception(Error),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum DisembargoContext {
    SenderLoopback(u32),
    ReceiverLoopback(u32),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Message {
    Bootstrap { question_id: u32 },
    Call {
        question_id: u32,
        target: MessageTarget,
        interface_id: u64,
        method_id: u16,
        params: WirePayload,
    },
    Return { answer_id: u32, result: ReturnResult },
    Finish { question_id: u32, release_result_caps: bool },
    Release { id: u32, reference_count: u32 },
    Disembargo { target: MessageTarget, context: DisembargoContext },
}

struct ExportEntry {
    client: Box<dyn ClientHook>,
    wire_refs: u32,
}

struct Exports {
    ids: IdPool,
    entries: HashMap<u32, ExportEntry>,
    by_ptr: HashMap<usize, u32>,
}

struct ImportRecord {
    wire_refs: u32,
    handle: Weak<ImportHandle>,
}

/// One answer's place in the Return/Finish interlock: the entry survives in
/// the table until both `return_sent` and `finish_received` are true, since
/// either message can arrive first; `export_refs` is whatever `SenderHosted`
/// export ids the `Return`'s payload added or re-incremented, released only
/// if the `Finish` that completes the pair asked for it via
/// `release_result_caps`.
struct AnswerEntry {
    pipeline: Box<dyn PipelineHook>,
    return_sent: bool,
    finish_received: bool,
    release_result_caps: bool,
    export_refs: Vec<u32>,
}

struct QuestionEntry {
    result_tx: Option<oneshot::Sender<Result<any_pointer::Ptr>>>,
}

struct Questions {
    ids: IdPool,
    entries: HashMap<u32, QuestionEntry>,
}

struct ConnState {
    sender: RefCell<vatkit_io::write_queue::Sender<Message>>,
    options: Options,
    questions: RefCell<Questions>,
    answers: RefCell<HashMap<u32, AnswerEntry>>,
    exports: RefCell<Exports>,
    imports: RefCell<HashMap<u32, ImportRecord>>,
    /// While `encode_payload_capturing` is running, every export id minted
    /// or re-incremented by `send_cap` is recorded here so the caller can
    /// attribute it to a specific answer. `encode_payload` (used anywhere
    /// else a payload is encoded) never sets this, so `send_cap` is a no-op
    /// on it otherwise.
    export_capture: RefCell<Option<Vec<u32>>>,
}

impl ConnState {
    fn brand(self: &Rc<Self>) -> usize {
        Rc::as_ptr(self) as usize
    }

    async fn send_message(self: &Rc<Self>, message: Message) -> Result<()> {
        let fut = self.sender.borrow_mut().send(message);
        fut.await?;
        Ok(())
    }

    fn begin_question(self: &Rc<Self>) -> (u32, oneshot::Receiver<Result<any_pointer::Ptr>>) {
        let (tx, rx) = oneshot::channel();
        let mut questions = self.questions.borrow_mut();
        let id = questions.ids.acquire();
        questions.entries.insert(id, QuestionEntry { result_tx: Some(tx) });
        (id, rx)
    }

    fn end_question(self: &Rc<Self>, id: u32) {
        let mut questions = self.questions.borrow_mut();
        if questions.entries.remove(&id).is_some() {
            questions.ids.release(id);
        }
    }

    fn resolve_question(self: &Rc<Self>, answer_id: u32, result: ReturnResult) {
        let entry = self.questions.borrow_mut().entries.remove(&answer_id);
        if let Some(mut entry) = entry {
            if let Some(tx) = entry.result_tx.take() {
                let outcome = match result {
                    ReturnResult::Results(payload) => Ok(self.decode_payload(payload)),
                    ReturnResult::Exception(e) => Err(e),
                };
                let _ = tx.send(outcome);
            }
        }
        self.questions.borrow_mut().ids.release(answer_id);
    }

    fn resolve_target(self: &Rc<Self>, target: &MessageTarget) -> Result<Box<dyn ClientHook>> {
        match target {
            MessageTarget::ImportedCap(id) => self
                .exports
                .borrow()
                .entries
                .get(id)
                .map(|e| e.client.add_ref())
                .ok_or_else(|| Error::failed(format!("no such export {id}"))),
            MessageTarget::PromisedAnswer { question_id, transform } => {
                let pipeline = self
                    .answers
                    .borrow()
                    .get(question_id)
                    .map(|a| a.pipeline.add_ref())
                    .ok_or_else(|| Error::failed(format!("no such answer {question_id}")))?;
                let ops: Vec<PipelineOp> = transform.iter().copied().map(PipelineOp::field).collect();
                Ok(pipeline.get_pipelined_cap(&ops))
            }
        }
    }

    fn encode_payload(self: &Rc<Self>, root: &any_pointer::Ptr) -> WirePayload {
        self.encode_payload_capturing(root).0
    }

    /// Like `encode_payload`, but also returns every export id `send_cap`
    /// minted or re-incremented while encoding — the set an answer's
    /// `export_refs` needs to remember for a later `releaseResultCaps`.
    fn encode_payload_capturing(self: &Rc<Self>, root: &any_pointer::Ptr) -> (WirePayload, Vec<u32>) {
        *self.export_capture.borrow_mut() = Some(Vec::new());
        let mut cap_table = Vec::new();
        let content = self.encode_value(root, &mut cap_table);
        let captured = self.export_capture.borrow_mut().take().unwrap_or_default();
        (WirePayload { content, cap_table }, captured)
    }

    fn encode_value(self: &Rc<Self>, ptr: &any_pointer::Ptr, cap_table: &mut Vec<CapDescriptor>) -> WireValue {
        match ptr {
            any_pointer::Ptr::Null => WireValue::Null,
            any_pointer::Ptr::Struct(fields) => {
                WireValue::Struct(fields.iter().map(|f| self.encode_value(f, cap_table)).collect())
            }
            any_pointer::Ptr::List(items) => {
                WireValue::List(items.iter().map(|f| self.encode_value(f, cap_table)).collect())
            }
            any_pointer::Ptr::Capability(hook) => {
                let descriptor = self.send_cap(hook.as_ref());
                let index = cap_table.len() as u32;
                cap_table.push(descriptor);
                WireValue::Capability(index)
            }
        }
    }

    /// `sendCap`'s dispatch: hand back an import of ours as a
    /// `ReceiverHosted` reexport, otherwise export it fresh (reusing the
    /// existing export id if this exact capability is already exported).
    fn send_cap(self: &Rc<Self>, hook: &dyn ClientHook) -> CapDescriptor {
        if hook.get_brand() == self.brand() {
            return CapDescriptor::ReceiverHosted(hook.get_ptr() as u32);
        }
        let ptr_key = hook.get_ptr();
        let mut exports = self.exports.borrow_mut();
        let id = if let Some(&id) = exports.by_ptr.get(&ptr_key) {
            exports.entries.get_mut(&id).unwrap().wire_refs += 1;
            id
        } else {
            let id = exports.ids.acquire();
            exports.entries.insert(
                id,
                ExportEntry {
                    client: hook.add_ref(),
                    wire_refs: 1,
                },
            );
            exports.by_ptr.insert(ptr_key, id);
            id
        };
        drop(exports);
        if let Some(buf) = self.export_capture.borrow_mut().as_mut() {
            buf.push(id);
        }
        CapDescriptor::SenderHosted(id)
    }

    fn decode_payload(self: &Rc<Self>, payload: WirePayload) -> any_pointer::Ptr {
        self.decode_value(&payload.content, &payload.cap_table)
    }

    fn decode_value(self: &Rc<Self>, value: &WireValue, cap_table: &[CapDescriptor]) -> any_pointer::Ptr {
        match value {
            WireValue::Null => any_pointer::Ptr::Null,
            WireValue::Struct(fields) => {
                any_pointer::Ptr::Struct(fields.iter().map(|f| self.decode_value(f, cap_table)).collect())
            }
            WireValue::List(items) => {
                any_pointer::Ptr::List(items.iter().map(|f| self.decode_value(f, cap_table)).collect())
            }
            WireValue::Capability(index) => {
                let hook = match cap_table.get(*index as usize) {
                    Some(descriptor) => self.receive_cap(descriptor),
                    None => broken("capability index out of range"),
                };
                any_pointer::Ptr::Capability(hook)
            }
        }
    }

    fn receive_cap(self: &Rc<Self>, descriptor: &CapDescriptor) -> Box<dyn ClientHook> {
        match descriptor {
            CapDescriptor::None => broken("null capability"),
            CapDescriptor::SenderHosted(id) => self.import_client(*id),
            CapDescriptor::ReceiverHosted(id) => self
                .exports
                .borrow()
                .entries
                .get(id)
                .map(|e| e.client.add_ref())
                .unwrap_or_else(|| broken(&format!("no such export {id}"))),
            CapDescriptor::ReceiverAnswer { question_id, transform } => {
                match self.answers.borrow().get(question_id) {
                    Some(entry) => {
                        let ops: Vec<PipelineOp> = transform.iter().copied().map(PipelineOp::field).collect();
                        entry.pipeline.get_pipelined_cap(&ops)
                    }
                    None => broken(&format!("no such answer {question_id}")),
                }
            }
        }
    }

    fn import_client(self: &Rc<Self>, id: u32) -> Box<dyn ClientHook> {
        let mut imports = self.imports.borrow_mut();
        if let Some(record) = imports.get_mut(&id) {
            if let Some(handle) = record.handle.upgrade() {
                record.wire_refs += 1;
                return Box::new(Client { handle });
            }
        }
        let handle = Rc::new(ImportHandle {
            conn: self.clone(),
            id,
        });
        imports.insert(
            id,
            ImportRecord {
                wire_refs: 1,
                handle: Rc::downgrade(&handle),
            },
        );
        Box::new(Client { handle })
    }

    /// Applies one side of the Return/Finish interlock to an answer entry —
    /// `update` sets whichever flag (and `export_refs`/`release_result_caps`)
    /// just became true — and destroys the entry once both `return_sent` and
    /// `finish_received` are set, releasing its recorded export refs if
    /// `release_result_caps` was requested.
    fn finish_answer_flag(self: &Rc<Self>, question_id: u32, update: impl FnOnce(&mut AnswerEntry)) {
        let mut answers = self.answers.borrow_mut();
        let destroy = if let Some(entry) = answers.get_mut(&question_id) {
            update(entry);
            entry.return_sent && entry.finish_received
        } else {
            false
        };
        if !destroy {
            return;
        }
        let entry = answers.remove(&question_id).unwrap();
        drop(answers);
        if entry.release_result_caps && !entry.export_refs.is_empty() {
            self.release_export_refs(&entry.export_refs);
        }
    }

    /// Decrements one wire reference per id — the release an answer's
    /// `export_refs` owes the export table once `releaseResultCaps` fires.
    fn release_export_refs(self: &Rc<Self>, ids: &[u32]) {
        let mut exports = self.exports.borrow_mut();
        for &id in ids {
            let mut remove = false;
            if let Some(entry) = exports.entries.get_mut(&id) {
                if entry.wire_refs <= 1 {
                    remove = true;
                } else {
                    entry.wire_refs -= 1;
                }
            }
            if remove {
                exports.entries.remove(&id);
                exports.by_ptr.retain(|_, v| *v != id);
                exports.ids.release(id);
            }
        }
    }

    fn dispatch_message(self: &Rc<Self>, message: Message) {
        match message {
            Message::Bootstrap { question_id } => self.handle_bootstrap(question_id),
            Message::Call {
                question_id,
                target,
                interface_id,
                method_id,
                params,
            } => self.handle_call(question_id, target, interface_id, method_id, params),
            Message::Return { answer_id, result } => {
                self.resolve_question(answer_id, result);
                let conn = self.clone();
                tokio::task::spawn_local(async move {
                    let _ = conn
                        .send_message(Message::Finish {
                            question_id: answer_id,
                            release_result_caps: true,
                        })
                        .await;
                });
            }
            Message::Finish {
                question_id,
                release_result_caps,
            } => {
                self.finish_answer_flag(question_id, |entry| {
                    entry.finish_received = true;
                    entry.release_result_caps = release_result_caps;
                });
            }
            Message::Release { id, reference_count } => self.handle_release(id, reference_count),
            Message::Disembargo { target, context } => self.handle_disembargo(target, context),
        }
    }

    fn handle_bootstrap(self: &Rc<Self>, question_id: u32) {
        let (result, export_refs) = match &self.options.bootstrap {
            Some(client) => {
                let root = any_pointer::Ptr::Capability(client.hook.add_ref());
                let (payload, export_refs) = self.encode_payload_capturing(&root);
                self.answers.borrow_mut().insert(
                    question_id,
                    AnswerEntry {
                        pipeline: Box::new(ResolvedPipeline { root: root.clone() }),
                        return_sent: false,
                        finish_received: false,
                        release_result_caps: false,
                        export_refs: Vec::new(),
                    },
                );
                (ReturnResult::Results(payload), export_refs)
            }
            None => (
                ReturnResult::Exception(Error::unimplemented("no bootstrap interface".into())),
                Vec::new(),
            ),
        };
        let conn = self.clone();
        tokio::task::spawn_local(async move {
            let _ = conn
                .send_message(Message::Return {
                    answer_id: question_id,
                    result,
                })
                .await;
            conn.finish_answer_flag(question_id, |entry| {
                entry.return_sent = true;
                entry.export_refs = export_refs;
            });
        });
    }

    fn handle_call(
        self: &Rc<Self>,
        question_id: u32,
        target: MessageTarget,
        interface_id: u64,
        method_id: u16,
        params: WirePayload,
    ) {
        let target_hook = match self.resolve_target(&target) {
            Ok(h) => h,
            Err(e) => {
                let conn = self.clone();
                tokio::task::spawn_local(async move {
                    let _ = conn
                        .send_message(Message::Return {
                            answer_id: question_id,
                            result: ReturnResult::Exception(e),
                        })
                        .await;
                });
                return;
            }
        };

        let param_ptr = self.decode_payload(params);
        let mut builder_message = message::Builder::<message::HeapAllocator>::new_default();
        if let Ok(mut root) = builder_message.get_root() {
            root.set_ptr(param_ptr);
        }
        let params_hook = crate::local::Params::new(builder_message);
        let (results_done_tx, results_done_rx) =
            oneshot::channel::<Box<dyn crate::local::ResultsDoneHook>>();
        let results_hook = crate::local::Results::new(results_done_tx);

        let call_promise = target_hook.call(interface_id, method_id, Box::new(params_hook), Box::new(results_hook));
        let (pipeline_sender, mut pipeline) = crate::queued::Pipeline::new();
        let results_done_rx = results_done_rx.map_err(crate::canceled_to_error);

        // If our own `Finish` flag is already set by the time the callee's
        // results are in hand, a `Finish` raced ahead of this `Return`: the
        // `Return` itself still carries the real results below, but any
        // local pipelined caller (only reachable via a `PromisedAnswer` from
        // the same peer that just gave up on this question) is rejected
        // instead of resolved.
        let interlock_conn = self.clone();
        let joined = futures_util::future::try_join(call_promise, results_done_rx).and_then(
            move |((), results_done_hook)| {
                let finished = interlock_conn
                    .answers
                    .borrow()
                    .get(&question_id)
                    .map(|e| e.finish_received)
                    .unwrap_or(false);
                if finished {
                    pipeline_sender.complete(crate::broken::broken_pipeline(Error::failed(
                        "received finish before return".into(),
                    )));
                } else {
                    pipeline_sender.complete(
                        Box::new(crate::local::Pipeline::new(results_done_hook.add_ref())) as Box<dyn PipelineHook>
                    );
                }
                Promise::ok((results_done_hook, ()))
            },
        );
        let (left, right) = crate::split::split(joined);
        pipeline.drive(right);
        self.answers.borrow_mut().insert(
            question_id,
            AnswerEntry {
                pipeline: Box::new(pipeline),
                return_sent: false,
                finish_received: false,
                release_result_caps: false,
                export_refs: Vec::new(),
            },
        );

        let conn = self.clone();
        tokio::task::spawn_local(async move {
            let (result, export_refs) = match left.await.and_then(|hook| hook.get().map(|r| r.into_ptr())) {
                Ok(root) => {
                    let (payload, export_refs) = conn.encode_payload_capturing(&root);
                    (ReturnResult::Results(payload), export_refs)
                }
                Err(e) => (ReturnResult::Exception(e), Vec::new()),
            };
            let _ = conn
                .send_message(Message::Return {
                    answer_id: question_id,
                    result,
                })
                .await;
            conn.finish_answer_flag(question_id, |entry| {
                entry.return_sent = true;
                entry.export_refs = export_refs;
            });
        });
    }

    /// A `reference_count` that matches `wire_refs` exactly is a normal
    /// last-reference release; one that exceeds it is the peer claiming more
    /// references than it was ever given, a protocol violation that gets
    /// reported and tears the connection down rather than silently treated
    /// like an ordinary release.
    fn handle_release(self: &Rc<Self>, id: u32, reference_count: u32) {
        let mut exports = self.exports.borrow_mut();
        enum Outcome {
            None,
            Remove,
            Violation(u32),
        }
        let outcome = match exports.entries.get_mut(&id) {
            Some(entry) if reference_count == entry.wire_refs => Outcome::Remove,
            Some(entry) if reference_count > entry.wire_refs => Outcome::Violation(entry.wire_refs),
            Some(entry) => {
                entry.wire_refs -= reference_count;
                Outcome::None
            }
            None => Outcome::None,
        };
        match outcome {
            Outcome::None => {}
            Outcome::Remove => {
                exports.entries.remove(&id);
                exports.by_ptr.retain(|_, v| *v != id);
                exports.ids.release(id);
            }
            Outcome::Violation(wire_refs) => {
                exports.entries.remove(&id);
                exports.by_ptr.retain(|_, v| *v != id);
                exports.ids.release(id);
                drop(exports);
                let error = Error::failed(format!(
                    "released too many references to export {id}: had {wire_refs}, released {reference_count}"
                ));
                self.options.error_reporter.report_error(error.clone());
                let conn = self.clone();
                tokio::task::spawn_local(async move {
                    let _ = conn.sender.borrow_mut().terminate(Err(error), false).await;
                });
            }
        }
    }

    /// A `Disembargo` we receive always carries a `SenderLoopback` context
    /// (our own sender never constructs one — see the module doc comment),
    /// so the only behavior needed is the mandatory echo-back.
    fn handle_disembargo(self: &Rc<Self>, target: MessageTarget, context: DisembargoContext) {
        if let DisembargoContext::SenderLoopback(id) = context {
            let conn = self.clone();
            tokio::task::spawn_local(async move {
                let _ = conn
                    .send_message(Message::Disembargo {
                        target,
                        context: DisembargoContext::ReceiverLoopback(id),
                    })
                    .await;
            });
        }
    }
}

fn broken(message: &str) -> Box<dyn ClientHook> {
    Box::new(crate::broken::Client::new(Error::failed(message.into()), true, 0))
}

/// A capability extracted from a root pointer that is already fully known
/// (a bootstrap interface, or an answer's final result) — `get_pipelined_cap`
/// just replays the transform against it.
struct ResolvedPipeline {
    root: any_pointer::Ptr,
}

impl PipelineHook for ResolvedPipeline {
    fn add_ref(&self) -> Box<dyn PipelineHook> {
        Box::new(ResolvedPipeline { root: self.root.clone() })
    }
    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Box<dyn ClientHook> {
        match any_pointer::transform(&self.root, ops).and_then(|p| p.client()) {
            Ok(hook) => hook,
            Err(e) => Box::new(crate::broken::Client::new(e, true, 0)),
        }
    }
}

struct ImportHandle {
    conn: Rc<ConnState>,
    id: u32,
}

impl Drop for ImportHandle {
    fn drop(&mut self) {
        let wire_refs = self
            .conn
            .imports
            .borrow_mut()
            .remove(&self.id)
            .map(|r| r.wire_refs)
            .unwrap_or(0);
        if wire_refs > 0 {
            let conn = self.conn.clone();
            let id = self.id;
            tokio::task::spawn_local(async move {
                let _ = conn
                    .send_message(Message::Release {
                        id,
                        reference_count: wire_refs,
                    })
                    .await;
            });
        }
    }
}

/// An import: a capability the peer exported to us. Every call sent through
/// it addresses `MessageTarget::ImportedCap` on the peer.
#[derive(Clone)]
pub struct Client {
    handle: Rc<ImportHandle>,
}

impl ClientHook for Client {
    fn add_ref(&self) -> Box<dyn ClientHook> {
        Box::new(self.clone())
    }

    fn new_call(
        &self,
        interface_id: u64,
        method_id: u16,
        _size_hint: Option<vatkit::MessageSize>,
    ) -> capability::Request<any_pointer::Owned, any_pointer::Owned> {
        capability::Request::new(Box::new(Request::new(
            self.handle.conn.clone(),
            MessageTarget::ImportedCap(self.handle.id),
            interface_id,
            method_id,
        )))
    }

    fn call(
        &self,
        interface_id: u64,
        method_id: u16,
        params: Box<dyn ParamsHook>,
        results: Box<dyn ResultsHook>,
    ) -> Promise<(), Error> {
        let conn = self.handle.conn.clone();
        let target = MessageTarget::ImportedCap(self.handle.id);
        remote_call(conn, target, interface_id, method_id, params, results)
    }

    fn get_ptr(&self) -> usize {
        self.handle.id as usize
    }

    fn get_brand(&self) -> usize {
        Rc::as_ptr(&self.handle.conn) as usize
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
        false
    }
}

/// A capability pipelined off one of our own outgoing questions, before its
/// answer has come back. Every call addresses `MessageTarget::PromisedAnswer`
/// directly, which is what lets a chain of pipelined calls avoid waiting on
/// the round trip at all.
#[derive(Clone)]
pub struct PipelineClient {
    conn: Rc<ConnState>,
    question_id: u32,
    transform: Vec<PipelineOp>,
}

impl ClientHook for PipelineClient {
    fn add_ref(&self) -> Box<dyn ClientHook> {
        Box::new(self.clone())
    }

    fn new_call(
        &self,
        interface_id: u64,
        method_id: u16,
        _size_hint: Option<vatkit::MessageSize>,
    ) -> capability::Request<any_pointer::Owned, any_pointer::Owned> {
        let transform = self.transform.iter().map(|op| op.field).collect();
        capability::Request::new(Box::new(Request::new(
            self.conn.clone(),
            MessageTarget::PromisedAnswer {
                question_id: self.question_id,
                transform,
            },
            interface_id,
            method_id,
        )))
    }

    fn call(
        &self,
        interface_id: u64,
        method_id: u16,
        params: Box<dyn ParamsHook>,
        results: Box<dyn ResultsHook>,
    ) -> Promise<(), Error> {
        let transform = self.transform.iter().map(|op| op.field).collect();
        let target = MessageTarget::PromisedAnswer {
            question_id: self.question_id,
            transform,
        };
        remote_call(self.conn.clone(), target, interface_id, method_id, params, results)
    }

    fn get_ptr(&self) -> usize {
        0
    }

    // Never mistaken for a reexportable import — see `ConnState::send_cap`.
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
        false
    }
}

/// The answer to one of our own outgoing questions, addressable before it
/// resolves (via `PipelineClient`).
#[derive(Clone)]
struct QuestionPipeline {
    conn: Rc<ConnState>,
    question_id: u32,
}

impl PipelineHook for QuestionPipeline {
    fn add_ref(&self) -> Box<dyn PipelineHook> {
        Box::new(self.clone())
    }
    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Box<dyn ClientHook> {
        Box::new(PipelineClient {
            conn: self.conn.clone(),
            question_id: self.question_id,
            transform: ops.to_vec(),
        })
    }
}

fn remote_call(
    conn: Rc<ConnState>,
    target: MessageTarget,
    interface_id: u64,
    method_id: u16,
    params: Box<dyn ParamsHook>,
    mut results: Box<dyn ResultsHook>,
) -> Promise<(), Error> {
    Promise::from_future(async move {
        let params_ptr = params.get()?.into_ptr();
        let payload = conn.encode_payload(&params_ptr);
        let (question_id, rx) = conn.begin_question();
        if let Err(e) = conn
            .send_message(Message::Call {
                question_id,
                target,
                interface_id,
                method_id,
                params: payload,
            })
            .await
        {
            conn.end_question(question_id);
            return Err(e);
        }
        let result_ptr = match rx.await {
            Ok(r) => r?,
            Err(e) => return Err(crate::canceled_to_error(e)),
        };
        let mut builder = results.get()?;
        builder.set_ptr(result_ptr);
        Ok(())
    })
}

struct ResolvedResponse {
    ptr: any_pointer::Ptr,
}

impl vatkit::private::capability::ResponseHook for ResolvedResponse {
    fn get(&self) -> Result<any_pointer::Reader> {
        Ok(any_pointer::Reader::new(self.ptr.clone()))
    }
}

/// A call built against a remote target: params are encoded and the `Call`
/// message sent the moment `send()` is called, and the returned pipeline
/// addresses the new question directly — so a caller that immediately
/// pipelines off the result sends its own `Call` before this one's `Return`
/// has come back.
struct Request {
    conn: Rc<ConnState>,
    target: MessageTarget,
    interface_id: u64,
    method_id: u16,
    message: message::Builder<message::HeapAllocator>,
}

impl Request {
    fn new(conn: Rc<ConnState>, target: MessageTarget, interface_id: u64, method_id: u16) -> Self {
        Self {
            conn,
            target,
            interface_id,
            method_id,
            message: message::Builder::new_default(),
        }
    }
}

impl vatkit::private::capability::RequestHook for Request {
    fn get(&mut self) -> any_pointer::Builder<'_> {
        self.message.get_root().unwrap()
    }

    fn get_brand(&self) -> usize {
        0
    }

    fn send(self: Box<Self>) -> capability::RemotePromise<any_pointer::Owned> {
        let Self {
            conn,
            target,
            interface_id,
            method_id,
            message,
        } = *self;
        let param_ptr = message
            .get_root_as_reader()
            .map(|r| r.into_ptr())
            .unwrap_or(any_pointer::Ptr::Null);
        let payload = conn.encode_payload(&param_ptr);
        let (question_id, rx) = conn.begin_question();

        let send_conn = conn.clone();
        tokio::task::spawn_local(async move {
            let result = send_conn
                .send_message(Message::Call {
                    question_id,
                    target,
                    interface_id,
                    method_id,
                    params: payload,
                })
                .await;
            if result.is_err() {
                send_conn.end_question(question_id);
            }
        });

        let promise = Promise::from_future(async move {
            let ptr = match rx.await {
                Ok(r) => r?,
                Err(e) => return Err(crate::canceled_to_error(e)),
            };
            Ok(capability::Response::new(Box::new(ResolvedResponse { ptr })))
        });
        let pipeline = any_pointer::Pipeline::new(Box::new(QuestionPipeline {
            conn,
            question_id,
        }));

        capability::RemotePromise { promise, pipeline }
    }

    fn tail_send(self: Box<Self>) -> Option<(u32, Promise<(), Error>, Box<dyn PipelineHook>)> {
        None
    }
}

/// One side of a two-party connection: the question/answer/export/import
/// tables plus the frame-reading loop, built over one `AsyncRead`/
/// `AsyncWrite` pair.
pub struct RpcSystem {
    conn: Rc<ConnState>,
}

impl RpcSystem {
    /// Asks the peer for its bootstrap interface. The returned client is a
    /// promise capability that resolves the moment the peer's `Return`
    /// comes back — callers can start making (queued, then replayed) calls
    /// on it immediately.
    pub fn bootstrap(&self) -> capability::Client {
        let conn = self.conn.clone();
        let (question_id, rx) = conn.begin_question();
        let send_conn = conn.clone();
        tokio::task::spawn_local(async move {
            let _ = send_conn.send_message(Message::Bootstrap { question_id }).await;
        });
        let promise = Promise::from_future(async move {
            let ptr = match rx.await {
                Ok(r) => r?,
                Err(e) => return Err(crate::canceled_to_error(e)),
            };
            ptr.client()
        });
        capability::Client::new(Box::new(crate::queued::Client::new(promise)))
    }
}

/// Wraps `reader`/`writer` as a two-party connection, returning the
/// connection handle and the future that drives it. The driver future must
/// be polled (typically via `tokio::task::spawn_local`) for any message to
/// actually move; it resolves once the connection closes in either
/// direction.
pub fn connect<R, W>(reader: R, writer: W, options: Options) -> (RpcSystem, Promise<(), Error>)
where
    R: AsyncRead + Unpin + 'static,
    W: AsyncWrite + Unpin + 'static,
{
    let (sender, write_fut) = vatkit_io::write_queue::write_queue(writer);
    let conn = Rc::new(ConnState {
        sender: RefCell::new(sender),
        options,
        questions: RefCell::new(Questions {
            ids: IdPool::new(),
            entries: HashMap::new(),
        }),
        answers: RefCell::new(HashMap::new()),
        exports: RefCell::new(Exports {
            ids: IdPool::new(),
            entries: HashMap::new(),
            by_ptr: HashMap::new(),
        }),
        imports: RefCell::new(HashMap::new()),
        export_capture: RefCell::new(None),
    });

    let read_conn = conn.clone();
    let read_loop = async move {
        let mut reader = reader;
        loop {
            let message: Option<Message> = vatkit_io::serialize::read_message(&mut reader).await?;
            match message {
                Some(m) => read_conn.dispatch_message(m),
                None => break,
            }
        }
        Ok::<(), Error>(())
    };

    let driver = Promise::from_future(async move {
        futures_util::future::try_join(read_loop, write_fut).await?;
        Ok(())
    });

    (RpcSystem { conn }, driver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vatkit::any_pointer::Ptr;

    #[derive(Clone)]
    struct EchoServer;

    impl capability::Server for EchoServer {
        async fn dispatch_call(
            self,
            _interface_id: u64,
            _method_id: u16,
            params: capability::Params<any_pointer::Owned>,
            mut results: capability::Results<any_pointer::Owned>,
            _context: capability::Context,
        ) -> vatkit::Result<()> {
            let root = params.get()?.into_ptr();
            results.get().set_ptr(root);
            Ok(())
        }
        fn get_ptr(&self) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn bootstrap_and_call_round_trip() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (client_io, server_io) = vatkit_test_support::pipe(4096);
                let (client_read, client_write) = tokio::io::split(client_io);
                let (server_read, server_write) = tokio::io::split(server_io);

                let server_bootstrap =
                    capability::Client::new(Box::new(crate::local::Client::new(EchoServer)));
                let server_options = Options {
                    bootstrap: Some(server_bootstrap),
                    ..Options::default()
                };
                let (_server_system, server_driver) = connect(server_read, server_write, server_options);
                tokio::task::spawn_local(async move {
                    let _ = server_driver.await;
                });

                let (client_system, client_driver) = connect(client_read, client_write, Options::default());
                tokio::task::spawn_local(async move {
                    let _ = client_driver.await;
                });

                let bootstrap = client_system.bootstrap();
                let mut request =
                    bootstrap.new_call::<any_pointer::Owned, any_pointer::Owned>(0, 0, None);
                request.get().set_pointer_field(0, Ptr::List(vec![]));
                let remote = request.send();
                let response = remote.promise.await.unwrap();
                let root = response.get().unwrap().into_ptr();
                assert!(matches!(root, Ptr::Struct(fields) if matches!(fields[0], Ptr::List(_))));
            })
            .await;
    }

    #[derive(Clone)]
    struct Minter;

    impl capability::Server for Minter {
        async fn dispatch_call(
            self,
            _interface_id: u64,
            _method_id: u16,
            _params: capability::Params<any_pointer::Owned>,
            mut results: capability::Results<any_pointer::Owned>,
            _context: capability::Context,
        ) -> vatkit::Result<()> {
            let session = capability::Client::new(Box::new(crate::local::Client::new(EchoServer)));
            results.get().set_pointer_field(0, Ptr::Capability(session.hook));
            Ok(())
        }
        fn get_ptr(&self) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn pipelined_call_does_not_wait_for_first_return() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (client_io, server_io) = vatkit_test_support::pipe(4096);
                let (client_read, client_write) = tokio::io::split(client_io);
                let (server_read, server_write) = tokio::io::split(server_io);

                let server_bootstrap =
                    capability::Client::new(Box::new(crate::local::Client::new(Minter)));
                let server_options = Options {
                    bootstrap: Some(server_bootstrap),
                    ..Options::default()
                };
                let (_server_system, server_driver) = connect(server_read, server_write, server_options);
                tokio::task::spawn_local(async move {
                    let _ = server_driver.await;
                });

                let (client_system, client_driver) = connect(client_read, client_write, Options::default());
                tokio::task::spawn_local(async move {
                    let _ = client_driver.await;
                });

                let bootstrap = client_system.bootstrap();
                let mut mint = bootstrap.new_call::<any_pointer::Owned, any_pointer::Owned>(0, 0, None);
                mint.get().set_pointer_field(0, Ptr::List(vec![]));
                let minted = mint.send();

                // Pipeline a call onto the minted capability before `minted`'s
                // own `Return` has been awaited.
                let session_hook = minted.pipeline.get_pipelined_cap(&[PipelineOp::field(0)]);
                let session = capability::Client::new(session_hook);
                let mut echo = session.new_call::<any_pointer::Owned, any_pointer::Owned>(0, 0, None);
                echo.get().set_pointer_field(0, Ptr::List(vec![]));
                let echoed = echo.send();

                let (mint_response, echo_response) =
                    futures_util::future::try_join(minted.promise, echoed.promise)
                        .await
                        .unwrap();
                assert!(matches!(
                    mint_response.get().unwrap().into_ptr(),
                    Ptr::Struct(fields) if matches!(fields[0], Ptr::Capability(_))
                ));
                assert!(matches!(
                    echo_response.get().unwrap().into_ptr(),
                    Ptr::Struct(fields) if matches!(fields[0], Ptr::List(_))
                ));
            })
            .await;
    }

    /// Stalls its one method until `gate` fires, so a test can land a
    /// `Finish` before the matching `Return` goes out.
    #[derive(Clone)]
    struct StallingServer {
        gate: Rc<RefCell<Option<oneshot::Receiver<()>>>>,
    }

    impl capability::Server for StallingServer {
        async fn dispatch_call(
            self,
            _interface_id: u64,
            _method_id: u16,
            _params: capability::Params<any_pointer::Owned>,
            mut results: capability::Results<any_pointer::Owned>,
            _context: capability::Context,
        ) -> vatkit::Result<()> {
            if let Some(gate) = self.gate.borrow_mut().take() {
                let _ = gate.await;
            }
            results.get().set_ptr(Ptr::List(vec![]));
            Ok(())
        }
        fn get_ptr(&self) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn finish_before_return_rejects_pipeline_but_still_sends_return() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (test_io, conn_io) = vatkit_test_support::pipe(4096);
                let (conn_read, conn_write) = tokio::io::split(conn_io);
                let (mut test_read, mut test_write) = tokio::io::split(test_io);

                let (release_tx, release_rx) = oneshot::channel();
                let bootstrap = capability::Client::new(Box::new(crate::local::Client::new(StallingServer {
                    gate: Rc::new(RefCell::new(Some(release_rx))),
                })));
                let options = Options {
                    bootstrap: Some(bootstrap),
                    ..Options::default()
                };
                let (_system, driver) = connect(conn_read, conn_write, options);
                tokio::task::spawn_local(async move {
                    let _ = driver.await;
                });

                // Drive the connection at the wire-message level, playing the
                // role of the peer, so a `Finish` can be landed deliberately
                // ahead of the `Return` it's racing.
                vatkit_io::serialize::write_message(&mut test_write, &Message::Bootstrap { question_id: 0 })
                    .await
                    .unwrap();
                let boot_return: Message = vatkit_io::serialize::read_message(&mut test_read).await.unwrap().unwrap();
                let bootstrap_export_id = match boot_return {
                    Message::Return {
                        result: ReturnResult::Results(payload),
                        ..
                    } => match payload.cap_table.first() {
                        Some(CapDescriptor::SenderHosted(id)) => *id,
                        other => panic!("unexpected cap descriptor: {other:?}"),
                    },
                    other => panic!("unexpected message: {other:?}"),
                };

                vatkit_io::serialize::write_message(
                    &mut test_write,
                    &Message::Call {
                        question_id: 1,
                        target: MessageTarget::ImportedCap(bootstrap_export_id),
                        interface_id: 0,
                        method_id: 0,
                        params: WirePayload {
                            content: WireValue::Null,
                            cap_table: vec![],
                        },
                    },
                )
                .await
                .unwrap();

                // Let the call reach `StallingServer` and block there before
                // the `Finish` races ahead of its `Return`.
                tokio::task::yield_now().await;
                vatkit_io::serialize::write_message(
                    &mut test_write,
                    &Message::Finish {
                        question_id: 1,
                        release_result_caps: true,
                    },
                )
                .await
                .unwrap();
                tokio::task::yield_now().await;

                let _ = release_tx.send(());

                let returned: Message = vatkit_io::serialize::read_message(&mut test_read).await.unwrap().unwrap();
                assert!(matches!(
                    returned,
                    Message::Return {
                        answer_id: 1,
                        result: ReturnResult::Results(_)
                    }
                ));
            })
            .await;
    }
}
