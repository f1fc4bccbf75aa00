// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
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

//! An untyped pointer and the pipeline transform that walks it.
//!
//! The real Cap'n Proto pointer is a tagged reference into a byte-addressed
//! segment arena; that layout engine is wire codec machinery declared
//! out of scope. `Ptr` instead represents the same tagged-value shape
//! (null / struct / list / interface) as an in-memory tree, which is
//! sufficient for everything the promise/pipelining core touches: struct
//! field reads, default substitution, and extracting a capability.

use crate::private::capability::ClientHook;
use crate::{Error, Result};

/// A tagged value: null, struct, list, or interface. Struct and list fields
/// are addressed positionally, matching how a real Cap'n Proto struct's
/// pointer section is just an array of pointers indexed by field number.
pub enum Ptr {
    Null,
    Struct(Vec<Ptr>),
    List(Vec<Ptr>),
    Capability(Box<dyn ClientHook>),
}

impl Clone for Ptr {
    fn clone(&self) -> Self {
        match self {
            Ptr::Null => Ptr::Null,
            Ptr::Struct(fields) => Ptr::Struct(fields.clone()),
            Ptr::List(items) => Ptr::List(items.clone()),
            Ptr::Capability(hook) => Ptr::Capability(hook.add_ref()),
        }
    }
}

impl Default for Ptr {
    fn default() -> Self {
        Ptr::Null
    }
}

impl Ptr {
    pub fn is_null(&self) -> bool {
        matches!(self, Ptr::Null)
    }

    pub fn is_capability(&self) -> bool {
        matches!(self, Ptr::Capability(_))
    }

    /// Reads pointer field `field` out of `self`, treating `self` as a
    /// struct. A `Null` struct behaves as an all-null struct (no error),
    /// matching Cap'n Proto's "absent struct reads as defaults" semantics.
    /// Reading a field out of a non-struct, non-null pointer is an error.
    fn read_field(&self, field: u16) -> Result<Ptr> {
        match self {
            Ptr::Null => Ok(Ptr::Null),
            Ptr::Struct(fields) => Ok(fields
                .get(field as usize)
                .cloned()
                .unwrap_or(Ptr::Null)),
            _ => Err(Error::failed(
                "pointer field read on a non-struct pointer".into(),
            )),
        }
    }

    /// Converts `self` into a struct pointer suitable for further field
    /// reads, substituting `default` if `self` is null.
    fn struct_default(self, default: Option<&Ptr>) -> Result<Ptr> {
        match self {
            Ptr::Null => Ok(default.cloned().unwrap_or(Ptr::Null)),
            s @ Ptr::Struct(_) => Ok(s),
            _ => Err(Error::failed(
                "expected struct pointer, found list or capability".into(),
            )),
        }
    }

    pub fn client(self) -> Result<Box<dyn ClientHook>> {
        match self {
            Ptr::Capability(hook) => Ok(hook),
            _ => Err(Error::failed("pointer is not a capability".into())),
        }
    }
}

/// A step in transforming a root pointer into a nested value: read pointer
/// field `field`, defaulting to `default` if the read comes up null. This
/// is `PipelineOp`, matching `rpc.capnp`'s `PromisedAnswer.Op`.
#[derive(Clone)]
pub struct PipelineOp {
    pub field: u16,
    pub default: Option<Ptr>,
}

impl PipelineOp {
    pub fn field(field: u16) -> Self {
        Self {
            field,
            default: None,
        }
    }
}

/// Encodes a transform as a key suitable for the promise's `clients` map.
/// Two transforms that differ only in defaults collapse to the same key —
/// capability pointers can't carry a default, so the default is immaterial
/// once we reach a capability.
pub fn client_path(ops: &[PipelineOp]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ops.len() * 2);
    for op in ops {
        buf.extend_from_slice(&op.field.to_le_bytes());
    }
    buf
}

/// Applies a transform to a root pointer. An empty transform
/// is the identity. Errors carry `(op-index, field, cause, with-default)`.
pub fn transform(root: &Ptr, ops: &[PipelineOp]) -> Result<Ptr> {
    let n = ops.len();
    if n == 0 {
        return Ok(root.clone());
    }
    let mut current = root.clone();
    for (i, op) in ops[..n - 1].iter().enumerate() {
        let field = current
            .read_field(op.field)
            .map_err(|e| crate::error::transform_error(i, op.field, e, false))?;
        current = field
            .struct_default(op.default.as_ref())
            .map_err(|e| crate::error::transform_error(i, op.field, e, true))?;
    }
    let last = &ops[n - 1];
    let field = current
        .read_field(last.field)
        .map_err(|e| crate::error::transform_error(n - 1, last.field, e, false))?;
    match (&field, &last.default) {
        (Ptr::Null, Some(default)) => Ok(default.clone()),
        _ => Ok(field),
    }
}

/// Marker type implementing `traits::Owned`/`Pipelined` for the untyped,
/// codegen-free RPC path this workspace always uses.
pub struct Owned;

impl crate::traits::Owned for Owned {
    type Reader<'a> = Reader;
    type Builder<'a> = Builder<'a>;
}

impl crate::traits::Pipelined for Owned {
    type Pipeline = Pipeline;
}

/// A read-only view of a pointer. Owned rather than borrowed: cloning a
/// `Ptr` is cheap (a `Vec` clone, or an `add_ref` for capabilities), so
/// there is no benefit to threading lifetimes through every accessor the
/// way the byte-arena implementation must.
#[derive(Clone)]
pub struct Reader {
    ptr: Ptr,
}

impl Reader {
    pub fn new(ptr: Ptr) -> Self {
        Self { ptr }
    }

    pub fn get_as<'a, T>(&'a self) -> Result<T::Reader<'a>>
    where
        T: crate::traits::Owned<Reader<'a> = Reader>,
    {
        Ok(self.clone())
    }

    /// Applies `ops` and extracts the capability found at the end, for a
    /// caller (`queued::Pipeline`, `rpc::Pipeline`) that will wrap a
    /// failure into its own broken-capability representation.
    pub fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Result<Box<dyn ClientHook>> {
        transform(&self.ptr, ops)?.client()
    }

    pub fn into_ptr(self) -> Ptr {
        self.ptr
    }
}

/// A writable view into a single pointer cell of a message. The cell is
/// materialized into a struct lazily: the first call that needs struct
/// fields on a still-`Null` cell allocates an empty field vector.
pub struct Builder<'a> {
    pub(crate) cell: &'a mut Ptr,
}

impl<'a> Builder<'a> {
    pub fn new(cell: &'a mut Ptr) -> Self {
        Self { cell }
    }

    pub fn get_as<T>(self) -> Result<T::Builder<'a>>
    where
        T: crate::traits::Owned<Builder<'a> = Builder<'a>>,
    {
        Ok(self)
    }

    fn ensure_struct(&mut self, min_fields: usize) -> &mut Vec<Ptr> {
        if !matches!(self.cell, Ptr::Struct(_)) {
            *self.cell = Ptr::Struct(Vec::new());
        }
        let Ptr::Struct(fields) = self.cell else {
            unreachable!()
        };
        if fields.len() < min_fields {
            fields.resize_with(min_fields, || Ptr::Null);
        }
        fields
    }

    pub fn set_pointer_field(&mut self, field: u16, value: Ptr) {
        let fields = self.ensure_struct(field as usize + 1);
        fields[field as usize] = value;
    }

    pub fn set_cap(&mut self, hook: Box<dyn ClientHook>) {
        *self.cell = Ptr::Capability(hook);
    }

    /// Overwrites this cell with an already-built `Ptr` wholesale, for
    /// callers (like a connection decoding a wire response) that construct
    /// the whole tree up front instead of field by field.
    pub fn set_ptr(&mut self, value: Ptr) {
        *self.cell = value;
    }

    pub fn field_builder(&mut self, field: u16) -> Builder<'_> {
        let fields = self.ensure_struct(field as usize + 1);
        Builder {
            cell: &mut fields[field as usize],
        }
    }

    pub fn as_reader(&self) -> Reader {
        Reader::new(self.cell.clone())
    }
}

/// Accesses a field yet to resolve: wraps the `PipelineHook` produced by a
/// `Request::send()` (local dispatch) or a question's answer (remote
/// dispatch), threading a transform through it.
pub struct Pipeline {
    hook: Box<dyn crate::private::capability::PipelineHook>,
}

impl Pipeline {
    pub fn new(hook: Box<dyn crate::private::capability::PipelineHook>) -> Self {
        Self { hook }
    }

    pub fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Box<dyn ClientHook> {
        self.hook.get_pipelined_cap(ops)
    }
}

impl crate::capability::FromTypelessPipeline for Pipeline {
    fn new(typeless: Pipeline) -> Self {
        typeless
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_transform_is_identity() {
        let root = Ptr::Struct(vec![Ptr::Null, Ptr::List(vec![])]);
        let out = transform(&root, &[]).unwrap();
        assert!(matches!(out, Ptr::Struct(fields) if fields.len() == 2));
    }

    #[test]
    fn nested_field_read() {
        let inner = Ptr::Struct(vec![Ptr::Null, Ptr::List(vec![Ptr::Null])]);
        let root = Ptr::Struct(vec![Ptr::Null, Ptr::Null, inner]);
        let ops = [PipelineOp::field(2), PipelineOp::field(1)];
        let out = transform(&root, &ops).unwrap();
        assert!(matches!(out, Ptr::List(items) if items.len() == 1));
    }

    #[test]
    fn absent_field_defaults() {
        let root = Ptr::Struct(vec![Ptr::Null]);
        let default = Ptr::Struct(vec![Ptr::List(vec![])]);
        let ops = [PipelineOp {
            field: 5,
            default: Some(default),
        }];
        let out = transform(&root, &ops).unwrap();
        assert!(matches!(out, Ptr::Struct(fields) if fields.len() == 1));
    }

    #[test]
    fn reading_through_non_struct_fails() {
        let root = Ptr::List(vec![Ptr::Null]);
        let ops = [PipelineOp::field(0), PipelineOp::field(0)];
        assert!(transform(&root, &ops).is_err());
    }

    #[test]
    fn client_path_ignores_defaults() {
        let a = [PipelineOp {
            field: 3,
            default: None,
        }];
        let b = [PipelineOp {
            field: 3,
            default: Some(Ptr::Null),
        }];
        assert_eq!(client_path(&a), client_path(&b));
    }
}
