// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see any_pointer.rs for the full text.

//! Stand-in for the full crate's segment-arena message builder. The real
//! `message::Builder<A>` owns a growable set of word segments that
//! `private::layout` addresses by (segment, offset); that arena and its
//! `Allocator` trait exist to make the wire encoding zero-copy, which this
//! workspace never produces. A message here is just a single root
//! `any_pointer::Ptr` cell; `Builder` keeps a generic-over-allocator shape
//! so call sites that read `message::Builder<message::HeapAllocator>` keep
//! meaning the same thing, even though `A` is now a phantom parameter.

use std::marker::PhantomData;

use crate::any_pointer;
use crate::Result;

/// Marker allocator, standing in for the real crate's heap-backed segment
/// allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapAllocator;

/// A message under construction: one root pointer, materialized lazily by
/// `any_pointer::Builder::ensure_struct`.
pub struct Builder<A = HeapAllocator> {
    root: any_pointer::Ptr,
    _allocator: PhantomData<A>,
}

impl<A> Default for Builder<A> {
    fn default() -> Self {
        Self::new_default()
    }
}

impl<A> Builder<A> {
    pub fn new_default() -> Self {
        Self {
            root: any_pointer::Ptr::Null,
            _allocator: PhantomData,
        }
    }

    pub fn get_root(&mut self) -> Result<any_pointer::Builder<'_>> {
        Ok(any_pointer::Builder::new(&mut self.root))
    }

    pub fn get_root_as_reader(&self) -> Result<any_pointer::Reader> {
        Ok(any_pointer::Reader::new(self.root.clone()))
    }
}
