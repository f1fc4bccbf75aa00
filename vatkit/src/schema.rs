// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see any_pointer.rs for the full text.

//! Stand-in for the full crate's compiled-schema bindings. The real
//! `schema.rs` wraps the `schema.capnp` node types that `capnpc` embeds
//! into every generated module; with codegen out of scope, the only thing
//! this workspace's `Introspect` impls need is a placeholder params/result
//! descriptor for capabilities with no generated struct type.

use crate::introspect::{Type, TypeVariant};

/// The `params_types`/`result_types` descriptor used by capabilities whose
/// methods are dispatched on `any_pointer::Owned`, i.e. every capability in
/// this workspace.
pub fn dynamic_struct_marker() -> Type {
    TypeVariant::Capability(crate::introspect::RawCapabilitySchema {
        encoded_node: &[],
        params_types: dynamic_struct_marker,
        result_types: dynamic_struct_marker,
    })
    .into()
}
