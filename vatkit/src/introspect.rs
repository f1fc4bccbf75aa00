// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see any_pointer.rs for the full text.

//! Runtime type descriptors. The full crate generates one `Introspect` impl
//! per schema-compiled type, carrying the encoded schema node so that
//! generic RPC tooling (schema dumpers, dynamic clients) can inspect a
//! capability without the concrete Rust type. Schema codegen is out of
//! scope here, so the only `Introspect` impl this workspace needs is the
//! one `capability::Client` itself carries for the untyped path.

/// A runtime type descriptor.
pub struct Type {
    pub which: TypeVariant,
}

impl From<TypeVariant> for Type {
    fn from(which: TypeVariant) -> Self {
        Type { which }
    }
}

pub enum TypeVariant {
    Capability(RawCapabilitySchema),
}

/// Everything a dynamic client would need to know about an interface type.
/// `encoded_node` would carry the compiled `schema.capnp` `Node` for a
/// generated interface; untyped capabilities carry an empty slice.
pub struct RawCapabilitySchema {
    pub encoded_node: &'static [u8],
    pub params_types: fn() -> Type,
    pub result_types: fn() -> Type,
}

pub trait Introspect {
    fn introspect() -> Type;
}
