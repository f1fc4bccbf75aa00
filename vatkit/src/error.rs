// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
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

//! Error kinds for the RPC core. Structured causes get flattened into an
//! annotated message chain rather than nested in the enum, so `Error` stays
//! cheap to pass around call boundaries that don't care about the cause.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Generic remote/local failure.
    Failed,
    /// No such method.
    Unimplemented,
    /// The connection this capability depended on was torn down.
    Disconnected,
    /// The peer exceeded a resource limit (not produced by the core itself,
    /// reserved for transport/flow-control collaborators).
    Overloaded,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Failed => "failed",
            ErrorKind::Unimplemented => "unimplemented",
            ErrorKind::Disconnected => "disconnected",
            ErrorKind::Overloaded => "overloaded",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Error {
    pub kind: ErrorKind,
    pub description: String,
}

impl Error {
    pub fn failed(description: String) -> Self {
        Self {
            kind: ErrorKind::Failed,
            description,
        }
    }

    pub fn unimplemented(description: String) -> Self {
        Self {
            kind: ErrorKind::Unimplemented,
            description,
        }
    }

    pub fn disconnected(description: String) -> Self {
        Self {
            kind: ErrorKind::Disconnected,
            description,
        }
    }

    pub fn overloaded(description: String) -> Self {
        Self {
            kind: ErrorKind::Overloaded,
            description,
        }
    }

    /// Prefixes `description` onto an existing error, same shape as the Go
    /// original's `exc.Annotate`/`exc.WrapError`.
    pub fn annotate(self, context: &str) -> Self {
        Self {
            kind: self.kind,
            description: format!("{context}: {}", self.description),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.description)
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline-transform failure: `(op-index, field, cause, with-default)`,
/// rendered the way `examples/original_source/answer.go::newTransformError`
/// does, then returned as a `Failed` error.
pub fn transform_error(index: usize, field: u16, cause: Error, with_default: bool) -> Error {
    let mut msg = format!("transform: op {index}: pointer field {field}");
    if with_default {
        msg.push_str(" with default");
    }
    Error::failed(format!("{msg}: {cause}"))
}
