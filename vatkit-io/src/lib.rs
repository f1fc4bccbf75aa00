// Copyright (c) 2016 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see write_queue.rs for the full text.

//! Async framing for `vatkit_rpc` connections: length-prefixed message
//! encoding (`serialize`) and an ordered outgoing-message queue
//! (`write_queue`).

pub mod serialize;
pub mod write_queue;
