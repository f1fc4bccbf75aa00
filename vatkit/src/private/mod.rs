// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see any_pointer.rs for the full text.

pub mod capability;
