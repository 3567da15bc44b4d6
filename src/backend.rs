// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared code for encode backends.
//!
//! A backend is the provider of the actual picture encoding, most likely a hardware encoder
//! driven through its register interface. Backends implement
//! [`crate::encoder::stateless::EncodeBackend`]; this module holds the ones that are not tied to
//! any hardware.

pub mod dummy;
