// Copyright (c) 2024 Mike Tsao. All rights reserved.

#![warn(missing_docs)]

//! The `gr55-core` crate speaks System Exclusive MIDI to the Roland GR-55
//! guitar synthesizer.
//!
//! It is the backend of a patch editor: a declarative map of the device's
//! parameter memory, codecs for the encoded field formats that memory uses,
//! the RQ1/DT1 wire protocol, and a transfer service that turns "read this
//! subtree" into correctly paced request frames and matches the replies that
//! trickle back. The host supplies only a [Transport](transfer::Transport)
//! that moves raw bytes, so the crate stays independent of any particular
//! MIDI library or UI.

/// The Roland GR-55 device model and parameter map.
pub mod gr55;
/// Multi-queue priority task scheduling.
pub mod scheduler;
/// The declarative parameter map and its field codecs.
pub mod schema;
/// System Exclusive framing, checksums, and address arithmetic.
pub mod sysex;
/// The data-transfer service that owns device traffic.
pub mod transfer;
/// Common data types.
pub mod types;
/// Channel plumbing shared by the services.
pub mod util;

/// A collection of imports that are useful to users of this crate. `use
/// gr55_core::prelude::*;` for easier onboarding.
pub mod prelude {
    pub use super::{
        gr55::{GR55, PATCH_COMMON, PATCH_COMMON_BASE, SYSTEM, SYSTEM_BASE},
        schema::{Atom, Codec, FieldDefinition, SchemaError, StructDefinition, Value},
        transfer::{
            RequestOptions, TransferError, TransferService, TransferServiceEvent,
            TransferServiceInput, Transport,
        },
        types::{DeviceAddress, DeviceContext, DeviceIdentity, PortDescriptor},
        util::ProvidesService,
    };
}
