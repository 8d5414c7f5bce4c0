/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! A NetMD MiniDisc recorder driver: USB transport, disc-header and
//! table-of-contents editing, firmware patching, and the secure-download
//! pipeline a track upload needs end to end.

pub mod connection;
pub mod device;
pub mod error;
pub mod header;
pub mod patch;
pub mod query;
pub mod registry;
pub mod secure;
pub mod toc;
pub mod util;
pub mod wav;

pub use device::{Device, DeviceBuilder, UploadFormat};
pub use error::{Error, Result};
