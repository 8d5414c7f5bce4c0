/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
#[cfg(feature = "nusb")]
pub mod usb_backend;

#[cfg(feature = "libusb")]
pub mod libusb_backend;

#[cfg(feature = "nusb")]
pub use usb_backend::UsbPort;

#[cfg(all(not(feature = "nusb"), feature = "libusb"))]
pub use libusb_backend::UsbPort;
