/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Backend-agnostic USB transport surface a NetMD connection is built on.

use async_trait::async_trait;

use crate::error::Result;

/// A single discovered device, before it has been opened.
#[derive(Debug, Clone)]
pub struct PortInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub device_address: u8,
}

/// Vendor-specific control transfer requests the NetMD protocol uses.
/// Interface 0 is always the target; these map onto the four request
/// codes the recorders answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendorRequest {
    /// 0x01 - poll for a pending response / wait-for-sync.
    Poll,
    /// 0x80 - send a standard (AV/C) command.
    SendCommand,
    /// 0x81 - read a standard command's response.
    ReadResponse,
    /// 0xFF - send/read a factory-mode command.
    Factory,
}

impl VendorRequest {
    pub fn code(self) -> u8 {
        match self {
            VendorRequest::Poll => 0x01,
            VendorRequest::SendCommand => 0x80,
            VendorRequest::ReadResponse => 0x81,
            VendorRequest::Factory => 0xff,
        }
    }
}

/// Backend-agnostic handle to an open NetMD USB device.
#[async_trait]
pub trait NetMdPort: std::fmt::Debug + Send {
    fn vendor_id(&self) -> u16;
    fn product_id(&self) -> u16;

    async fn control_out(&mut self, req: VendorRequest, value: u16, data: &[u8]) -> Result<()>;
    async fn control_in(&mut self, req: VendorRequest, value: u16, len: usize) -> Result<Vec<u8>>;
    async fn bulk_out(&mut self, data: &[u8]) -> Result<()>;

    /// Claims interface 0 and, where the platform requires it, performs
    /// the initial handshake/reset.
    async fn open(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;

    /// The device's product-string descriptor, read once at open time.
    async fn product_string(&mut self) -> Result<Option<String>>;
}

/// Enumerates currently attached devices this crate recognises.
#[cfg(feature = "nusb")]
pub async fn list_devices() -> Result<Vec<PortInfo>> {
    crate::connection::backend::usb_backend::list().await
}

#[cfg(all(not(feature = "nusb"), feature = "libusb"))]
pub async fn list_devices() -> Result<Vec<PortInfo>> {
    crate::connection::backend::libusb_backend::list().await
}

/// Opens the first attached device matching `(vendor_id, product_id)`.
#[cfg(feature = "nusb")]
pub async fn open_port(vendor_id: u16, product_id: u16) -> Result<Box<dyn NetMdPort>> {
    Ok(Box::new(crate::connection::backend::usb_backend::open(vendor_id, product_id).await?))
}

#[cfg(all(not(feature = "nusb"), feature = "libusb"))]
pub async fn open_port(vendor_id: u16, product_id: u16) -> Result<Box<dyn NetMdPort>> {
    Ok(Box::new(crate::connection::backend::libusb_backend::open(vendor_id, product_id).await?))
}
