/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use nusb::descriptors::TransferType;
use nusb::io::EndpointWrite;
use nusb::transfer::{Bulk, ControlIn, ControlOut, ControlType, Direction, Out, Recipient};
use nusb::{Device, DeviceInfo, Interface};
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;

use crate::connection::port::{NetMdPort, PortInfo, VendorRequest};
use crate::error::{Error, Result};
use crate::registry;

const CTRL_TIMEOUT: Duration = Duration::from_secs(1);
const BULK_OUT_SZ: usize = 0x80000;
const RESET_RETRIES: u32 = 5;
const RESET_BACKOFF: Duration = Duration::from_millis(100);

/// Resets the device's endpoints before the interface is claimed,
/// retrying a transient `NotFound` up to `RESET_RETRIES` times.
async fn reset_endpoint(device: &Device) -> Result<()> {
    for attempt in 0.. {
        match device.reset().await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && attempt + 1 < RESET_RETRIES => {
                sleep(RESET_BACKOFF).await;
            }
            Err(e) => return Err(Error::usb(format!("endpoint reset failed: {e}"))),
        }
    }
    unreachable!()
}

pub struct UsbPort {
    info: DeviceInfo,
    interface: Option<Interface>,
    writer: Option<EndpointWrite<Bulk>>,
    ep_out: u8,
    is_open: bool,
}

impl fmt::Debug for UsbPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UsbPort {{ vid: {:04x}, pid: {:04x}, open: {} }}", self.info.vendor_id(), self.info.product_id(), self.is_open)
    }
}

impl UsbPort {
    pub fn new(info: DeviceInfo) -> Self {
        UsbPort { info, interface: None, writer: None, ep_out: 0, is_open: false }
    }

    fn select_bulk_out(&mut self, iface: &Interface) -> Result<()> {
        for alt in iface.descriptors() {
            for ep in alt.endpoints() {
                if matches!(ep.transfer_type(), TransferType::Bulk) && ep.direction() == Direction::Out {
                    self.ep_out = ep.address();
                    return Ok(());
                }
            }
        }
        Err(Error::usb("no bulk OUT endpoint found"))
    }
}

#[async_trait]
impl NetMdPort for UsbPort {
    fn vendor_id(&self) -> u16 {
        self.info.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.info.product_id()
    }

    async fn open(&mut self) -> Result<()> {
        if self.is_open {
            return Ok(());
        }
        let device = self.info.open().await?;
        reset_endpoint(&device).await?;
        let iface = device.detach_and_claim_interface(0).await?;
        self.select_bulk_out(&iface)?;

        let ep_out = iface.endpoint::<Bulk, Out>(self.ep_out)?;
        self.writer = Some(ep_out.writer(BULK_OUT_SZ).with_write_timeout(Duration::from_secs(80)));
        self.interface = Some(iface);
        self.is_open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.writer = None;
        self.interface = None;
        self.is_open = false;
        Ok(())
    }

    async fn product_string(&mut self) -> Result<Option<String>> {
        Ok(self.info.product_string().map(|s| s.to_string()))
    }

    async fn control_out(&mut self, req: VendorRequest, value: u16, data: &[u8]) -> Result<()> {
        let iface = self.interface.as_ref().ok_or_else(|| Error::NotReady)?;
        iface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Interface,
                    request: req.code(),
                    value,
                    index: 0,
                    data,
                },
                CTRL_TIMEOUT,
            )
            .await
            .map_err(|e| Error::usb(format!("control OUT failed: {e}")))?;
        Ok(())
    }

    async fn control_in(&mut self, req: VendorRequest, value: u16, len: usize) -> Result<Vec<u8>> {
        let iface = self.interface.as_ref().ok_or_else(|| Error::NotReady)?;
        let buf = iface
            .control_in(
                ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Interface,
                    request: req.code(),
                    value,
                    index: 0,
                    length: len as u16,
                },
                CTRL_TIMEOUT,
            )
            .await
            .map_err(|e| Error::usb(format!("control IN failed: {e}")))?;
        Ok(buf)
    }

    async fn bulk_out(&mut self, data: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| Error::NotReady)?;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }
}

pub async fn list() -> Result<Vec<PortInfo>> {
    let mut out = Vec::new();
    for dev in nusb::list_devices().await? {
        if registry::lookup(dev.vendor_id(), dev.product_id()).is_some() {
            out.push(PortInfo {
                vendor_id: dev.vendor_id(),
                product_id: dev.product_id(),
                bus_number: dev.bus_number(),
                device_address: dev.device_address(),
            });
        }
    }
    Ok(out)
}

pub async fn open(vendor_id: u16, product_id: u16) -> Result<UsbPort> {
    for dev in nusb::list_devices().await? {
        if dev.vendor_id() == vendor_id && dev.product_id() == product_id {
            return Ok(UsbPort::new(dev));
        }
    }
    Err(Error::usb("device not found"))
}
