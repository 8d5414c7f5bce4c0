/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusb::{Context, Device, DeviceHandle, Direction, Recipient, RequestType, UsbContext};
use tokio::sync::Mutex;
use tokio::task::spawn_blocking;

use crate::connection::port::{NetMdPort, PortInfo, VendorRequest};
use crate::error::{Error, Result};
use crate::registry;

const CTRL_TIMEOUT: Duration = Duration::from_secs(1);
const BULK_TIMEOUT: Duration = Duration::from_secs(80);
const RESET_RETRIES: u32 = 5;
const RESET_BACKOFF: Duration = Duration::from_millis(100);

/// Resets the device's endpoints before the interface is claimed,
/// retrying a transient `NotFound` up to `RESET_RETRIES` times. Runs on
/// a blocking thread, so sleeps are plain `std::thread::sleep`.
fn reset_endpoint(h: &DeviceHandle<Context>) -> Result<()> {
    for attempt in 0.. {
        match h.reset() {
            Ok(()) => return Ok(()),
            Err(rusb::Error::NotFound) if attempt + 1 < RESET_RETRIES => {
                std::thread::sleep(RESET_BACKOFF);
            }
            Err(e) => return Err(Error::usb(e.to_string())),
        }
    }
    unreachable!()
}

#[derive(Debug, Clone)]
pub struct UsbPort {
    handle: Arc<Mutex<DeviceHandle<Context>>>,
    vendor_id: u16,
    product_id: u16,
    out_endpoint: u8,
    is_open: bool,
    product_string: Option<String>,
}

impl UsbPort {
    fn find_bulk_out(device: &Device<Context>) -> Option<u8> {
        let config = device.active_config_descriptor().ok()?;
        for interface in config.interfaces() {
            for desc in interface.descriptors() {
                for ep in desc.endpoint_descriptors() {
                    if ep.transfer_type() == rusb::TransferType::Bulk && ep.direction() == Direction::Out {
                        return Some(ep.address());
                    }
                }
            }
        }
        None
    }
}

#[async_trait]
impl NetMdPort for UsbPort {
    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }

    async fn open(&mut self) -> Result<()> {
        if self.is_open {
            return Ok(());
        }
        let handle = self.handle.clone();
        spawn_blocking(move || -> Result<()> {
            let h = handle.blocking_lock();
            reset_endpoint(&h)?;
            h.claim_interface(0).map_err(|e| Error::usb(e.to_string()))
        })
        .await
        .map_err(|e| Error::other(e.to_string()))??;
        self.is_open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let handle = self.handle.clone();
        spawn_blocking(move || {
            let h = handle.blocking_lock();
            let _ = h.release_interface(0);
        })
        .await
        .map_err(|e| Error::other(e.to_string()))?;
        self.is_open = false;
        Ok(())
    }

    async fn product_string(&mut self) -> Result<Option<String>> {
        Ok(self.product_string.clone())
    }

    async fn control_out(&mut self, req: VendorRequest, value: u16, data: &[u8]) -> Result<()> {
        let handle = self.handle.clone();
        let data = data.to_vec();
        let code = req.code();
        spawn_blocking(move || -> Result<()> {
            let h = handle.blocking_lock();
            let rt = rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Interface);
            h.write_control(rt, code, value, 0, &data, CTRL_TIMEOUT).map_err(|e| Error::usb(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::other(e.to_string()))?
    }

    async fn control_in(&mut self, req: VendorRequest, value: u16, len: usize) -> Result<Vec<u8>> {
        let handle = self.handle.clone();
        let code = req.code();
        spawn_blocking(move || -> Result<Vec<u8>> {
            let h = handle.blocking_lock();
            let rt = rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Interface);
            let mut buf = vec![0u8; len];
            let n = h.read_control(rt, code, value, 0, &mut buf, CTRL_TIMEOUT).map_err(|e| Error::usb(e.to_string()))?;
            buf.truncate(n);
            Ok(buf)
        })
        .await
        .map_err(|e| Error::other(e.to_string()))?
    }

    async fn bulk_out(&mut self, data: &[u8]) -> Result<()> {
        let handle = self.handle.clone();
        let data = data.to_vec();
        let ep = self.out_endpoint;
        spawn_blocking(move || -> Result<()> {
            let h = handle.blocking_lock();
            h.write_bulk(ep, &data, BULK_TIMEOUT).map_err(|e| Error::usb(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::other(e.to_string()))?
    }
}

pub async fn list() -> Result<Vec<PortInfo>> {
    spawn_blocking(|| -> Result<Vec<PortInfo>> {
        let ctx = Context::new().map_err(|e| Error::usb(e.to_string()))?;
        let mut out = Vec::new();
        for device in ctx.devices().map_err(|e| Error::usb(e.to_string()))?.iter() {
            let desc = device.device_descriptor().map_err(|e| Error::usb(e.to_string()))?;
            if registry::lookup(desc.vendor_id(), desc.product_id()).is_some() {
                out.push(PortInfo {
                    vendor_id: desc.vendor_id(),
                    product_id: desc.product_id(),
                    bus_number: device.bus_number(),
                    device_address: device.address(),
                });
            }
        }
        Ok(out)
    })
    .await
    .map_err(|e| Error::other(e.to_string()))?
}

pub async fn open(vendor_id: u16, product_id: u16) -> Result<UsbPort> {
    spawn_blocking(move || -> Result<UsbPort> {
        let ctx = Context::new().map_err(|e| Error::usb(e.to_string()))?;
        for device in ctx.devices().map_err(|e| Error::usb(e.to_string()))?.iter() {
            let desc = device.device_descriptor().map_err(|e| Error::usb(e.to_string()))?;
            if desc.vendor_id() == vendor_id && desc.product_id() == product_id {
                let out_ep = UsbPort::find_bulk_out(&device).ok_or_else(|| Error::usb("no bulk OUT endpoint found"))?;
                let handle = device.open().map_err(|e| Error::usb(e.to_string()))?;
                let product_string = handle.read_product_string_ascii(&desc).ok();
                return Ok(UsbPort {
                    handle: Arc::new(Mutex::new(handle)),
                    vendor_id,
                    product_id,
                    out_endpoint: out_ep,
                    is_open: false,
                    product_string,
                });
            }
        }
        Err(Error::usb("device not found"))
    })
    .await
    .map_err(|e| Error::other(e.to_string()))?
}
