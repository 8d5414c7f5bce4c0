/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! The request/response exchange engine: everything that talks to the
//! recorder over its four vendor-specific USB control requests plus the
//! bulk OUT pipe used for audio payloads.

mod backend;
pub mod port;

use std::time::Duration;

use log::{debug, warn};
use tokio::time::sleep;

use crate::error::{Error, Result};
use crate::query::{self, Param};
use port::{NetMdPort, VendorRequest};

pub use port::{list_devices, open_port, PortInfo};

const NETMD_POLL_INTERVAL_MS: u64 = 100;
const NETMD_RECV_TRIES: u32 = 30;
const NETMD_SYNC_TRIES: u32 = 5;
const NETMD_REPLY_SZ_INTERVAL_US: u64 = 5_000;
const NETMD_MAX_REPLY_SZ_INTERVAL_US: u64 = 1_000_000;

const STATUS_NOT_IMPLEMENTED: u8 = 0x08;
const STATUS_ACCEPTED: u8 = 0x09;
const STATUS_REJECTED: u8 = 0x0a;
const STATUS_INTERIM: u8 = 0x0f;

/// Logical resources that require an explicit open/close around them
/// before most commands will act on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    DiscTitleTd,
    AudioUtoc1Td,
    AudioUtoc4Td,
    DsiTd,
    AudioContentsTd,
    RootTd,
    DiscSubunitIdentifier,
    OperatingStatusBlock,
}

impl Descriptor {
    fn bytes(self) -> &'static [u8] {
        match self {
            Descriptor::DiscTitleTd => &[0x10, 0x18, 0x01],
            Descriptor::AudioUtoc1Td => &[0x10, 0x18, 0x02],
            Descriptor::AudioUtoc4Td => &[0x10, 0x18, 0x03],
            Descriptor::DsiTd => &[0x10, 0x18, 0x04],
            Descriptor::AudioContentsTd => &[0x10, 0x10, 0x01],
            Descriptor::RootTd => &[0x10, 0x10, 0x00],
            Descriptor::DiscSubunitIdentifier => &[0x00],
            Descriptor::OperatingStatusBlock => &[0x80, 0x00],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DscrtAction {
    Close = 0x00,
    OpenRead = 0x01,
    OpenWrite = 0x03,
}

/// Expected terminal status for an [`Connection::exchange`] call. Most
/// commands expect `Accepted`; a few protocol steps legitimately expect
/// `Interim` or `NotImplemented` and should not be treated as failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedStatus {
    Accepted,
    Interim,
    NotImplemented,
}

/// The open transport to one recorder. All USB traffic funnels through
/// `&mut self` methods here, which is what gives this crate its
/// single-writer exclusion without needing a runtime re-entrant lock.
#[derive(Debug)]
pub struct Connection {
    port: Box<dyn NetMdPort>,
}

impl Connection {
    pub fn new(port: Box<dyn NetMdPort>) -> Self {
        Connection { port }
    }

    pub async fn open(&mut self) -> Result<()> {
        self.port.open().await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.port.close().await
    }

    pub fn vendor_id(&self) -> u16 {
        self.port.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.port.product_id()
    }

    pub async fn product_string(&mut self) -> Result<Option<String>> {
        self.port.product_string().await
    }

    /// Polls once for a pending response and discards it, mirroring the
    /// device's habit of leaving a stale reply queued after a cancelled
    /// exchange.
    async fn cleanup_resp_queue(&mut self) -> Result<()> {
        if let Some((req, len)) = self.poll_once().await? {
            let _ = self.port.control_in(req, 0, len as usize).await;
        }
        Ok(())
    }

    /// Returns `Some((request, length))` if the device has a pending
    /// response queued, `None` if it has nothing to say yet.
    async fn poll_once(&mut self) -> Result<Option<(VendorRequest, u16)>> {
        let buf = self.port.control_in(VendorRequest::Poll, 0, 4).await?;
        if buf.len() < 4 || buf[0] == 0 {
            return Ok(None);
        }
        let req = if buf[1] == 0xff { VendorRequest::Factory } else { VendorRequest::ReadResponse };
        let len = u16::from_le_bytes([buf[2], buf[3]]);
        Ok(Some((req, len)))
    }

    async fn send_cmd(&mut self, cmd: &[u8], factory: bool) -> Result<()> {
        self.cleanup_resp_queue().await?;
        let req = if factory { VendorRequest::Factory } else { VendorRequest::SendCommand };
        self.port.control_out(req, 0, cmd).await
    }

    async fn get_response(&mut self) -> Result<Vec<u8>> {
        let mut interval_us = NETMD_REPLY_SZ_INTERVAL_US;
        for attempt in 0..NETMD_RECV_TRIES {
            if let Some((req, len)) = self.poll_once().await? {
                return self.port.control_in(req, 0, len as usize).await;
            }
            if attempt % 10 == 9 {
                interval_us = (interval_us * 2).min(NETMD_MAX_REPLY_SZ_INTERVAL_US);
            }
            sleep(Duration::from_micros(interval_us)).await;
        }
        Err(Error::timeout())
    }

    /// Sends `cmd` and waits for the device's reply, validating the
    /// status byte against `expected` (defaulting to `Accepted`).
    pub async fn exchange_expect(&mut self, cmd: &[u8], factory: bool, expected: ExpectedStatus) -> Result<Vec<u8>> {
        self.send_cmd(cmd, factory).await?;
        let mut resp = self.get_response().await?;

        if resp.is_empty() {
            return Err(Error::cmd_failed("empty response"));
        }

        match (resp[0], expected) {
            (STATUS_INTERIM, ExpectedStatus::Interim) => {}
            (STATUS_NOT_IMPLEMENTED, ExpectedStatus::NotImplemented) => {}
            (STATUS_INTERIM, _) => {
                debug!("got INTERIM, re-reading final response");
                resp = self.get_response().await?;
                if resp.is_empty() || resp[0] != STATUS_ACCEPTED {
                    return Err(Error::cmd_failed("no final response after INTERIM"));
                }
            }
            (STATUS_ACCEPTED, ExpectedStatus::Accepted) => {}
            (STATUS_REJECTED, _) => return Err(Error::cmd_failed("device rejected command")),
            (other, _) => return Err(Error::cmd_invalid(format!("unexpected status byte 0x{other:02x}"))),
        }

        Ok(resp)
    }

    pub async fn exchange(&mut self, cmd: &[u8], factory: bool) -> Result<Vec<u8>> {
        self.exchange_expect(cmd, factory, ExpectedStatus::Accepted).await
    }

    /// Waits for a response the device owes us without sending a new
    /// command first — used after a bulk transfer that was kicked off by
    /// an earlier `exchange_expect` call.
    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        self.get_response().await
    }

    pub async fn bulk_transfer(&mut self, data: &[u8]) -> Result<()> {
        self.port.bulk_out(data).await
    }

    /// Polls up to five times, 100 ms apart, for the device to report an
    /// all-zero sync message (mitigates a known USB hiccup on certain
    /// units around commit time).
    pub async fn wait_for_sync(&mut self) -> Result<bool> {
        for _ in 0..NETMD_SYNC_TRIES {
            let buf = self.port.control_in(VendorRequest::Poll, 0, 4).await?;
            if buf == [0, 0, 0, 0] {
                return Ok(true);
            }
            sleep(Duration::from_millis(NETMD_POLL_INTERVAL_MS)).await;
        }
        warn!("no sync response from device");
        Ok(false)
    }

    pub async fn change_descriptor(&mut self, d: Descriptor, action: DscrtAction) -> Result<()> {
        let cmd = query::format("00 1808 %* %b 00", &[Param::Bytes(d.bytes().to_vec()), Param::Byte(action as u8)])?;
        self.exchange(&cmd, false).await?;
        Ok(())
    }

    /// `aquire`: claims exclusive control (needed on Sharp-derived units
    /// before most commands will answer).
    pub async fn acquire(&mut self) -> Result<()> {
        let req = [0x00, 0xff, 0x01, 0x0c, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        self.exchange(&req, false).await?;
        Ok(())
    }

    pub async fn release(&mut self) -> Result<()> {
        let req = [0x00, 0xff, 0x01, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        self.exchange(&req, false).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_bytes_match_known_table() {
        assert_eq!(Descriptor::DiscSubunitIdentifier.bytes(), &[0x00]);
        assert_eq!(Descriptor::AudioUtoc1Td.bytes(), &[0x10, 0x18, 0x02]);
    }
}
