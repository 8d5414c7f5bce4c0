/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Firmware-fingerprint detection and the runtime patch engine.
//!
//! Patchable Sony recorders ship firmware that refuses to accept
//! uncompressed (SP) uploads and direct UTOC edits. A handful of 4-byte
//! RAM overwrites, addressed by exact firmware build, lift that
//! restriction; this module finds the build, pokes the bytes through the
//! factory-mode memory channel, and can undo the damage afterwards.

use log::{debug, info, warn};

use crate::connection::{Connection, DscrtAction, Descriptor};
use crate::error::{Error, Result};
use crate::query::{self, Captured, Param};
use crate::util::crc16;

const MAX_PATCH: usize = 8;

/// Firmware build a patchable recorder can report. Anything this crate
/// cannot parse, or that isn't a Sony chip at all, comes back as
/// [`Fingerprint::Unknown`]; a Sony chip with no entry in the patch
/// tables comes back as [`Fingerprint::NoSupport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    R1000,
    R1100,
    R1200,
    R1300,
    R1400,
    S1000,
    S1100,
    S1200,
    S1300,
    S1400,
    S1500,
    S1600,
    NoSupport,
    Unknown,
}

impl Fingerprint {
    /// Devices from S1.200 up are the ones the patch/payload tables
    /// actually carry addresses for.
    fn bitmask(self) -> u32 {
        match self {
            Fingerprint::S1200 => 1 << 0,
            Fingerprint::S1300 => 1 << 1,
            Fingerprint::S1400 => 1 << 2,
            Fingerprint::S1500 => 1 << 3,
            Fingerprint::S1600 => 1 << 4,
            _ => 0,
        }
    }

    fn needs_safety_patch(self) -> bool {
        matches!(self, Fingerprint::S1400 | Fingerprint::S1500 | Fingerprint::S1600)
    }
}

/// Named patch locations, in SP-upload application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchId {
    DevType,
    Patch0A,
    Patch0B,
    Patch0,
    PrepPatch,
    PatchCmn1,
    PatchCmn2,
    TrackType,
    Safety,
}

/// Order the SP-upload patch set is applied in; `undo_sp_patch_set`
/// walks this in reverse.
const SP_PATCH_ORDER: &[PatchId] = &[
    PatchId::DevType,
    PatchId::Patch0A,
    PatchId::Patch0B,
    PatchId::PrepPatch,
    PatchId::PatchCmn1,
    PatchId::PatchCmn2,
    PatchId::TrackType,
];

fn patch_address(fp: Fingerprint, pid: PatchId) -> Option<u32> {
    let table: &[(Fingerprint, u32)] = match pid {
        PatchId::DevType => &[
            (Fingerprint::S1600, 0x02003fcf),
            (Fingerprint::S1500, 0x02003fc7),
            (Fingerprint::S1400, 0x03000220),
            (Fingerprint::S1300, 0x02003e97),
        ],
        PatchId::Patch0A => &[
            (Fingerprint::S1600, 0x0007f408),
            (Fingerprint::S1500, 0x0007e988),
            (Fingerprint::S1400, 0x0007e2c8),
            (Fingerprint::S1300, 0x0007aa00),
        ],
        PatchId::Patch0B => &[
            (Fingerprint::S1600, 0x0007efec),
            (Fingerprint::S1500, 0x0007e56c),
            (Fingerprint::S1400, 0x0007deac),
            (Fingerprint::S1300, 0x0007a5e4),
            (Fingerprint::S1200, 0x00078dcc),
        ],
        PatchId::PrepPatch => &[
            (Fingerprint::S1600, 0x00077c04),
            (Fingerprint::S1500, 0x0007720c),
            (Fingerprint::S1400, 0x00076b38),
            (Fingerprint::S1300, 0x00073488),
            (Fingerprint::S1200, 0x00071e5c),
        ],
        PatchId::PatchCmn1 => &[
            (Fingerprint::S1600, 0x0007f4e8),
            (Fingerprint::S1500, 0x0007ea68),
            (Fingerprint::S1400, 0x0007e3a8),
            (Fingerprint::S1300, 0x0007aae0),
            (Fingerprint::S1200, 0x00078eac),
        ],
        PatchId::PatchCmn2 => &[
            (Fingerprint::S1600, 0x0007f4ec),
            (Fingerprint::S1500, 0x0007ea6c),
            (Fingerprint::S1400, 0x0007e3ac),
            (Fingerprint::S1300, 0x0007aae4),
            (Fingerprint::S1200, 0x00078eb0),
        ],
        PatchId::TrackType => &[
            (Fingerprint::S1600, 0x000852b0),
            (Fingerprint::S1500, 0x00084820),
            (Fingerprint::S1400, 0x00084160),
            (Fingerprint::S1300, 0x00080798),
            (Fingerprint::S1200, 0x0007ea9c),
        ],
        PatchId::Safety => &[
            (Fingerprint::S1600, 0x000000c4),
            (Fingerprint::S1500, 0x000000c4),
            (Fingerprint::S1400, 0x000000c4),
            (Fingerprint::S1300, 0x000000c4),
        ],
        PatchId::Patch0 => return None,
    };
    table.iter().find(|(f, _)| *f == fp).map(|(_, addr)| *addr)
}

/// Payload bytes for a patch id, gated by a fingerprint bitmask (not all
/// patch ids carry fixed payloads - `Patch0A`/`Patch0B` are addresses
/// only, their payload is the generic `Patch0` entry).
fn patch_payload(fp: Fingerprint, pid: PatchId) -> Option<[u8; 4]> {
    let (mask, payload): (u32, [u8; 4]) = match pid {
        PatchId::Patch0 | PatchId::Patch0A | PatchId::Patch0B => (
            Fingerprint::S1200.bitmask()
                | Fingerprint::S1300.bitmask()
                | Fingerprint::S1400.bitmask()
                | Fingerprint::S1500.bitmask()
                | Fingerprint::S1600.bitmask(),
            [0x00, 0x00, 0xa0, 0xe1],
        ),
        PatchId::PrepPatch => (
            Fingerprint::S1200.bitmask()
                | Fingerprint::S1300.bitmask()
                | Fingerprint::S1400.bitmask()
                | Fingerprint::S1500.bitmask()
                | Fingerprint::S1600.bitmask(),
            [0x0d, 0x31, 0x01, 0x60],
        ),
        PatchId::PatchCmn1 => (
            Fingerprint::S1200.bitmask()
                | Fingerprint::S1300.bitmask()
                | Fingerprint::S1400.bitmask()
                | Fingerprint::S1500.bitmask()
                | Fingerprint::S1600.bitmask(),
            [0x14, 0x80, 0x80, 0x03],
        ),
        PatchId::PatchCmn2 => (
            Fingerprint::S1200.bitmask()
                | Fingerprint::S1300.bitmask()
                | Fingerprint::S1400.bitmask()
                | Fingerprint::S1500.bitmask()
                | Fingerprint::S1600.bitmask(),
            [0x14, 0x90, 0x80, 0x03],
        ),
        PatchId::TrackType => (
            Fingerprint::S1200.bitmask()
                | Fingerprint::S1300.bitmask()
                | Fingerprint::S1400.bitmask()
                | Fingerprint::S1500.bitmask()
                | Fingerprint::S1600.bitmask(),
            [0x06, 0x02, 0x00, 0x04],
        ),
        PatchId::Safety => (
            Fingerprint::S1400.bitmask() | Fingerprint::S1500.bitmask() | Fingerprint::S1600.bitmask(),
            [0xdc, 0xff, 0xff, 0xea],
        ),
        PatchId::DevType => return None,
    };
    if mask & fp.bitmask() != 0 {
        Some(payload)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemAcc {
    Close = 0x0,
    Read = 0x1,
    Write = 0x2,
}

/// One occupied slot in the 8-entry patch registry: the id installed,
/// the address it lives at, and the bytes it overwrote (needed to undo).
#[derive(Debug, Clone)]
struct PatchSlot {
    id: PatchId,
    addr: u32,
    original: Vec<u8>,
}

/// Firmware-fingerprint detection plus the runtime patch registry for
/// one open connection. Every method takes the live [`Connection`] it
/// was handed; callers are expected to hold it for the engine's
/// lifetime, matching the transport's single-writer exclusion.
#[derive(Debug, Default)]
pub struct PatchEngine {
    fingerprint: Option<Fingerprint>,
    factory_mode: bool,
    slots: [Option<PatchSlot>; MAX_PATCH],
}

impl PatchEngine {
    pub fn new() -> Self {
        PatchEngine::default()
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.fingerprint
    }

    /// Opens the disc-subunit-identifier descriptor for read, then fires
    /// the two hard-coded enable-factory commands. Idempotent.
    pub async fn enable_factory(&mut self, conn: &mut Connection) -> Result<()> {
        if self.factory_mode {
            return Ok(());
        }
        debug!("enabling factory mode");
        conn.change_descriptor(Descriptor::DiscSubunitIdentifier, DscrtAction::OpenRead).await?;

        let p1 = [0x00, 0x18, 0x09, 0x00, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00];
        conn.exchange(&p1, false).await?;

        let p2 = query::format("00 1801 ff %<b %*", &[Param::Byte(14), Param::Bytes(b"Net MD Walkman".to_vec())])?;
        conn.exchange(&p2, true).await?;

        self.factory_mode = true;
        Ok(())
    }

    /// Probes the device's firmware build via factory request `00 18 12
    /// FF` and caches the resulting fingerprint. Non-Sony or
    /// unrecognised chips yield `NoSupport` without error.
    pub async fn detect_fingerprint(&mut self, conn: &mut Connection) -> Result<Fingerprint> {
        if let Some(fp) = self.fingerprint {
            return Ok(fp);
        }

        self.enable_factory(conn).await?;

        let resp = conn.exchange(&[0x00, 0x18, 0x12, 0xff], true).await?;
        if resp.len() < 8 {
            self.fingerprint = Some(Fingerprint::Unknown);
            return Ok(Fingerprint::Unknown);
        }

        let chip = resp[4];
        let hwid = resp[5];
        let subversion = resp[6];
        let version = resp[7];

        if chip == 0xff && hwid == 0xff && version == 0xff && subversion == 0xff {
            self.fingerprint = Some(Fingerprint::Unknown);
            return Ok(Fingerprint::Unknown);
        }

        let prefix = match chip {
            0x20 => "R",
            0x21 => "S",
            0x22 => "Hn",
            0x24 => "Hr",
            0x25 => "Hx",
            other => {
                warn!("unrecognised chip byte 0x{other:02x}, treating as unsupported");
                self.fingerprint = Some(Fingerprint::NoSupport);
                return Ok(Fingerprint::NoSupport);
            }
        };

        let code = format!("{prefix}{}.{}{:02x}", version >> 4, version & 0xf, subversion);
        info!("detected firmware {code}");

        let fp = match code.as_str() {
            "R1.000" => Fingerprint::R1000,
            "R1.100" => Fingerprint::R1100,
            "R1.200" => Fingerprint::R1200,
            "R1.300" => Fingerprint::R1300,
            "R1.400" => Fingerprint::R1400,
            "S1.000" => Fingerprint::S1000,
            "S1.100" => Fingerprint::S1100,
            "S1.200" => Fingerprint::S1200,
            "S1.300" => Fingerprint::S1300,
            "S1.400" => Fingerprint::S1400,
            "S1.500" => Fingerprint::S1500,
            "S1.600" => Fingerprint::S1600,
            _ => Fingerprint::NoSupport,
        };
        self.fingerprint = Some(fp);
        Ok(fp)
    }

    async fn change_mem_state(&mut self, conn: &mut Connection, addr: u32, size: u8, acc: MemAcc) -> Result<()> {
        let cmd = query::format(
            "00 1820 ff 00 %<d %b %b 00",
            &[Param::Dword(addr), Param::Byte(size), Param::Byte(acc as u8)],
        )?;
        conn.exchange(&cmd, true).await?;
        Ok(())
    }

    async fn patch_write_raw(&mut self, conn: &mut Connection, addr: u32, data: &[u8]) -> Result<()> {
        let checksum = crc16(data);
        let cmd = query::format(
            "00 1822 ff 00 %<d %b 0000 %* %<w",
            &[Param::Dword(addr), Param::Byte(data.len() as u8), Param::Bytes(data.to_vec()), Param::Word(checksum)],
        )?;
        conn.exchange(&cmd, true).await?;
        Ok(())
    }

    async fn patch_read_raw(&mut self, conn: &mut Connection, addr: u32, size: u8) -> Result<Vec<u8>> {
        let cmd = query::format("00 1821 ff 00 %<d %b", &[Param::Dword(addr), Param::Byte(size)])?;
        let resp = conn.exchange(&cmd, true).await?;
        let captured = query::scan("%? 1821 00 %? %?%?%?%? %? %?%? %*", &resp)?;
        let Some(Captured::Bytes(mut data)) = captured.into_iter().next() else {
            return Err(Error::cmd_failed("patch read: malformed response"));
        };
        if data.len() < 2 {
            return Err(Error::cmd_failed("patch read: response too short for checksum"));
        }
        data.truncate(data.len() - 2);
        Ok(data)
    }

    /// Open for read, read, close, with state balanced on every exit path.
    pub async fn clean_read(&mut self, conn: &mut Connection, addr: u32, size: u8) -> Result<Vec<u8>> {
        self.change_mem_state(conn, addr, size, MemAcc::Read).await?;
        let result = self.patch_read_raw(conn, addr, size).await;
        self.change_mem_state(conn, addr, size, MemAcc::Close).await?;
        result
    }

    /// Open for write, write, close, with state balanced on every exit path.
    pub async fn clean_write(&mut self, conn: &mut Connection, addr: u32, data: &[u8]) -> Result<()> {
        self.change_mem_state(conn, addr, data.len() as u8, MemAcc::Write).await?;
        let result = self.patch_write_raw(conn, addr, data).await;
        self.change_mem_state(conn, addr, data.len() as u8, MemAcc::Close).await?;
        result
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    fn slot_of(&self, pid: PatchId) -> Option<usize> {
        self.slots.iter().position(|s| matches!(s, Some(slot) if slot.id == pid))
    }

    /// Writes `payload` at `addr`, recording the previous bytes so
    /// `unpatch` can restore them. Fails if the registry is full.
    async fn patch(&mut self, conn: &mut Connection, id: PatchId, addr: u32, payload: &[u8]) -> Result<()> {
        let slot = self.free_slot().ok_or_else(|| Error::cmd_failed("no free patch slot"))?;
        let original = self.clean_read(conn, addr, payload.len() as u8).await?;
        self.clean_write(conn, addr, payload).await?;
        self.slots[slot] = Some(PatchSlot { id, addr, original });
        Ok(())
    }

    /// Restores the bytes a previously applied patch overwrote and frees
    /// its slot. No-op if the id isn't currently resident.
    async fn unpatch(&mut self, conn: &mut Connection, id: PatchId) -> Result<()> {
        let Some(idx) = self.slot_of(id) else {
            return Ok(());
        };
        let slot = self.slots[idx].take().expect("slot_of only returns occupied indices");
        self.clean_write(conn, slot.addr, &slot.original).await
    }

    fn supports_sp_upload(&self, fp: Fingerprint) -> bool {
        !matches!(fp, Fingerprint::NoSupport | Fingerprint::Unknown) && patch_address(fp, PatchId::DevType).is_some()
    }

    /// Applies the full SP-upload patch set: dev-type, prep-patch,
    /// common-1/2, track-type, both `Patch0` variants, and - on S1.4+ -
    /// the anti-brick safety patch.
    pub async fn apply_sp_patch_set(&mut self, conn: &mut Connection) -> Result<()> {
        let fp = self.detect_fingerprint(conn).await?;
        if !self.supports_sp_upload(fp) {
            return Err(Error::not_supported("device firmware does not support SP upload patching"));
        }

        for &pid in SP_PATCH_ORDER {
            let addr = match pid {
                PatchId::Patch0A | PatchId::Patch0B => patch_address(fp, pid),
                _ => patch_address(fp, pid),
            }
            .ok_or_else(|| Error::not_supported(format!("no patch address for {pid:?} on this firmware")))?;

            let payload_id = if matches!(pid, PatchId::Patch0A | PatchId::Patch0B) { PatchId::Patch0 } else { pid };
            let payload = patch_payload(fp, payload_id)
                .ok_or_else(|| Error::not_supported(format!("no patch payload for {pid:?} on this firmware")))?;

            self.patch(conn, pid, addr, &payload).await?;
        }

        if fp.needs_safety_patch() {
            if let Some(addr) = patch_address(fp, PatchId::Safety) {
                if let Some(payload) = patch_payload(fp, PatchId::Safety) {
                    self.patch(conn, PatchId::Safety, addr, &payload).await?;
                }
            }
        }

        Ok(())
    }

    /// Undoes the SP-upload patch set in reverse order. Every id is
    /// attempted even if an earlier one fails to unpatch cleanly; the
    /// first error encountered is returned after all attempts complete.
    pub async fn undo_sp_patch_set(&mut self, conn: &mut Connection) -> Result<()> {
        let mut ids: Vec<PatchId> = SP_PATCH_ORDER.iter().rev().copied().collect();
        ids.push(PatchId::Safety);

        let mut first_err = None;
        for id in ids {
            if let Err(e) = self.unpatch(conn, id).await {
                warn!("failed to unpatch {id:?}: {e}");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_bitmask_matches_expected_set() {
        assert_eq!(Fingerprint::S1200.bitmask(), 1);
        assert_eq!(Fingerprint::S1600.bitmask(), 1 << 4);
        assert_eq!(Fingerprint::R1000.bitmask(), 0);
    }

    #[test]
    fn safety_patch_only_required_from_s1400_up() {
        assert!(!Fingerprint::S1300.needs_safety_patch());
        assert!(Fingerprint::S1400.needs_safety_patch());
        assert!(Fingerprint::S1600.needs_safety_patch());
    }

    #[test]
    fn patch_address_present_for_known_firmware_absent_otherwise() {
        assert_eq!(patch_address(Fingerprint::S1600, PatchId::DevType), Some(0x02003fcf));
        assert_eq!(patch_address(Fingerprint::R1400, PatchId::DevType), None);
    }

    #[test]
    fn patch_payload_gated_by_bitmask() {
        assert_eq!(patch_payload(Fingerprint::S1600, PatchId::Safety), Some([0xdc, 0xff, 0xff, 0xea]));
        assert_eq!(patch_payload(Fingerprint::S1300, PatchId::Safety), None);
    }

    #[test]
    fn engine_starts_with_no_cached_fingerprint_and_empty_registry() {
        let engine = PatchEngine::new();
        assert!(engine.fingerprint().is_none());
        assert!(engine.free_slot() == Some(0));
    }
}
