/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! The facade: opens a recorder, exposes the disc-header model over its
//! chunked wire protocol, and drives the full secure-upload sequence
//! end to end.

use log::debug;
use rand::RngCore;

use crate::connection::{self, Connection, Descriptor, DscrtAction};
use crate::error::{Error, Result};
use crate::header::DiscHeader;
use crate::patch::PatchEngine;
use crate::query::{self, Param};
use crate::registry::{self, KnownDevice};
use crate::secure::{self, DiscFormat, Ekb, SecureSession, WireFormat};
use crate::toc::{TocEditor, SECTOR_SIZE};
use crate::wav::{self, SourceAudio};

const HEADER_HANDSHAKE: [u8; 8] = [0x00, 0x18, 0x06, 0x01, 0x00, 0x00, 0x00, 0x00];
const HEADER_QUERY_PREFIX: &str = "00 1806 02 20 18 01 00 00 30 00 0a 00 ff 00";
const HEADER_WRITE_PREFIX: &str = "00 1807 02 20 18 02 00 00 30 00 0a 00 50 00";

/// Base address of the three UTOC sectors in the firmware's staging RAM,
/// reachable through the same factory-mode memory channel the patch
/// engine uses — there is no separate disc-level TOC protocol.
const TOC_BASE_ADDR: u32 = 0x0090_0000;
/// Largest chunk `PatchEngine::clean_read`/`clean_write` can move per
/// call (their length field is one byte).
const TOC_CHUNK: usize = 200;
/// Factory command that commits the staged UTOC sectors back to disc.
const TOC_FINALIZE_CMD: [u8; 4] = [0x00, 0x18, 0x13, 0xff];

const ERASE_DISC_CMD: [u8; 6] = [0x00, 0x18, 0x40, 0xff, 0x00, 0x00];
const DISC_FLAGS_CMD: [u8; 13] =
    [0x00, 0x18, 0x06, 0x01, 0x10, 0x10, 0x00, 0xff, 0x00, 0x00, 0x01, 0x00, 0x0b];

/// Target recording mode for [`Device::upload`]. SP carries pre-encoded
/// ATRAC1 data and needs the SP-upload patch set on patchable units; LP2
/// and LP4 carry raw PCM the recorder encodes on the fly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFormat {
    Sp,
    Lp2,
    Lp4,
}

/// Builds a [`Device`] from a USB vendor/product id pair, or the first
/// recognised device currently attached.
#[derive(Debug, Default)]
pub struct DeviceBuilder {
    vendor_id: Option<u16>,
    product_id: Option<u16>,
}

impl DeviceBuilder {
    pub fn new() -> Self {
        DeviceBuilder::default()
    }

    pub fn with_ids(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_id = Some(vendor_id);
        self.product_id = Some(product_id);
        self
    }

    /// Opens the requested device, or the first device in
    /// [`connection::list_devices`] this crate recognises.
    pub async fn build(self) -> Result<Device> {
        let (vendor_id, product_id) = match (self.vendor_id, self.product_id) {
            (Some(v), Some(p)) => (v, p),
            _ => {
                let found = connection::list_devices()
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::usb("no recognised NetMD device attached"))?;
                (found.vendor_id, found.product_id)
            }
        };

        let known = registry::lookup(vendor_id, product_id).copied();
        let port = connection::open_port(vendor_id, product_id).await?;
        let mut conn = Connection::new(port);
        conn.open().await?;
        conn.wait_for_sync().await?;

        if let Ok(Some(product)) = conn.product_string().await {
            debug!("opened NetMD device: {product}");
        }

        if known.map(|k| k.needs_acquire).unwrap_or(false) {
            conn.acquire().await?;
        }

        let mut patch = PatchEngine::new();
        if let Err(e) = patch.detect_fingerprint(&mut conn).await {
            debug!("fingerprint probe failed, proceeding without a known patch set: {e}");
        }

        Ok(Device { conn, patch, known, header_cache: None, toc_cache: None })
    }
}

/// One open connection to a recorder, plus the lazily-populated
/// firmware-patch engine and disc-header cache built on top of it.
#[derive(Debug)]
pub struct Device {
    conn: Connection,
    patch: PatchEngine,
    known: Option<KnownDevice>,
    header_cache: Option<(DiscHeader, u16)>,
    toc_cache: Option<TocEditor>,
}

impl Device {
    pub fn vendor_id(&self) -> u16 {
        self.conn.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.conn.product_id()
    }

    pub fn model(&self) -> Option<&'static str> {
        self.known.map(|k| k.model)
    }

    pub async fn close(&mut self) -> Result<()> {
        self.conn.close().await
    }

    async fn read_header_chunk(&mut self, remaining: u16, read: u16) -> Result<Vec<u8>> {
        let cmd = query::format(
            &format!("{HEADER_QUERY_PREFIX} %>w %>w"),
            &[Param::Word(remaining), Param::Word(read)],
        )?;
        self.conn.exchange(&cmd, false).await
    }

    /// Reads the disc-header wire string via the device's chunked
    /// protocol: an 8-byte handshake, then repeated queries carrying how
    /// much has been read so far, until the declared total is reached.
    ///
    /// The first response carries the declared total length at offset 23
    /// and this chunk's length at offset 15, with a six-byte preamble
    /// before the data itself; later chunks drop that preamble.
    async fn read_header_string(&mut self) -> Result<(String, u16)> {
        self.conn.exchange(&HEADER_HANDSHAKE, false).await?;

        let mut body = Vec::new();
        let mut total: Option<u16> = None;

        loop {
            let read_so_far = body.len() as u16;
            let remaining = total.map(|t| t.saturating_sub(read_so_far)).unwrap_or(0);
            let resp = self.read_header_chunk(remaining, read_so_far).await?;

            let chunk = if total.is_none() {
                if resp.len() < 25 {
                    return Err(Error::cmd_failed("header read: response too short for first chunk"));
                }
                let declared_total = u16::from_be_bytes([resp[23], resp[24]]);
                let declared_chunk = u16::from_be_bytes([resp[15], resp[16]]);
                total = Some(declared_total);
                let len = (declared_chunk as usize).saturating_sub(6).min(resp.len() - 25);
                resp[25..25 + len].to_vec()
            } else {
                if resp.len() < 17 {
                    return Err(Error::cmd_failed("header read: response too short"));
                }
                let declared_chunk = u16::from_be_bytes([resp[15], resp[16]]);
                let len = (declared_chunk as usize).min(resp.len() - 17);
                resp[17..17 + len].to_vec()
            };

            if chunk.is_empty() {
                break;
            }
            body.extend_from_slice(&chunk);

            if body.len() as u16 >= total.unwrap_or(0) {
                break;
            }
        }

        let len = body.len() as u16;
        let s = String::from_utf8(body).map_err(|_| Error::cmd_failed("header string is not valid UTF-8"))?;
        Ok((s, len))
    }

    /// Writes a new header string back, guarded by the device's own copy
    /// of the previous length: a mismatch means another client changed
    /// the header concurrently and the device rejects the command.
    async fn write_header_string(&mut self, new_value: &str, old_len: u16) -> Result<()> {
        self.conn.change_descriptor(Descriptor::DiscTitleTd, DscrtAction::OpenWrite).await?;
        self.conn.change_descriptor(Descriptor::AudioUtoc1Td, DscrtAction::OpenWrite).await?;

        let payload = new_value.as_bytes();
        let cmd = query::format(
            &format!("{HEADER_WRITE_PREFIX} %>w 00 00 %>w %*"),
            &[Param::Word(old_len), Param::Word(payload.len() as u16), Param::Bytes(payload.to_vec())],
        )?;
        let result = self.conn.exchange(&cmd, false).await;

        self.conn.change_descriptor(Descriptor::AudioUtoc1Td, DscrtAction::Close).await?;
        self.conn.change_descriptor(Descriptor::DiscTitleTd, DscrtAction::Close).await?;

        match result {
            Ok(_) => Ok(()),
            Err(Error::CmdFailed(_)) => Err(Error::cmd_failed("header changed concurrently, stale length rejected")),
            Err(e) => Err(e),
        }
    }

    async fn header(&mut self) -> Result<&mut (DiscHeader, u16)> {
        if self.header_cache.is_none() {
            let (s, len) = self.read_header_string().await?;
            let header = DiscHeader::parse(&s)?;
            self.header_cache = Some((header, len));
        }
        Ok(self.header_cache.as_mut().unwrap())
    }

    async fn flush_header(&mut self) -> Result<()> {
        let (header, old_len) = self.header_cache.clone().expect("header cache populated by caller");
        let serialized = header.serialize();
        self.write_header_string(&serialized, old_len).await?;
        self.header_cache = Some((header, serialized.len() as u16));
        Ok(())
    }

    pub async fn disc_title(&mut self) -> Result<String> {
        Ok(self.header().await?.0.disc_title().to_string())
    }

    pub async fn set_disc_title(&mut self, title: &str) -> Result<()> {
        self.header().await?.0.set_disc_title(title);
        self.flush_header().await
    }

    pub async fn add_group(&mut self, first: u32, last: Option<u32>, title: &str) -> Result<()> {
        self.header().await?.0.add_group(first, last, title)?;
        self.flush_header().await
    }

    pub async fn rename_group(&mut self, id: u32, title: &str) -> Result<()> {
        self.header().await?.0.rename_group(id, title)?;
        self.flush_header().await
    }

    pub async fn remove_group(&mut self, id: u32) -> Result<()> {
        self.header().await?.0.remove_group(id)?;
        self.flush_header().await
    }

    pub async fn get_track_group(&mut self, track: u32) -> Result<String> {
        Ok(self.header().await?.0.get_track_group(track).to_string())
    }

    /// Erases the whole disc, discarding every track and the UTOC.
    pub async fn erase_disc(&mut self) -> Result<()> {
        self.conn.exchange(&ERASE_DISC_CMD, false).await?;
        self.header_cache = None;
        self.toc_cache = None;
        Ok(())
    }

    /// Reads the disc's flags byte (write-protect, recordable state).
    pub async fn disc_flags(&mut self) -> Result<u8> {
        let resp = self.conn.exchange(&DISC_FLAGS_CMD, false).await?;
        resp.last().copied().ok_or_else(|| Error::cmd_failed("disc flags response was empty"))
    }

    async fn read_toc_sector(&mut self, sector: u32) -> Result<Vec<u8>> {
        let base = TOC_BASE_ADDR + sector * SECTOR_SIZE as u32;
        let mut out = Vec::with_capacity(SECTOR_SIZE);
        while out.len() < SECTOR_SIZE {
            let want = (SECTOR_SIZE - out.len()).min(TOC_CHUNK) as u8;
            let chunk = self.patch.clean_read(&mut self.conn, base + out.len() as u32, want).await?;
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    async fn write_toc_sector(&mut self, sector: u32, data: &[u8]) -> Result<()> {
        let base = TOC_BASE_ADDR + sector * SECTOR_SIZE as u32;
        for (i, chunk) in data.chunks(TOC_CHUNK).enumerate() {
            self.patch.clean_write(&mut self.conn, base + (i * TOC_CHUNK) as u32, chunk).await?;
        }
        Ok(())
    }

    /// Reads the three UTOC sectors through the factory-mode memory
    /// channel and caches the resulting editor, fetching once per
    /// session.
    pub async fn toc(&mut self) -> Result<&mut TocEditor> {
        if self.toc_cache.is_none() {
            let tracks = self.read_toc_sector(0).await?;
            let titles = self.read_toc_sector(1).await?;
            let times = self.read_toc_sector(2).await?;
            self.toc_cache = Some(TocEditor::from_sectors(tracks, titles, times)?);
        }
        Ok(self.toc_cache.as_mut().unwrap())
    }

    /// Writes the cached editor's sectors back and issues the finalize
    /// command that commits them to disc.
    pub async fn sync_toc(&mut self) -> Result<()> {
        let editor = self.toc_cache.as_ref().ok_or_else(|| Error::cmd_failed("no TOC has been read yet"))?;
        let (tracks, titles, times) = editor.sectors();
        let (tracks, titles, times) = (tracks.to_vec(), titles.to_vec(), times.to_vec());

        self.write_toc_sector(0, &tracks).await?;
        self.write_toc_sector(1, &titles).await?;
        self.write_toc_sector(2, &times).await?;

        self.conn.exchange(&TOC_FINALIZE_CMD, true).await?;
        Ok(())
    }

    /// Uploads `audio_bytes` as a new track titled `title`, in `format`.
    /// Implements the full secure-session sequence: session setup, SP
    /// patching when applicable, EKB/session-key exchange, packetized
    /// transfer, title assignment and TOC sync, and commit — tearing the
    /// session back down (patches undone, session forgotten, device
    /// released) whether or not the transfer succeeded.
    pub async fn upload(&mut self, title: &str, audio_bytes: &[u8], format: UploadFormat) -> Result<u16> {
        let source = wav::sniff(audio_bytes)?;
        let result = self.upload_inner(title, source, format).await;
        let _ = self.conn.release().await;
        result
    }

    async fn upload_inner(&mut self, title: &str, source: SourceAudio, format: UploadFormat) -> Result<u16> {
        self.conn.acquire().await?;

        let mut session = SecureSession::new();
        let _ = session.leave(&mut self.conn).await;
        session.set_track_protection(&mut self.conn, true).await?;
        session.enter(&mut self.conn).await?;

        let sp_patched = format == UploadFormat::Sp && self.known.map(|k| k.patchable).unwrap_or(false);
        if sp_patched {
            self.patch.apply_sp_patch_set(&mut self.conn).await?;
        }

        let upload_result = self.run_secure_upload(&mut session, source, format).await;

        if sp_patched {
            let _ = self.patch.undo_sp_patch_set(&mut self.conn).await;
        }

        let track = upload_result?;

        let toc = self.toc().await?;
        toc.set_track_title(track as u8, title)?;
        self.sync_toc().await?;

        Ok(track)
    }

    async fn run_secure_upload(
        &mut self,
        session: &mut SecureSession,
        source: SourceAudio,
        format: UploadFormat,
    ) -> Result<u16> {
        let (wire_bytes, wf, df, channels, frame_override) = match (source, format) {
            (SourceAudio::Atrac1 { data }, UploadFormat::Sp) => {
                let frames = (data.len() / 212) as u32;
                (wav::restructure_atrac1(&data), WireFormat::Sp, DiscFormat::SpStereo, 2u8, Some(frames))
            }
            (SourceAudio::Pcm { samples, channels, .. }, UploadFormat::Lp2) => {
                (wav::pcm_to_wire_bytes(&samples), WireFormat::Lp2, DiscFormat::Lp2, channels, None)
            }
            (SourceAudio::Pcm { samples, channels, .. }, UploadFormat::Lp4) => {
                (wav::pcm_to_wire_bytes(&samples), WireFormat::Lp4, DiscFormat::Lp4, channels, None)
            }
            (SourceAudio::Pcm { .. }, UploadFormat::Sp) => {
                return Err(Error::invalid_param("SP upload requires pre-encoded ATRAC1 input"));
            }
            (SourceAudio::Atrac1 { .. }, _) => {
                return Err(Error::invalid_param("pre-encoded ATRAC1 input is only valid for SP uploads"));
            }
        };

        let ekb = Ekb::default();
        session.send_key_data(&mut self.conn, &ekb).await?;

        let mut host_nonce = [0u8; 8];
        rand::rng().fill_bytes(&mut host_nonce);
        session.establish_session_key(&mut self.conn, host_nonce).await?;

        session.setup_download(&mut self.conn, &secure::DEFAULT_CONTENT_ID, &secure::DEFAULT_KEK).await?;

        let (packets, computed_frames, _) =
            SecureSession::prepare_packets(&wire_bytes, channels, &secure::DEFAULT_KEK, wf);
        let frames = frame_override.unwrap_or(computed_frames);

        let (track, _uuid, _content_id) = session.send_track(&mut self.conn, wf, df, frames, &packets).await?;

        session.commit_track(&mut self.conn, track).await?;
        session.forget_session_key(&mut self.conn).await?;
        session.leave(&mut self.conn).await?;

        Ok(track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_format_equality() {
        assert_eq!(UploadFormat::Sp, UploadFormat::Sp);
        assert_ne!(UploadFormat::Sp, UploadFormat::Lp2);
    }
}
