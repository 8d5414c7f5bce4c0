/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Structured view over the three UTOC sectors (tracks, titles,
//! timestamps), and the editor that produces a gapless multi-track split
//! of a single uploaded audio stream.

pub mod csg;

use bitflags::bitflags;
use chrono::{Datelike, NaiveDateTime, Timelike};

use crate::error::{Error, Result};
use csg::Csg;

pub const SECTOR_SIZE: usize = 2352;
/// Leading bytes of each sector that precede the UTOC payload proper
/// (mirrors the raw-sector header the drive prepends ahead of the
/// `unknown_*` padding the reference UTOC layout documents).
const PAD: usize = 16;

const TRACKMAP_OFFSET: usize = PAD + 32;
const FRAGLIST_OFFSET: usize = PAD + 288;
const SIGN_OFFSET: usize = PAD + 12;
const NONEMPTY_OFFSET: usize = PAD + 14;
const NTRACKS_OFFSET: usize = PAD + 15;
const FREE_TRACK_SLOT_OFFSET: usize = PAD + 31;

const TITLEMAP_OFFSET: usize = PAD + 32;
const TITLELIST_OFFSET: usize = PAD + 288;
const FREE_TITLE_SLOT_OFFSET: usize = PAD + 31;

const TIMEMAP_OFFSET: usize = PAD + 32;
const TIMELIST_OFFSET: usize = PAD + 288;
const FREE_TIME_SLOT_OFFSET: usize = PAD + 31;

const FRAGMENT_SIZE: usize = 8;
const TITLECELL_SIZE: usize = 8;
const TIMESTAMP_SIZE: usize = 8;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TrackMode: u8 {
        const PREEMPH   = 1 << 0;
        const STEREO    = 1 << 1;
        const SP_MODE   = 1 << 2;
        const UNK1      = 1 << 3;
        const AUDIO     = 1 << 4;
        const SCMS_CPY  = 1 << 5;
        const SCMS_UNR  = 1 << 6;
        const WRTENB    = 1 << 7;
    }
}

impl Default for TrackMode {
    fn default() -> Self {
        TrackMode::STEREO | TrackMode::SP_MODE | TrackMode::AUDIO | TrackMode::SCMS_CPY | TrackMode::SCMS_UNR | TrackMode::WRTENB
    }
}

/// A contiguous region of recorded audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fragment {
    pub start: Csg,
    pub mode: TrackMode,
    pub end: Csg,
    pub link: Option<u8>,
}

/// A disc or track timestamp as the device prints it (BCD-like decimal
/// digits stored directly as hex-printable bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub signature: u16,
}

impl Timestamp {
    pub fn now() -> Self {
        Self::from_naive(chrono::Local::now().naive_local())
    }

    pub fn from_naive(dt: NaiveDateTime) -> Self {
        Timestamp {
            year: (dt.year() % 100) as u8,
            month: dt.month() as u8,
            day: dt.day() as u8,
            hour: dt.hour() as u8,
            minute: dt.minute() as u8,
            second: dt.second() as u8,
            signature: csg::MS_PER_GROUP_STEREO as u16, // placeholder machine signature
        }
    }
}

fn used_slots(map: &[u8; 256]) -> std::collections::HashSet<u8> {
    map.iter().copied().filter(|&s| s != 0).collect()
}

fn next_free_slot(used: &std::collections::HashSet<u8>) -> Result<u8> {
    (1u16..=255).map(|v| v as u8).find(|s| !used.contains(s)).ok_or_else(|| Error::other("TocFull"))
}

/// A 7,056-byte read/write view over the three UTOC sectors.
pub struct TocEditor {
    tracks: Vec<u8>,
    titles: Vec<u8>,
    times: Vec<u8>,
    /// Recorded by `import`: total DAO length in ms and the audio extent
    /// used to budget each split.
    total_length_ms: f64,
    extent_start: Csg,
    extent_end: Csg,
    cursor: Csg,
}

impl TocEditor {
    pub fn new() -> Self {
        TocEditor {
            tracks: vec![0u8; SECTOR_SIZE],
            titles: vec![0u8; SECTOR_SIZE],
            times: vec![0u8; SECTOR_SIZE],
            total_length_ms: 0.0,
            extent_start: Csg { cluster: 0, sector: 0, group: 0 },
            extent_end: Csg { cluster: 0, sector: 0, group: 0 },
            cursor: Csg { cluster: 0, sector: 0, group: 0 },
        }
    }

    pub fn from_sectors(tracks: Vec<u8>, titles: Vec<u8>, times: Vec<u8>) -> Result<Self> {
        if tracks.len() != SECTOR_SIZE || titles.len() != SECTOR_SIZE || times.len() != SECTOR_SIZE {
            return Err(Error::invalid_param("UTOC sectors must be 2352 bytes each"));
        }
        Ok(TocEditor {
            tracks,
            titles,
            times,
            total_length_ms: 0.0,
            extent_start: Csg { cluster: 0, sector: 0, group: 0 },
            extent_end: Csg { cluster: 0, sector: 0, group: 0 },
            cursor: Csg { cluster: 0, sector: 0, group: 0 },
        })
    }

    pub fn sectors(&self) -> (&[u8], &[u8], &[u8]) {
        (&self.tracks, &self.titles, &self.times)
    }

    fn trackmap(&self) -> [u8; 256] {
        self.tracks[TRACKMAP_OFFSET..TRACKMAP_OFFSET + 256].try_into().unwrap()
    }

    fn fragment_at(&self, slot: u8) -> Fragment {
        let off = FRAGLIST_OFFSET + slot as usize * FRAGMENT_SIZE;
        let b = &self.tracks[off..off + FRAGMENT_SIZE];
        Fragment {
            start: Csg::from_packed([b[0], b[1], b[2]]),
            mode: TrackMode::from_bits_truncate(b[3]),
            end: Csg::from_packed([b[4], b[5], b[6]]),
            link: if b[7] == 0 { None } else { Some(b[7]) },
        }
    }

    fn set_fragment(&mut self, slot: u8, frag: Fragment) {
        let off = FRAGLIST_OFFSET + slot as usize * FRAGMENT_SIZE;
        let s = frag.start.to_packed();
        let e = frag.end.to_packed();
        self.tracks[off] = s[0];
        self.tracks[off + 1] = s[1];
        self.tracks[off + 2] = s[2];
        self.tracks[off + 3] = frag.mode.bits();
        self.tracks[off + 4] = e[0];
        self.tracks[off + 5] = e[1];
        self.tracks[off + 6] = e[2];
        self.tracks[off + 7] = frag.link.unwrap_or(0);
    }

    fn set_trackmap_entry(&mut self, track: u8, slot: u8) {
        self.tracks[TRACKMAP_OFFSET + track as usize] = slot;
    }

    /// Next free fragment slot in `1..=255` (slot 0 is the free list head,
    /// never usable as a real fragment).
    pub fn next_free_fragment(&self) -> Result<u8> {
        next_free_slot(&used_slots(&self.trackmap()))
    }

    pub fn next_free_title_cell(&self) -> Result<u8> {
        let map: [u8; 256] = self.titles[TITLEMAP_OFFSET..TITLEMAP_OFFSET + 256].try_into().unwrap();
        next_free_slot(&used_slots(&map))
    }

    /// Records the DAO track count and reads the first fragment's extent,
    /// preparing the editor to accept a sequence of `add_track` splits.
    pub fn import(&mut self, track_count: u8, total_length_ms: f64, _bytes: &[u8]) -> Result<()> {
        self.tracks[NTRACKS_OFFSET] = track_count;
        self.tracks[NONEMPTY_OFFSET] = if track_count > 0 { 1 } else { 0 };
        self.total_length_ms = total_length_ms;

        let first_slot = self.trackmap()[1];
        if first_slot == 0 {
            return Err(Error::other("no DAO fragment to import"));
        }
        let frag = self.fragment_at(first_slot);
        self.extent_start = frag.start;
        self.extent_end = frag.end;
        self.cursor = frag.start;
        Ok(())
    }

    /// Adds the `n`th split (1-indexed, called in order) of length
    /// `length_ms`, with the given title and timestamp.
    pub fn add_track(&mut self, n: u8, total_splits: u8, length_ms: f64, title: &str, stamp: Timestamp) -> Result<()> {
        let extent_groups = self.extent_end.to_linear().saturating_sub(self.extent_start.to_linear());
        let budget = ((length_ms / self.total_length_ms) * extent_groups as f64).ceil() as u32;

        let slot = if n == 1 {
            self.trackmap()[1]
        } else {
            let s = self.next_free_fragment()?;
            s
        };

        let start = self.cursor;
        let mut end = Csg::from_linear(start.to_linear() + budget.saturating_sub(1));
        if n == total_splits {
            end = self.extent_end;
        }

        let frag = Fragment { start, mode: TrackMode::default(), end, link: None };
        self.set_fragment(slot, frag);
        self.set_trackmap_entry(n, slot);
        self.cursor = Csg::from_linear(end.to_linear() + 1);

        self.set_track_title(n, title)?;
        self.set_timestamp(n, stamp)?;
        Ok(())
    }

    fn title_cell(&self, slot: u8) -> ([u8; 7], Option<u8>) {
        let off = TITLELIST_OFFSET + slot as usize * TITLECELL_SIZE;
        let mut text = [0u8; 7];
        text.copy_from_slice(&self.titles[off..off + 7]);
        let link = self.titles[off + 7];
        (text, if link == 0 { None } else { Some(link) })
    }

    fn set_title_cell(&mut self, slot: u8, text: &[u8], link: Option<u8>) {
        let off = TITLELIST_OFFSET + slot as usize * TITLECELL_SIZE;
        let mut buf = [0u8; 7];
        let n = text.len().min(7);
        buf[..n].copy_from_slice(&text[..n]);
        self.titles[off..off + 7].copy_from_slice(&buf);
        self.titles[off + 7] = link.unwrap_or(0);
    }

    fn free_title_chain(&mut self, head: u8) {
        let mut slot = head;
        while slot != 0 {
            let (_, link) = self.title_cell(slot);
            self.set_title_cell(slot, &[], None);
            match link {
                Some(next) => slot = next,
                None => break,
            }
        }
    }

    /// Splits `title` into 7-byte cells chained by each cell's
    /// link-to-next, and points the track map at the head cell. Frees any
    /// previously linked cells first.
    pub fn set_track_title(&mut self, track: u8, title: &str) -> Result<()> {
        let map: [u8; 256] = self.titles[TITLEMAP_OFFSET..TITLEMAP_OFFSET + 256].try_into().unwrap();
        let old_head = map[track as usize];
        if old_head != 0 {
            self.free_title_chain(old_head);
        }

        if title.is_empty() {
            self.titles[TITLEMAP_OFFSET + track as usize] = 0;
            return Ok(());
        }

        let chunks: Vec<&[u8]> = title.as_bytes().chunks(7).collect();
        let mut slots = Vec::with_capacity(chunks.len());
        for _ in &chunks {
            slots.push(self.next_free_title_cell_excluding(&slots)?);
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let link = slots.get(i + 1).copied();
            self.set_title_cell(slots[i], chunk, link);
        }

        self.titles[TITLEMAP_OFFSET + track as usize] = slots[0];
        Ok(())
    }

    fn next_free_title_cell_excluding(&self, taken: &[u8]) -> Result<u8> {
        let map: [u8; 256] = self.titles[TITLEMAP_OFFSET..TITLEMAP_OFFSET + 256].try_into().unwrap();
        let mut used = used_slots(&map);
        used.extend(taken.iter().copied());
        next_free_slot(&used)
    }

    pub fn set_disc_title(&mut self, title: &str) -> Result<()> {
        self.set_track_title(0, title)
    }

    fn read_title(&self, head: u8) -> String {
        let mut out = Vec::new();
        let mut slot = head;
        while slot != 0 {
            let (text, link) = self.title_cell(slot);
            let end = text.iter().position(|&b| b == 0).unwrap_or(7);
            out.extend_from_slice(&text[..end]);
            match link {
                Some(next) => slot = next,
                None => break,
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    pub fn track_title(&self, track: u8) -> String {
        let map: [u8; 256] = self.titles[TITLEMAP_OFFSET..TITLEMAP_OFFSET + 256].try_into().unwrap();
        self.read_title(map[track as usize])
    }

    pub fn disc_title(&self) -> String {
        self.track_title(0)
    }

    fn set_timestamp(&mut self, track: u8, stamp: Timestamp) -> Result<()> {
        let map: [u8; 256] = self.times[TIMEMAP_OFFSET..TIMEMAP_OFFSET + 256].try_into().unwrap();
        let slot = if map[track as usize] != 0 {
            map[track as usize]
        } else {
            let used = used_slots(&map);
            next_free_slot(&used)?
        };
        let off = TIMELIST_OFFSET + slot as usize * TIMESTAMP_SIZE;
        self.times[off] = stamp.year;
        self.times[off + 1] = stamp.month;
        self.times[off + 2] = stamp.day;
        self.times[off + 3] = stamp.hour;
        self.times[off + 4] = stamp.minute;
        self.times[off + 5] = stamp.second;
        self.times[off + 6..off + 8].copy_from_slice(&stamp.signature.to_be_bytes());
        self.times[TIMEMAP_OFFSET + track as usize] = slot;
        Ok(())
    }

    pub fn track_count(&self) -> u8 {
        self.tracks[NTRACKS_OFFSET]
    }

    pub fn track_info(&self, track: u8) -> Option<Fragment> {
        let slot = self.trackmap()[track as usize];
        if slot == 0 {
            None
        } else {
            Some(self.fragment_at(slot))
        }
    }

    pub fn disc_info(&self) -> (String, u8, u16) {
        let sign = u16::from_be_bytes([self.tracks[SIGN_OFFSET], self.tracks[SIGN_OFFSET + 1]]);
        (self.disc_title(), self.track_count(), sign)
    }
}

impl Default for TocEditor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_dao(editor: &mut TocEditor) {
        editor.set_trackmap_entry(1, 1);
        editor.set_fragment(
            1,
            Fragment {
                start: Csg::from_linear(1000),
                end: Csg::from_linear(1500),
                mode: TrackMode::default(),
                link: None,
            },
        );
    }

    #[test]
    fn split_boundaries_match_expected_scenario() {
        let mut editor = TocEditor::new();
        seed_dao(&mut editor);
        editor.import(1, 5800.0, &[]).unwrap();

        let stamp = Timestamp::default();
        editor.add_track(1, 3, 2000.0, "One", stamp).unwrap();
        editor.add_track(2, 3, 2000.0, "Two", stamp).unwrap();
        editor.add_track(3, 3, 1800.0, "Three", stamp).unwrap();

        let f1 = editor.track_info(1).unwrap();
        let f2 = editor.track_info(2).unwrap();
        let f3 = editor.track_info(3).unwrap();

        assert_eq!((f1.start.to_linear(), f1.end.to_linear()), (1000, 1172));
        assert_eq!((f2.start.to_linear(), f2.end.to_linear()), (1173, 1345));
        assert_eq!((f3.start.to_linear(), f3.end.to_linear()), (1346, 1500));
    }

    #[test]
    fn title_chain_roundtrip() {
        let mut editor = TocEditor::new();
        editor.set_track_title(2, "A fourteen char").unwrap();
        assert_eq!(editor.track_title(2), "A fourteen char");
    }

    #[test]
    fn disc_title_uses_head_cell_zero() {
        let mut editor = TocEditor::new();
        editor.set_disc_title("My Disc").unwrap();
        assert_eq!(editor.disc_title(), "My Disc");
    }
}
