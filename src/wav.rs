/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Recognizes the two kinds of input the upload facade accepts: a
//! canonical RIFF/WAVE PCM container, or a bare pre-encoded ATRAC1 (SP)
//! file with no RIFF magic at all.

use hound::WavReader;
use std::io::Cursor;

use crate::error::{Error, Result};

/// SP sector geometry used by [`restructure_atrac1`].
const ATRAC1_SECTOR_SIZE: usize = 2332;
const ATRAC1_PAD_SIZE: usize = 100;
const ATRAC1_FRAME_SIZE: usize = 212;
const ATRAC1_HEADER_SKIP: usize = 2048;

/// The two shapes of input audio the upload facade understands.
#[derive(Debug, Clone)]
pub enum SourceAudio {
    Pcm { samples: Vec<i16>, channels: u8, sample_rate: u32 },
    Atrac1 { data: Vec<u8> },
}

/// Recognizes `bytes` as a RIFF/WAVE PCM container, falling back to
/// treating it as a bare pre-encoded ATRAC1 stream when no RIFF magic
/// is present.
pub fn sniff(bytes: &[u8]) -> Result<SourceAudio> {
    if bytes.len() >= 4 && &bytes[0..4] == b"RIFF" {
        let mut reader =
            WavReader::new(Cursor::new(bytes)).map_err(|e| Error::invalid_param(format!("bad WAV container: {e}")))?;
        let spec = reader.spec();
        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(Error::invalid_param("only 16-bit PCM WAV input is supported"));
        }
        let samples: std::result::Result<Vec<i16>, _> = reader.samples::<i16>().collect();
        let samples = samples.map_err(|e| Error::invalid_param(format!("malformed PCM data: {e}")))?;
        return Ok(SourceAudio::Pcm { samples, channels: spec.channels as u8, sample_rate: spec.sample_rate });
    }

    if bytes.len() <= ATRAC1_HEADER_SKIP {
        return Err(Error::invalid_param("input shorter than the ATRAC1 header skip"));
    }
    Ok(SourceAudio::Atrac1 { data: bytes[ATRAC1_HEADER_SKIP..].to_vec() })
}

/// Byte-swaps 16-bit PCM samples to big-endian, the wire order NetMD
/// recorders expect for raw stereo/mono uploads.
pub fn pcm_to_wire_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_be_bytes());
    }
    out
}

/// Slices pre-encoded ATRAC1 data into 2,332-byte sectors, padding each
/// with 100 zero bytes, and within every 212-byte frame overwrites the
/// frame's last two bytes with its first two (block-size-mode and BFU
/// count compensation the recorder expects on the wire).
pub fn restructure_atrac1(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + (data.len() / ATRAC1_SECTOR_SIZE + 1) * ATRAC1_PAD_SIZE);

    for sector in data.chunks(ATRAC1_SECTOR_SIZE) {
        let mut sector = sector.to_vec();
        for frame in sector.chunks_mut(ATRAC1_FRAME_SIZE) {
            if frame.len() == ATRAC1_FRAME_SIZE {
                frame[ATRAC1_FRAME_SIZE - 1] = frame[0];
                frame[ATRAC1_FRAME_SIZE - 2] = frame[1];
            }
        }
        out.extend_from_slice(&sector);
        out.extend(std::iter::repeat(0u8).take(ATRAC1_PAD_SIZE));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_atrac1_skips_fixed_header() {
        let mut data = vec![0xaau8; ATRAC1_HEADER_SKIP];
        data.extend_from_slice(&[1, 2, 3, 4]);
        let SourceAudio::Atrac1 { data: body } = sniff(&data).unwrap() else {
            panic!("expected Atrac1 variant");
        };
        assert_eq!(body, vec![1, 2, 3, 4]);
    }

    #[test]
    fn too_short_for_header_skip_is_an_error() {
        assert!(sniff(&[0u8; 10]).is_err());
    }

    #[test]
    fn restructure_pads_each_sector_and_swaps_frame_tail() {
        let mut sector = vec![0u8; ATRAC1_SECTOR_SIZE];
        sector[0] = 0x11;
        sector[1] = 0x22;
        let out = restructure_atrac1(&sector);

        assert_eq!(out.len(), ATRAC1_SECTOR_SIZE + ATRAC1_PAD_SIZE);
        assert_eq!(out[ATRAC1_FRAME_SIZE - 1], 0x11);
        assert_eq!(out[ATRAC1_FRAME_SIZE - 2], 0x22);
        assert!(out[ATRAC1_SECTOR_SIZE..].iter().all(|&b| b == 0));
    }

    #[test]
    fn pcm_to_wire_bytes_is_big_endian() {
        let samples = [0x0102i16, -1];
        let bytes = pcm_to_wire_bytes(&samples);
        assert_eq!(bytes, vec![0x01, 0x02, 0xff, 0xff]);
    }
}
