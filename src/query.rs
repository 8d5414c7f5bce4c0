/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Format-string driven serializer/scanner for NetMD command and response
//! byte streams.
//!
//! A format string is whitespace-insensitive and made of two kinds of
//! tokens: two-digit hex literals, copied verbatim into (or matched
//! against, when scanning) the stream, and `%`-escaped directives:
//!
//! - `%b` / `%w` / `%d` / `%q` - byte / word / dword / qword scalar
//! - `%*` - the remainder of the byte vector (format) or all remaining
//!   response bytes (scan)
//! - `%?` - scan only: skip one byte without capturing it
//! - `%<` / `%>` - select little-endian (default) / big-endian for the
//!   *next* scalar directive only; reverts to little-endian afterwards

use crate::error::{Error, Result};

/// A single query parameter, tagged by width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Byte(u8),
    Word(u16),
    Dword(u32),
    Qword(u64),
    Bytes(Vec<u8>),
}

impl From<u8> for Param {
    fn from(v: u8) -> Self {
        Param::Byte(v)
    }
}
impl From<u16> for Param {
    fn from(v: u16) -> Self {
        Param::Word(v)
    }
}
impl From<u32> for Param {
    fn from(v: u32) -> Self {
        Param::Dword(v)
    }
}
impl From<u64> for Param {
    fn from(v: u64) -> Self {
        Param::Qword(v)
    }
}
impl From<Vec<u8>> for Param {
    fn from(v: Vec<u8>) -> Self {
        Param::Bytes(v)
    }
}

/// Serializes `params` into a byte stream according to `format`.
pub fn format(fmt: &str, params: &[Param]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut argno = 0usize;
    let mut big_endian = false;
    let mut chars = fmt.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '%' {
            let mut dir = chars
                .next()
                .ok_or_else(|| Error::invalid_param("dangling '%' in query format"))?;
            if dir == '<' || dir == '>' {
                big_endian = dir == '>';
                dir = chars
                    .next()
                    .ok_or_else(|| Error::invalid_param("endianness marker with no following directive"))?;
            }
            match dir.to_ascii_lowercase() {
                'b' => {
                    let p = next_param(params, &mut argno)?;
                    match p {
                        Param::Byte(v) => out.push(*v),
                        _ => return Err(Error::invalid_param("expected byte parameter")),
                    }
                    big_endian = false;
                }
                'w' => {
                    let p = next_param(params, &mut argno)?;
                    match p {
                        Param::Word(v) => push_bytes(&mut out, &v.to_le_bytes(), &v.to_be_bytes(), big_endian),
                        _ => return Err(Error::invalid_param("expected word parameter")),
                    }
                    big_endian = false;
                }
                'd' => {
                    let p = next_param(params, &mut argno)?;
                    match p {
                        Param::Dword(v) => push_bytes(&mut out, &v.to_le_bytes(), &v.to_be_bytes(), big_endian),
                        _ => return Err(Error::invalid_param("expected dword parameter")),
                    }
                    big_endian = false;
                }
                'q' => {
                    let p = next_param(params, &mut argno)?;
                    match p {
                        Param::Qword(v) => push_bytes(&mut out, &v.to_le_bytes(), &v.to_be_bytes(), big_endian),
                        _ => return Err(Error::invalid_param("expected qword parameter")),
                    }
                    big_endian = false;
                }
                '*' => {
                    let p = next_param(params, &mut argno)?;
                    match p {
                        Param::Bytes(v) => out.extend_from_slice(v),
                        _ => return Err(Error::invalid_param("expected byte-vector parameter")),
                    }
                    big_endian = false;
                }
                other => {
                    return Err(Error::invalid_param(format!("unsupported format directive '{other}'")))
                }
            }
        } else if c.is_whitespace() {
            continue;
        } else {
            let mut tok = String::new();
            tok.push(c);
            tok.push(
                chars
                    .next()
                    .ok_or_else(|| Error::invalid_param("truncated hex literal in query format"))?,
            );
            let byte = u8::from_str_radix(&tok, 16)
                .map_err(|_| Error::invalid_param(format!("bad hex literal '{tok}'")))?;
            out.push(byte);
        }
    }

    Ok(out)
}

fn next_param<'a>(params: &'a [Param], argno: &mut usize) -> Result<&'a Param> {
    let p = params
        .get(*argno)
        .ok_or_else(|| Error::invalid_param("not enough parameters for query format"))?;
    *argno += 1;
    Ok(p)
}

fn push_bytes(out: &mut Vec<u8>, le: &[u8], be: &[u8], big_endian: bool) {
    out.extend_from_slice(if big_endian { be } else { le });
}

/// A captured scan result, in order of appearance in the capture format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Captured {
    Byte(u8),
    Word(u16),
    Dword(u32),
    Qword(u64),
    Bytes(Vec<u8>),
}

/// Parses `data` according to `fmt`, matching hex literals byte-for-byte
/// and collecting `%b`/`%w`/`%d`/`%q`/`%*` directives into the returned
/// vector in order. `%?` consumes and discards one byte.
pub fn scan(fmt: &str, data: &[u8]) -> Result<Vec<Captured>> {
    let mut out = Vec::new();
    let mut idx = 0usize;
    let mut big_endian = false;
    let mut chars = fmt.chars().peekable();

    macro_rules! need {
        ($n:expr) => {
            if idx + $n > data.len() {
                return Err(Error::cmd_invalid("response shorter than scan format expects"));
            }
        };
    }

    while let Some(c) = chars.next() {
        if c == '%' {
            let mut dir = chars
                .next()
                .ok_or_else(|| Error::invalid_param("dangling '%' in scan format"))?;
            if dir == '<' || dir == '>' {
                big_endian = dir == '>';
                dir = chars
                    .next()
                    .ok_or_else(|| Error::invalid_param("endianness marker with no following directive"))?;
            }
            match dir.to_ascii_lowercase() {
                '?' => {
                    need!(1);
                    idx += 1;
                    big_endian = false;
                }
                'b' => {
                    need!(1);
                    out.push(Captured::Byte(data[idx]));
                    idx += 1;
                    big_endian = false;
                }
                'w' => {
                    need!(2);
                    let bytes: [u8; 2] = data[idx..idx + 2].try_into().unwrap();
                    let v = if big_endian { u16::from_be_bytes(bytes) } else { u16::from_le_bytes(bytes) };
                    out.push(Captured::Word(v));
                    idx += 2;
                    big_endian = false;
                }
                'd' => {
                    need!(4);
                    let bytes: [u8; 4] = data[idx..idx + 4].try_into().unwrap();
                    let v = if big_endian { u32::from_be_bytes(bytes) } else { u32::from_le_bytes(bytes) };
                    out.push(Captured::Dword(v));
                    idx += 4;
                    big_endian = false;
                }
                'q' => {
                    need!(8);
                    let bytes: [u8; 8] = data[idx..idx + 8].try_into().unwrap();
                    let v = if big_endian { u64::from_be_bytes(bytes) } else { u64::from_le_bytes(bytes) };
                    out.push(Captured::Qword(v));
                    idx += 8;
                    big_endian = false;
                }
                '*' => {
                    out.push(Captured::Bytes(data[idx..].to_vec()));
                    idx = data.len();
                    big_endian = false;
                }
                other => {
                    return Err(Error::invalid_param(format!("unsupported scan directive '{other}'")))
                }
            }
        } else if c.is_whitespace() {
            continue;
        } else {
            let mut tok = String::new();
            tok.push(c);
            tok.push(
                chars
                    .next()
                    .ok_or_else(|| Error::invalid_param("truncated hex literal in scan format"))?,
            );
            let expected = u8::from_str_radix(&tok, 16)
                .map_err(|_| Error::invalid_param(format!("bad hex literal '{tok}'")))?;
            need!(1);
            if data[idx] != expected {
                return Err(Error::cmd_invalid(format!(
                    "response mismatch at byte {idx}: got {:02x}, expected {:02x}",
                    data[idx], expected
                )));
            }
            idx += 1;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_mixes_literals_and_directives() {
        let out = format("00 1822 ff %<w", &[Param::Word(0x1234)]).unwrap();
        assert_eq!(out, vec![0x00, 0x18, 0x22, 0xff, 0x34, 0x12]);
    }

    #[test]
    fn format_big_endian_is_not_sticky() {
        let out = format("%>w %w", &[Param::Word(0x0102), Param::Word(0x0304)]).unwrap();
        assert_eq!(out, vec![0x01, 0x02, 0x04, 0x03]);
    }

    #[test]
    fn format_byte_vector() {
        let out = format("00 %*", &[Param::Bytes(vec![1, 2, 3])]).unwrap();
        assert_eq!(out, vec![0x00, 1, 2, 3]);
    }

    #[test]
    fn scan_matches_literal_and_captures() {
        let data = [0x00, 0x18, 0x21, 0x00, 1, 2, 3, 4];
        let got = scan("00 18 21 %? %d", &data).unwrap();
        assert_eq!(got, vec![Captured::Dword(u32::from_le_bytes([1, 2, 3, 4]))]);
    }

    #[test]
    fn scan_mismatch_is_error() {
        let data = [0x01, 0x02];
        assert!(scan("00 02", &data).is_err());
    }

    #[test]
    fn roundtrip_format_then_scan() {
        let bytes = format("%w %d %*", &[Param::Word(0xabcd), Param::Dword(0x11223344), Param::Bytes(vec![9, 9])])
            .unwrap();
        let got = scan("%w %d %*", &bytes).unwrap();
        assert_eq!(
            got,
            vec![
                Captured::Word(0xabcd),
                Captured::Dword(0x11223344),
                Captured::Bytes(vec![9, 9]),
            ]
        );
    }
}
