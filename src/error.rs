/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Error conditions surfaced by this crate.
///
/// Variants mirror the status space a NetMD recorder itself can report
/// (not ready, command rejected, ...) plus the usual transport failures.
#[derive(Debug, Error)]
pub enum Error {
    #[error("usb error: {0}")]
    Usb(String),

    #[error("device not ready")]
    NotReady,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("command failed: {0}")]
    CmdFailed(String),

    #[error("command rejected/invalid: {0}")]
    CmdInvalid(String),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("operation not supported on this device: {0}")]
    NotSupported(String),

    #[error("{0}")]
    Other(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn usb(msg: impl Into<String>) -> Self {
        Error::Usb(msg.into())
    }

    pub fn timeout() -> Self {
        Error::Timeout
    }

    pub fn cmd_failed(msg: impl Into<String>) -> Self {
        Error::CmdFailed(msg.into())
    }

    pub fn cmd_invalid(msg: impl Into<String>) -> Self {
        Error::CmdInvalid(msg.into())
    }

    pub fn invalid_param(msg: impl Into<String>) -> Self {
        Error::InvalidParam(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Error::NotSupported(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }
}

#[cfg(feature = "nusb")]
impl From<nusb::Error> for Error {
    fn from(e: nusb::Error) -> Self {
        Error::usb(e.to_string())
    }
}

#[cfg(feature = "libusb")]
impl From<rusb::Error> for Error {
    fn from(e: rusb::Error) -> Self {
        Error::usb(e.to_string())
    }
}
