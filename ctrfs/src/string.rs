use core::fmt;

use std::ffi::OsStr;

use snafu::{OptionExt, Snafu};

use crate::align_up;
use crate::layer3::NAME_ALIGN;

#[derive(Debug, Snafu)]
pub enum NameError {
    #[snafu(display("Entry name is not valid Unicode"))]
    NotUnicode,
}

/// A directory or file name as it is stored in a RomFS image: UTF-16LE
/// code units with no BOM and no terminator. The root directory's name is
/// empty.
#[derive(Clone, PartialEq, Eq)]
pub struct RomfsName {
    units: Vec<u16>,
}

impl RomfsName {
    #[must_use]
    pub fn empty() -> Self {
        Self { units: Vec::new() }
    }
    #[must_use]
    pub fn code_units(&self) -> &[u16] {
        &self.units
    }
    /// Size of the name in bytes, the value stored in an entry's
    /// `name_size` field.
    #[must_use]
    pub fn byte_len(&self) -> u32 {
        (self.units.len() * 2) as u32
    }
    /// Byte size the name occupies in a metadata table, zero-padded.
    #[must_use]
    pub fn padded_len(&self) -> u32 {
        align_up(self.byte_len(), NAME_ALIGN)
    }
    /// Appends the name as little-endian bytes plus padding.
    pub fn write_padded(&self, out: &mut Vec<u8>) {
        for unit in &self.units {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        for _ in self.byte_len()..self.padded_len() {
            out.push(0);
        }
    }
    /// Fallback conversion for host names that are not valid Unicode.
    /// The on-disk name degrades to the replacement character; the host
    /// path keeps the original bytes.
    #[must_use]
    pub fn from_os_lossy(name: &OsStr) -> Self {
        Self::from(name.to_string_lossy().as_ref())
    }
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(&self.units)
    }
}

impl From<&str> for RomfsName {
    fn from(value: &str) -> Self {
        Self {
            units: value.encode_utf16().collect(),
        }
    }
}

impl TryFrom<&OsStr> for RomfsName {
    type Error = NameError;

    fn try_from(value: &OsStr) -> Result<Self, Self::Error> {
        let utf8 = value.to_str().context(NotUnicodeSnafu)?;
        Ok(utf8.into())
    }
}

impl fmt::Debug for RomfsName {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_fmt(format_args!("\"{}\"", self.to_string_lossy()))
    }
}
