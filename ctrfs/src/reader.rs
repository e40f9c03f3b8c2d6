//! Byte-range access to a RomFS image.
//!
//! A [`RomfsReader`] serves `read(offset, buf)` against one of three
//! backings: a Level-3 image built from a host directory (metadata from
//! the blob, file data read on demand from the host), a plain RomFS
//! region inside a container file, or an AES-CTR encrypted region.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::crypto::aes128_ctr::{Aes128CtrDec, KeyIvInit, StreamCipher, StreamCipherSeek};
use crate::layer3::Level3;
use crate::CtrfsResult;

pub struct RomfsReader {
    backing: Backing,
    data_size: u64,
}

enum Backing {
    Tree {
        blob: Vec<u8>,
        data_offset: u64,
        file_map: BTreeMap<u64, PathBuf>,
    },
    Image {
        file: File,
        file_offset: u64,
    },
    EncryptedImage {
        file: File,
        file_offset: u64,
        crypto_offset: u64,
        key: [u8; 16],
        ctr: [u8; 16],
    },
}

impl RomfsReader {
    /// Builds a Level-3 image from a host directory and wraps it.
    pub fn from_dir(path: impl AsRef<Path>) -> CtrfsResult<Self> {
        Ok(Self::from_level3(Level3::build(path)?))
    }

    pub fn from_level3(level3: Level3) -> Self {
        let data_size = level3.image_size();
        let (blob, data_offset, file_map) = level3.into_parts();
        Self {
            backing: Backing::Tree {
                blob,
                data_offset: u64::from(data_offset),
                file_map,
            },
            data_size,
        }
    }

    /// Wraps a plaintext RomFS region starting at `file_offset` inside
    /// `file`.
    pub fn from_image(file: File, file_offset: u64, data_size: u64) -> Self {
        Self {
            backing: Backing::Image { file, file_offset },
            data_size,
        }
    }

    /// Wraps an AES-128-CTR encrypted RomFS region. The keystream is
    /// seeked to `crypto_offset + offset` for every read.
    pub fn from_encrypted_image(
        file: File,
        file_offset: u64,
        data_size: u64,
        key: [u8; 16],
        ctr: [u8; 16],
        crypto_offset: u64,
    ) -> Self {
        Self {
            backing: Backing::EncryptedImage {
                file,
                file_offset,
                crypto_offset,
                key,
                ctr,
            },
            data_size,
        }
    }

    /// Size of the virtual image in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.data_size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data_size == 0
    }

    /// Reads up to `buf.len()` bytes at `offset` into `buf`, returning
    /// the number of bytes read. Failures to reach the underlying file
    /// yield a short (possibly zero) count rather than an error.
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        match &mut self.backing {
            Backing::Tree {
                blob,
                data_offset,
                file_map,
            } => read_tree(blob, *data_offset, file_map, self.data_size, offset, buf),
            Backing::Image { file, file_offset } => {
                read_image(file, *file_offset, self.data_size, offset, buf, None).unwrap_or(0)
            }
            Backing::EncryptedImage {
                file,
                file_offset,
                crypto_offset,
                key,
                ctr,
            } => read_image(
                file,
                *file_offset,
                self.data_size,
                offset,
                buf,
                Some((*crypto_offset, key, ctr)),
            )
            .unwrap_or(0),
        }
    }
}

fn read_tree(
    blob: &[u8],
    data_offset: u64,
    file_map: &BTreeMap<u64, PathBuf>,
    data_size: u64,
    offset: u64,
    buf: &mut [u8],
) -> usize {
    let length = buf.len() as u64;
    if offset.checked_add(length).map_or(true, |end| end > data_size) {
        return 0;
    }

    if offset < data_offset {
        // a single read never crosses from metadata into file data
        if offset + length > data_offset {
            return 0;
        }
        let start = offset as usize;
        buf.copy_from_slice(&blob[start..start + buf.len()]);
        return buf.len();
    }

    let Some((&file_start, path)) = file_map.range(..=offset).next_back() else {
        return 0;
    };
    read_host_file(path, offset - file_start, buf).unwrap_or(0)
}

fn read_host_file(path: &Path, skip: u64, buf: &mut [u8]) -> CtrfsResult<usize> {
    let mut file = File::open(path)?;
    if skip > 0 {
        file.seek(SeekFrom::Start(skip))?;
    }
    Ok(read_up_to(&mut file, buf)?)
}

fn read_image(
    file: &mut File,
    file_offset: u64,
    data_size: u64,
    offset: u64,
    buf: &mut [u8],
    crypto: Option<(u64, &[u8; 16], &[u8; 16])>,
) -> CtrfsResult<usize> {
    if offset >= data_size {
        return Ok(0);
    }
    let want = (buf.len() as u64).min(data_size - offset) as usize;
    file.seek(SeekFrom::Start(file_offset + offset))?;
    let read = read_up_to(file, &mut buf[..want])?;

    if let Some((crypto_offset, key, ctr)) = crypto {
        let mut cipher = Aes128CtrDec::new(key.into(), ctr.into());
        cipher.try_seek(crypto_offset + offset)?;
        cipher.try_apply_keystream(&mut buf[..read])?;
    }
    Ok(read)
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(read) => total += read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(total)
}
