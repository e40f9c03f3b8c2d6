pub mod crypto;
pub mod layer3;
pub mod reader;
pub mod string;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CtrfsError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("Offset computation overflowed its field")]
    OffsetOverflow,
    #[error("Failed to stream-encrypt/decrypt data")]
    StreamCrypt(#[from] ctr::cipher::StreamCipherError),
}

pub type CtrfsResult<T> = std::result::Result<T, CtrfsError>;

pub mod prelude {
    pub use crate::layer3::Level3;
    pub use crate::reader::RomfsReader;
}

pub(crate) const fn align_up(val: u32, alignment: u32) -> u32 {
    if val % alignment != 0 {
        val + (alignment - (val % alignment))
    } else {
        val
    }
}

pub(crate) const fn align_up64(val: i64, alignment: i64) -> i64 {
    if val % alignment != 0 {
        val + (alignment - (val % alignment))
    } else {
        val
    }
}
