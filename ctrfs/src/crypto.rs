pub mod aes128_ctr {
    pub use ctr::cipher::KeyIvInit;
    pub use ctr::cipher::StreamCipher;
    pub use ctr::cipher::StreamCipherSeek;
    pub type Aes128CtrDec = ctr::Ctr128BE<aes::Aes128>;
}
