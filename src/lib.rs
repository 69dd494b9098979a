pub mod client;
pub mod crypt;
pub mod protocol;
pub mod storage;

pub use client::ProxyClient;
pub use crypt::{AesGcmCrypter, CryptoKey, Crypter};
pub use protocol::{ProxyServer, ServerConfig};
pub use storage::{FileStorage, StorageInteractor};
