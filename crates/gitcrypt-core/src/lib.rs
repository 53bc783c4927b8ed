//! gitcrypt-core: configuration and error types shared by every git-crypt crate

pub mod config;
pub mod error;

pub use config::GitCryptConfig;
pub use error::{GitCryptError, GitCryptResult};
