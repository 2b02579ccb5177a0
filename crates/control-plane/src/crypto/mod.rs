//! Cryptography for credential and keychain data at rest.

mod encryption;

pub use encryption::Encryptor;
