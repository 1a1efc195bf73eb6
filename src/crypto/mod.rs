//! Classification-keyed envelope cryptography.
//!
//! A label maps to a canonical domain string ([`domain`]), the domain and
//! key version select a key from the [`keyring`], and [`envelope`] seals
//! payloads under it.

pub mod domain;
pub mod envelope;
pub mod keyring;

pub use domain::{domain_of, DomainCache};
pub use envelope::{access_hint, CryptoError, EncryptedEntity, EncryptedEnvelope, EnvelopeCipher};
pub use keyring::{InMemoryKeyring, KeyMaterial, Keyring, KeyringError};
