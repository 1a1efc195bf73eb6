//! Non-repudiation signatures and envelope key lifecycle.

pub mod rotation;
pub mod signer;

pub use rotation::{KeyHistoryEntry, KeyLifecycle, RotationConfig, RotationError, RotationListener};
pub use signer::{ActionPayload, ActionSignature, NonRepudiationSigner, SignerError};
