//! Kernel-wide error type.
//!
//! Each subsystem has its own error enum; [`KernelError`] wraps them for
//! callers that go through [`crate::kernel::SecurityKernel`].

use thiserror::Error;

use crate::audit::chain::AuditError;
use crate::crypto::envelope::CryptoError;
use crate::crypto::keyring::KeyringError;
use crate::flow::FlowViolation;
use crate::label::LabelError;
use crate::mac::AccessDenied;
use crate::signing::rotation::RotationError;
use crate::signing::signer::SignerError;
use crate::store::StoreError;

/// Any error the kernel surfaces.
#[derive(Debug, Error)]
pub enum KernelError {
    /// MAC denial.
    #[error(transparent)]
    AccessDenied(#[from] AccessDenied),
    /// Derivation refused.
    #[error(transparent)]
    FlowViolation(#[from] FlowViolation),
    /// Envelope encryption or decryption failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// Audit chain failure.
    #[error(transparent)]
    Audit(#[from] AuditError),
    /// Durable store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Keyring failure.
    #[error(transparent)]
    Keyring(#[from] KeyringError),
    /// Key rotation failure.
    #[error(transparent)]
    Rotation(#[from] RotationError),
    /// Signing failure.
    #[error(transparent)]
    Signer(#[from] SignerError),
    /// Invalid lattice or label.
    #[error(transparent)]
    Label(#[from] LabelError),
}
