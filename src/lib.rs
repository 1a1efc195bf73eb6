//! seckernel: a multi-level security kernel.
//!
//! Bell-LaPadula mandatory access control over a configurable
//! classification lattice, envelope encryption keyed by label domain,
//! information-flow checks for derived data, Ed25519 non-repudiation with
//! envelope key rotation, and a signed, hash-linked forensic audit chain.
//!
//! See `DESIGN.md` for the component map.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod error;
pub mod label;
pub mod logging;
pub mod policy;
pub mod store;

pub mod context;
pub mod crypto;
pub mod flow;
pub mod mac;

pub mod audit;
pub mod signing;

pub mod kernel;

pub use error::KernelError;
pub use kernel::SecurityKernel;
pub use label::{Entity, Lattice, SecurityLabel};
