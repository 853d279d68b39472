//! Cryptographic utilities for the peer layer
//!
//! This module provides SHA-256 hashing and the `Hash256` digest type.

pub mod hash;

pub use hash::{checksum, double_sha256, double_sha256_hex, sha256, Hash256};
