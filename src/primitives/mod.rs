//! Key derivation and address encoding primitives used by the derivation branches.

pub mod address;
pub mod bip32;
