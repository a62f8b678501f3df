//! wsauth Base Crate
//!
//! This crate contains the wire schema and the pure building blocks of the
//! wsauth challenge-response handshake: decoding a client identifier into a
//! P-256 public key, generating challenges, and verifying signed responses.
//! It does not contain any transport or server implementation.

pub mod api;
pub mod challenge;
pub mod identity;
pub mod verify;
