//! Hash computation and object identity for the content-addressed object
//! store.
//!
//! This crate provides the core `ObjectId` type, hash computation, hex
//! encoding/decoding, and specialized OID collections used throughout the
//! store.

mod error;
pub mod hex;
mod algorithm;
mod oid;
pub mod hasher;
pub mod collections;
pub mod fanout;

pub use algorithm::HashAlgorithm;
pub use error::HashError;
pub use oid::ObjectId;
