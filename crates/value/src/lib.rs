//! Scalar field values for InfiniSQL tables and indices
//!
//! This crate provides:
//! - The `Value` type covering every indexable column type
//! - `FloatKey`, a totally ordered wrapper so floats can key ordered maps
//! - A row codec turning a field vector into the opaque payload partitions store

pub mod codec;
pub mod types;

pub use codec::{CborCodec, CodecError, RowCodec};
pub use types::{FloatKey, Value, ValueType};
