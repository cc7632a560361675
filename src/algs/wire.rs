//! Fixed, little-endian wire types for the metadata exchange stages.
//!
//! Value payloads travel as raw `Pod` casts of the scalar type; only the
//! layout/ownership metadata uses these explicit records.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use crate::vector_error::DistVectorError;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

pub fn cast_slice_from<T: Pod>(v: &[u8]) -> &[T] {
    bytemuck::cast_slice(v)
}

/// Count of following records in an exchange stage.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u32,
}

impl WireCount {
    pub fn new(n: u32) -> Self {
        Self { n_le: n.to_le() }
    }
    /// Counts travel as 32 bits; lengths that do not fit are an error, not a
    /// silent truncation.
    pub fn try_new(n: usize) -> Result<Self, DistVectorError> {
        u32::try_from(n)
            .map(Self::new)
            .map_err(|_| DistVectorError::WireCountOverflow(n))
    }
    pub fn get(&self) -> usize {
        u32::from_le(self.n_le) as usize
    }
}

/// A half-open global index range `[start, end)` carried on the wire.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireRange {
    pub start_le: u64,
    pub end_le: u64,
}

impl WireRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start_le: start.to_le(),
            end_le: end.to_le(),
        }
    }
    pub fn start(&self) -> u64 {
        u64::from_le(self.start_le)
    }
    pub fn end(&self) -> u64 {
        u64::from_le(self.end_le)
    }
}

/// A single global index carried on the wire (sparse import metadata).
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireIndex {
    pub id_le: u64,
}

impl WireIndex {
    pub fn of(id: u64) -> Self {
        Self { id_le: id.to_le() }
    }
    pub fn get(&self) -> u64 {
        u64::from_le(self.id_le)
    }
}

// Pod/Zeroable ensures no padding contains uninit when cast to bytes.
const_assert_eq!(core::mem::size_of::<WireCount>(), 4);
const_assert_eq!(core::mem::size_of::<WireRange>(), 16);
const_assert_eq!(core::mem::size_of::<WireIndex>(), 8);
