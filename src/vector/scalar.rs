//! Scalar bound for distributed-vector entries.

use std::fmt;
use std::ops::{AddAssign, MulAssign, SubAssign};

/// Floating-point entry type of a [`crate::vector::DistVector`].
///
/// `Float` supplies the numeric surface (zero, abs, sqrt, finiteness checks);
/// `Pod` lets local buffers travel as raw bytes; the formatting traits back
/// the fixed/scientific textual dump.
pub trait Scalar:
    num_traits::Float
    + AddAssign
    + SubAssign
    + MulAssign
    + bytemuck::Pod
    + Send
    + Sync
    + fmt::Debug
    + fmt::Display
    + fmt::LowerExp
    + 'static
{
}

impl<T> Scalar for T where
    T: num_traits::Float
        + AddAssign
        + SubAssign
        + MulAssign
        + bytemuck::Pod
        + Send
        + Sync
        + fmt::Debug
        + fmt::Display
        + fmt::LowerExp
        + 'static
{
}
