//! Combine policies: rules for merging redistributed values into the
//! destination buffer.

use crate::vector_error::DistVectorError;

/// Per-operation combine mode selected by callers.
///
/// Only `Insert` (replace) and `Add` (accumulate) are implemented; `Min` and
/// `Max` exist on the surface for source compatibility and fail eagerly with
/// [`DistVectorError::NotImplemented`] before any communication happens.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CombineMode {
    /// Overwrite destination values covered by the plan.
    Insert,
    /// Sum incoming values into the existing destination values.
    Add,
    Min,
    Max,
}

impl CombineMode {
    /// Gate collective operations on a supported mode. Checked before the
    /// first message is posted so an unsupported mode leaves the destination
    /// untouched on every participant.
    pub fn ensure_supported(self) -> Result<(), DistVectorError> {
        match self {
            CombineMode::Insert | CombineMode::Add => Ok(()),
            CombineMode::Min => Err(DistVectorError::NotImplemented("combine mode Min")),
            CombineMode::Max => Err(DistVectorError::NotImplemented("combine mode Max")),
        }
    }
}

/// What to do when a destination index has no owner in the source partition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MissingPolicy {
    /// Plan construction fails with [`DistVectorError::UnownedIndex`].
    Error,
    /// Uncovered destination slots are zeroed on `Insert` (and untouched on
    /// `Add`). Must be requested explicitly.
    ZeroFill,
}

/// *Combine* encapsulates the fuse rule for one incoming value.
pub trait Combine<V>: Sized {
    /// Merge an incoming value into the local value.
    fn fuse(local: &mut V, incoming: V);
}

/// Replace-with-incoming (the `Insert` rule).
#[derive(Copy, Clone)]
pub struct InsertCombine;

impl<V> Combine<V> for InsertCombine {
    #[inline]
    fn fuse(local: &mut V, incoming: V) {
        *local = incoming;
    }
}

/// Additive fuse (the `Add` rule).
#[derive(Copy, Clone)]
pub struct AddCombine;

impl<V> Combine<V> for AddCombine
where
    V: std::ops::AddAssign + Copy,
{
    #[inline]
    fn fuse(local: &mut V, incoming: V) {
        *local += incoming;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_overwrites_add_accumulates() {
        let mut v = 2.0f64;
        InsertCombine::fuse(&mut v, 5.0);
        assert_eq!(v, 5.0);
        AddCombine::fuse(&mut v, 1.5);
        assert_eq!(v, 6.5);
    }

    #[test]
    fn unsupported_modes_fail() {
        assert!(CombineMode::Insert.ensure_supported().is_ok());
        assert!(CombineMode::Add.ensure_supported().is_ok());
        assert!(matches!(
            CombineMode::Min.ensure_supported(),
            Err(DistVectorError::NotImplemented(_))
        ));
        assert!(matches!(
            CombineMode::Max.ensure_supported(),
            Err(DistVectorError::NotImplemented(_))
        ));
    }
}
