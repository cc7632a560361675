//! `DistVector`: a numeric vector sharded across participants by an
//! [`IndexLayout`].
//!
//! Every cross-vector operation first compares partition layouts; on mismatch
//! it derives (or reuses a cached) redistribution plan and moves values before
//! the elementwise step. The cache is owned by the vector and keyed by the
//! `(source, destination)` layout identities, so replacing either layout
//! invalidates it without explicit bookkeeping.

pub mod arithmetic;
pub mod import;
pub mod scalar;

pub use import::{CommPattern, ImportPlan, SparseImport};
pub use scalar::Scalar;

use std::io::Write;
use std::sync::Arc;

use log::debug;

use crate::algs::communicator::{CommTag, Communicator};
use crate::layout::{IndexLayout, LayoutId};
use crate::redistribute::combine::MissingPolicy;
use crate::redistribute::plan::RedistributionPlan;
use crate::vector_error::DistVectorError;

// Collective tag bases. Each collective uses its base plus small stage
// offsets; FIFO ordering per (peer, tag) keeps back-to-back calls apart.
pub(crate) const TAG_PLAN_BUILD: CommTag = CommTag::new(0x5A00);
pub(crate) const TAG_PLAN_APPLY: CommTag = CommTag::new(0x5A10);
pub(crate) const TAG_REDUCE: CommTag = CommTag::new(0x5A20);
pub(crate) const TAG_IMPORT_BUILD: CommTag = CommTag::new(0x5A30);
pub(crate) const TAG_IMPORT_APPLY: CommTag = CommTag::new(0x5A40);

/// Memoized redistribution plan, keyed by `(source, destination)` layout
/// identities.
#[derive(Debug, Clone)]
pub(crate) struct CachedPlan {
    pub(crate) key: (LayoutId, LayoutId),
    pub(crate) plan: Arc<RedistributionPlan>,
}

/// Layout of a textual dump.
#[derive(Copy, Clone, Debug)]
pub struct PrintOptions {
    /// Digits after the decimal point.
    pub precision: usize,
    /// Scientific (`1.0e0`) instead of fixed notation.
    pub scientific: bool,
    /// Space-separated single line instead of one value per line.
    pub across: bool,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self {
            precision: 6,
            scientific: false,
            across: true,
        }
    }
}

/// A distributed vector: one contiguous local buffer per participant, laid
/// out by an immutable [`IndexLayout`].
#[derive(Debug, Clone)]
pub struct DistVector<V: Scalar, C: Communicator> {
    layout: Arc<IndexLayout>,
    values: Vec<V>,
    comm: Arc<C>,
    plan_cache: Option<CachedPlan>,
    import_cache: Option<import::CachedImportPlan>,
}

impl<V: Scalar, C: Communicator> DistVector<V, C> {
    /// Create a zero-initialized vector over `layout`.
    pub fn new(layout: Arc<IndexLayout>, comm: Arc<C>) -> Self {
        let values = vec![V::zero(); layout.local_len()];
        Self {
            layout,
            values,
            comm,
            plan_cache: None,
            import_cache: None,
        }
    }

    #[inline]
    pub fn layout(&self) -> &Arc<IndexLayout> {
        &self.layout
    }

    #[inline]
    pub fn comm(&self) -> &Arc<C> {
        &self.comm
    }

    /// Global size of the vector.
    #[inline]
    pub fn global_len(&self) -> u64 {
        self.layout.global_len()
    }

    /// Number of locally owned entries.
    #[inline]
    pub fn local_len(&self) -> usize {
        self.values.len()
    }

    /// Read view of the local buffer, in layout order.
    #[inline]
    pub fn local_values(&self) -> &[V] {
        &self.values
    }

    /// Write view of the local buffer, in layout order.
    #[inline]
    pub fn local_values_mut(&mut self) -> &mut [V] {
        &mut self.values
    }

    /// Replace the partition layout.
    ///
    /// If `layout` equals the current partition the storage is kept and, unless
    /// `omit_zero_fill` is set, zeroed in place. Otherwise storage is replaced
    /// wholesale with zeros and every cached plan is dropped.
    pub fn reinit(&mut self, layout: Arc<IndexLayout>, omit_zero_fill: bool) {
        if self.layout.same_layout_as(&layout) {
            if !omit_zero_fill {
                self.values.fill(V::zero());
            }
            return;
        }
        self.values = vec![V::zero(); layout.local_len()];
        self.layout = layout;
        self.invalidate_caches();
    }

    /// Set every local entry to `s`. Fails on non-finite `s`.
    pub fn fill(&mut self, s: V) -> Result<(), DistVectorError> {
        if !s.is_finite() {
            return Err(DistVectorError::NonFiniteScalar);
        }
        self.values.fill(s);
        Ok(())
    }

    /// Set every local entry to zero.
    pub fn set_zero(&mut self) {
        self.values.fill(V::zero());
    }

    /// Values at the given global indices, which must be locally owned.
    ///
    /// Fails with [`DistVectorError::IndexOutOfRange`] for an index outside
    /// the global range and [`DistVectorError::NotLocallyOwned`] for a valid
    /// index owned by another participant; no communication is performed.
    pub fn extract(&self, indices: &[u64]) -> Result<Vec<V>, DistVectorError> {
        let mut out = Vec::with_capacity(indices.len());
        for &g in indices {
            if g >= self.global_len() {
                return Err(DistVectorError::IndexOutOfRange {
                    index: g,
                    global_len: self.global_len(),
                });
            }
            let off = self
                .layout
                .local_offset_of(g)
                .ok_or(DistVectorError::NotLocallyOwned(g))?;
            out.push(self.values[off]);
        }
        Ok(out)
    }

    /// Write the local values to `out`, across (space-separated) or down
    /// (one per line), in fixed or scientific notation.
    pub fn print<W: Write>(
        &self,
        out: &mut W,
        opts: &PrintOptions,
    ) -> Result<(), DistVectorError> {
        let io_err = |e: std::io::Error| DistVectorError::Io(e.to_string());
        for (i, v) in self.values.iter().enumerate() {
            let sep = if !opts.across {
                "\n"
            } else if i + 1 == self.values.len() {
                ""
            } else {
                " "
            };
            if opts.scientific {
                write!(out, "{v:.prec$e}{sep}", prec = opts.precision).map_err(io_err)?;
            } else {
                write!(out, "{v:.prec$}{sep}", prec = opts.precision).map_err(io_err)?;
            }
        }
        writeln!(out).map_err(io_err)?;
        Ok(())
    }

    /// Estimated bytes held: the struct itself, the local buffer, and the
    /// per-entry and per-range index overhead of the layout.
    pub fn memory_consumption(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.values.len() * (std::mem::size_of::<V>() + std::mem::size_of::<u64>())
            + self.layout.ranges().len() * std::mem::size_of::<(u64, u64)>()
    }

    /// True once a redistribution plan has been cached; the same-layout fast
    /// paths never populate the cache.
    pub fn has_cached_plan(&self) -> bool {
        self.plan_cache.is_some()
    }

    pub(crate) fn invalidate_caches(&mut self) {
        self.plan_cache = None;
        self.import_cache = None;
    }

    /// Build-or-reuse the plan routing `src` into this vector's layout.
    /// Collective on a cache miss.
    pub(crate) fn plan_from(
        &mut self,
        src: &IndexLayout,
    ) -> Result<Arc<RedistributionPlan>, DistVectorError> {
        let key = (src.id(), self.layout.id());
        if let Some(cached) = &self.plan_cache {
            if cached.key == key {
                debug!("redistribution plan cache hit on rank {}", self.comm.rank());
                return Ok(cached.plan.clone());
            }
        }
        debug!(
            "redistribution plan cache miss on rank {}; rebuilding",
            self.comm.rank()
        );
        let plan = Arc::new(RedistributionPlan::build(
            &self.layout,
            src,
            self.comm.as_ref(),
            TAG_PLAN_BUILD,
            MissingPolicy::Error,
        )?);
        self.plan_cache = Some(CachedPlan {
            key,
            plan: plan.clone(),
        });
        Ok(plan)
    }
}
