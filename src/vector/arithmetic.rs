//! Elementwise arithmetic, reductions, and the layout-reconciling assignment
//! paths of [`DistVector`].
//!
//! Every binary operation runs the same gate: identical layouts take the
//! purely local fast path; differing layouts of equal global size go through
//! build-or-reuse-plan → redistribute → local apply. Unary operations never
//! redistribute; norms and the all-zero check end in a collective reduction.

use crate::algs::collective::{all_reduce_max, all_reduce_sum};
use crate::algs::communicator::Communicator;
use crate::redistribute::combine::CombineMode;
use crate::vector::{DistVector, Scalar, TAG_PLAN_APPLY, TAG_REDUCE};
use crate::vector_error::DistVectorError;

impl<V: Scalar, C: Communicator> DistVector<V, C> {
    fn check_same_global(&self, other: &Self) -> Result<(), DistVectorError> {
        if self.global_len() != other.global_len() {
            return Err(DistVectorError::DimensionMismatch {
                expected: self.global_len(),
                found: other.global_len(),
            });
        }
        Ok(())
    }

    fn ensure_finite(s: V) -> Result<(), DistVectorError> {
        if s.is_finite() {
            Ok(())
        } else {
            Err(DistVectorError::NonFiniteScalar)
        }
    }

    /// `other`'s values in this vector's layout: `None` when the layouts
    /// already agree, otherwise a redistributed scratch buffer (collective).
    fn localized_values(&mut self, other: &Self) -> Result<Option<Vec<V>>, DistVectorError> {
        if self.layout().same_layout_as(other.layout()) {
            return Ok(None);
        }
        self.check_same_global(other)?;
        let plan = self.plan_from(other.layout())?;
        let comm = self.comm().clone();
        let mut scratch = vec![V::zero(); self.local_len()];
        plan.apply(
            other.local_values(),
            &mut scratch,
            comm.as_ref(),
            TAG_PLAN_APPLY,
            CombineMode::Insert,
        )?;
        Ok(Some(scratch))
    }

    /// Assignment `self = other`.
    ///
    /// Three cases, like the state machine in the module docs: identical
    /// layouts copy locally; equal global size with differing layouts
    /// redistributes under the replace rule; differing global sizes adopt
    /// `other`'s layout and storage wholesale.
    pub fn assign_from(&mut self, other: &Self) -> Result<(), DistVectorError> {
        if self.layout().same_layout_as(other.layout()) {
            self.local_values_mut().copy_from_slice(other.local_values());
            return Ok(());
        }
        if self.global_len() == other.global_len() {
            let plan = self.plan_from(other.layout())?;
            let comm = self.comm.clone();
            // The plan covers every destination slot, so Insert is a full
            // reconstruction of the logical vector in this layout. Writing
            // through the buffer in place keeps its length matching the
            // layout even when the exchange fails partway.
            plan.apply(
                other.local_values(),
                &mut self.values,
                comm.as_ref(),
                TAG_PLAN_APPLY,
                CombineMode::Insert,
            )?;
            return Ok(());
        }
        self.layout = other.layout().clone();
        self.values = other.local_values().to_vec();
        self.invalidate_caches();
        Ok(())
    }

    /// `self += other`, reconciling layouts first if needed.
    pub fn add_assign_vec(&mut self, other: &Self) -> Result<(), DistVectorError> {
        let scratch = self.localized_values(other)?;
        let rhs = scratch.as_deref().unwrap_or(other.local_values());
        for (a, &b) in self.local_values_mut().iter_mut().zip(rhs) {
            *a += b;
        }
        Ok(())
    }

    /// `self -= other`, reconciling layouts first if needed.
    pub fn sub_assign_vec(&mut self, other: &Self) -> Result<(), DistVectorError> {
        let scratch = self.localized_values(other)?;
        let rhs = scratch.as_deref().unwrap_or(other.local_values());
        for (a, &b) in self.local_values_mut().iter_mut().zip(rhs) {
            *a -= b;
        }
        Ok(())
    }

    /// `self += a * v`.
    pub fn axpy(&mut self, a: V, v: &Self) -> Result<(), DistVectorError> {
        Self::ensure_finite(a)?;
        let scratch = self.localized_values(v)?;
        let rhs = scratch.as_deref().unwrap_or(v.local_values());
        for (x, &y) in self.local_values_mut().iter_mut().zip(rhs) {
            *x = a.mul_add(y, *x);
        }
        Ok(())
    }

    /// `self += a * v + b * w`.
    pub fn add_scaled2(&mut self, a: V, v: &Self, b: V, w: &Self) -> Result<(), DistVectorError> {
        Self::ensure_finite(a)?;
        Self::ensure_finite(b)?;
        self.axpy(a, v)?;
        self.axpy(b, w)
    }

    /// `self = s * self + a * v`.
    pub fn sadd(&mut self, s: V, a: V, v: &Self) -> Result<(), DistVectorError> {
        Self::ensure_finite(s)?;
        self.scale(s)?;
        self.axpy(a, v)
    }

    /// `self = a * v`, reconciling layouts first if needed.
    pub fn equ(&mut self, a: V, v: &Self) -> Result<(), DistVectorError> {
        Self::ensure_finite(a)?;
        let scratch = self.localized_values(v)?;
        let rhs = scratch.as_deref().unwrap_or(v.local_values());
        for (x, &y) in self.local_values_mut().iter_mut().zip(rhs) {
            *x = a * y;
        }
        Ok(())
    }

    /// Elementwise `self[i] *= factors[i]`. Requires identical layouts.
    pub fn scale_by_vec(&mut self, factors: &Self) -> Result<(), DistVectorError> {
        if !self.layout().same_layout_as(factors.layout()) {
            return Err(DistVectorError::DifferentLayout);
        }
        for (x, &f) in self.local_values_mut().iter_mut().zip(factors.local_values()) {
            *x *= f;
        }
        Ok(())
    }

    /// `self *= factor`. Fails eagerly on non-finite `factor`.
    pub fn scale(&mut self, factor: V) -> Result<(), DistVectorError> {
        Self::ensure_finite(factor)?;
        for x in self.local_values_mut() {
            *x *= factor;
        }
        Ok(())
    }

    /// `self /= factor`. Fails on zero or non-finite `factor` before any
    /// entry is touched, so no Inf values can leak out.
    pub fn div_scalar(&mut self, factor: V) -> Result<(), DistVectorError> {
        Self::ensure_finite(factor)?;
        if factor == V::zero() {
            return Err(DistVectorError::ZeroDivision);
        }
        self.scale(V::one() / factor)
    }

    /// Add scalar `a` to every local entry.
    pub fn shift(&mut self, a: V) -> Result<(), DistVectorError> {
        Self::ensure_finite(a)?;
        for x in self.local_values_mut() {
            *x += a;
        }
        Ok(())
    }

    /// Inner product. Collective. Takes `&mut self` so a layout mismatch can
    /// reuse this vector's cached redistribution plan.
    pub fn dot(&mut self, other: &Self) -> Result<V, DistVectorError> {
        self.check_same_global(other)?;
        let scratch = self.localized_values(other)?;
        let rhs = scratch.as_deref().unwrap_or(other.local_values());
        let local = self
            .local_values()
            .iter()
            .zip(rhs)
            .fold(V::zero(), |acc, (&a, &b)| a.mul_add(b, acc));
        all_reduce_sum(self.comm().as_ref(), TAG_REDUCE, local)
    }

    /// `self += a * v`, then return `self · w`. Collective.
    pub fn add_and_dot(&mut self, a: V, v: &Self, w: &Self) -> Result<V, DistVectorError> {
        self.axpy(a, v)?;
        self.dot(w)
    }

    /// Sum of absolute values. Collective.
    pub fn l1_norm(&self) -> Result<V, DistVectorError> {
        let local = self
            .local_values()
            .iter()
            .fold(V::zero(), |acc, &x| acc + x.abs());
        all_reduce_sum(self.comm().as_ref(), TAG_REDUCE, local)
    }

    /// Euclidean norm. Collective.
    pub fn l2_norm(&self) -> Result<V, DistVectorError> {
        let local = self
            .local_values()
            .iter()
            .fold(V::zero(), |acc, &x| x.mul_add(x, acc));
        Ok(all_reduce_sum(self.comm().as_ref(), TAG_REDUCE, local)?.sqrt())
    }

    /// Maximum absolute value. Collective.
    pub fn linf_norm(&self) -> Result<V, DistVectorError> {
        let local = self
            .local_values()
            .iter()
            .fold(V::zero(), |acc, &x| acc.max(x.abs()));
        all_reduce_max(self.comm().as_ref(), TAG_REDUCE, local)
    }

    /// Mean of all global entries. Collective.
    pub fn mean_value(&self) -> Result<V, DistVectorError> {
        let local = self.local_values().iter().fold(V::zero(), |acc, &x| acc + x);
        let sum = all_reduce_sum(self.comm().as_ref(), TAG_REDUCE, local)?;
        let n = V::from(self.global_len()).ok_or_else(|| {
            DistVectorError::InvalidLayout(format!(
                "global size {} exceeds the scalar type's range",
                self.global_len()
            ))
        })?;
        Ok(sum / n)
    }

    /// True iff every entry on every participant is exactly zero. Collective.
    pub fn all_zero(&self) -> Result<bool, DistVectorError> {
        let flag: u32 = u32::from(self.local_values().iter().any(|&x| x != V::zero()));
        let nonzero = all_reduce_sum(self.comm().as_ref(), TAG_REDUCE, flag)?;
        Ok(nonzero == 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::algs::communicator::{
        Communicator, LocalHandle, MailboxComm, NoComm, Wait,
    };
    use crate::layout::IndexLayout;
    use crate::vector::{DistVector, TAG_PLAN_APPLY};
    use crate::vector_error::DistVectorError;
    use serial_test::serial;
    use std::sync::Arc;

    fn vec_of(values: &[f64]) -> DistVector<f64, NoComm> {
        let n = values.len() as u64;
        let layout = Arc::new(IndexLayout::contiguous(0, n, n, 0).unwrap());
        let mut v = DistVector::new(layout, Arc::new(NoComm));
        v.local_values_mut().copy_from_slice(values);
        v
    }

    #[test]
    fn same_layout_assignment_skips_redistribution() {
        let src = vec_of(&[1.0, 2.0, 3.0]);
        let mut dst = vec_of(&[0.0, 0.0, 0.0]);
        dst.assign_from(&src).unwrap();
        assert_eq!(dst.local_values(), src.local_values());
        assert!(!dst.has_cached_plan());
    }

    #[test]
    fn different_layout_assignment_builds_and_caches_plan() {
        // Same global range, but the destination enumerates it as two ranges,
        // so the layouts compare unequal and the plan path runs.
        let src = vec_of(&[1.0, 2.0, 3.0, 4.0]);
        let layout = Arc::new(IndexLayout::from_ranges(vec![(0, 2), (2, 4)], 4, 0).unwrap());
        let mut dst = DistVector::new(layout, Arc::new(NoComm));
        dst.assign_from(&src).unwrap();
        assert_eq!(dst.local_values(), &[1.0, 2.0, 3.0, 4.0]);
        assert!(dst.has_cached_plan());
        // Second assignment reuses the cached plan.
        dst.assign_from(&src).unwrap();
        assert_eq!(dst.local_values(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn size_mismatch_adopts_source_layout() {
        let src = vec_of(&[5.0, 6.0]);
        let mut dst = vec_of(&[1.0, 2.0, 3.0]);
        dst.assign_from(&src).unwrap();
        assert_eq!(dst.global_len(), 2);
        assert_eq!(dst.local_values(), &[5.0, 6.0]);
    }

    #[test]
    fn add_sub_axpy() {
        let v = vec_of(&[1.0, 2.0]);
        let mut x = vec_of(&[10.0, 20.0]);
        x.add_assign_vec(&v).unwrap();
        assert_eq!(x.local_values(), &[11.0, 22.0]);
        x.sub_assign_vec(&v).unwrap();
        assert_eq!(x.local_values(), &[10.0, 20.0]);
        x.axpy(2.0, &v).unwrap();
        assert_eq!(x.local_values(), &[12.0, 24.0]);
        x.sadd(0.5, 1.0, &v).unwrap();
        assert_eq!(x.local_values(), &[7.0, 14.0]);
        x.equ(3.0, &v).unwrap();
        assert_eq!(x.local_values(), &[3.0, 6.0]);
    }

    #[test]
    fn add_assign_dimension_mismatch_fails() {
        let v = vec_of(&[1.0, 2.0, 3.0]);
        let mut x = vec_of(&[1.0, 2.0]);
        assert!(matches!(
            x.add_assign_vec(&v).unwrap_err(),
            DistVectorError::DimensionMismatch {
                expected: 2,
                found: 3
            }
        ));
    }

    #[test]
    fn scale_by_vec_requires_same_layout() {
        let factors = vec_of(&[2.0, 3.0]);
        let mut x = vec_of(&[4.0, 5.0]);
        x.scale_by_vec(&factors).unwrap();
        assert_eq!(x.local_values(), &[8.0, 15.0]);

        let split = Arc::new(IndexLayout::from_ranges(vec![(0, 1), (1, 2)], 2, 0).unwrap());
        let other = DistVector::<f64, NoComm>::new(split, Arc::new(NoComm));
        assert_eq!(
            x.scale_by_vec(&other).unwrap_err(),
            DistVectorError::DifferentLayout
        );
    }

    #[test]
    fn zero_division_leaves_values_untouched() {
        let mut x = vec_of(&[1.0, -2.0]);
        assert_eq!(x.div_scalar(0.0).unwrap_err(), DistVectorError::ZeroDivision);
        assert_eq!(x.local_values(), &[1.0, -2.0]);
        x.div_scalar(2.0).unwrap();
        assert_eq!(x.local_values(), &[0.5, -1.0]);
    }

    #[test]
    fn non_finite_scalars_rejected_eagerly() {
        let mut x = vec_of(&[1.0]);
        assert_eq!(x.scale(f64::NAN).unwrap_err(), DistVectorError::NonFiniteScalar);
        assert_eq!(
            x.shift(f64::INFINITY).unwrap_err(),
            DistVectorError::NonFiniteScalar
        );
        let v = vec_of(&[1.0]);
        assert_eq!(
            x.axpy(f64::NAN, &v).unwrap_err(),
            DistVectorError::NonFiniteScalar
        );
        assert_eq!(x.local_values(), &[1.0]);
    }

    #[test]
    fn reductions_on_single_rank() {
        let mut x = vec_of(&[3.0, -4.0]);
        assert_eq!(x.l1_norm().unwrap(), 7.0);
        assert_eq!(x.l2_norm().unwrap(), 5.0);
        assert_eq!(x.linf_norm().unwrap(), 4.0);
        assert_eq!(x.mean_value().unwrap(), -0.5);
        assert!(!x.all_zero().unwrap());
        x.set_zero();
        assert!(x.all_zero().unwrap());

        let y = vec_of(&[2.0, 0.5]);
        let mut x = vec_of(&[3.0, -4.0]);
        assert_eq!(x.dot(&y).unwrap(), 4.0);
        // add_and_dot: x += 1.0*y, then x . y
        assert_eq!(x.add_and_dot(1.0, &y, &y).unwrap(), 10.0 + 0.25 * -7.0);
    }

    #[test]
    fn shift_adds_scalar_everywhere() {
        let mut x = vec_of(&[1.0, 2.0]);
        x.shift(0.5).unwrap();
        assert_eq!(x.local_values(), &[1.5, 2.5]);
    }

    /// Mailbox-backed communicator that drops every message of the value
    /// exchange while letting the plan-build stages through.
    struct LossyComm {
        inner: MailboxComm,
    }

    enum LossyRecv {
        Real(LocalHandle),
        Lost,
    }

    impl Wait for LossyRecv {
        fn wait(self) -> Option<Vec<u8>> {
            match self {
                LossyRecv::Real(h) => h.wait(),
                LossyRecv::Lost => None,
            }
        }
    }

    impl Communicator for LossyComm {
        type SendHandle = ();
        type RecvHandle = LossyRecv;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
            if tag != TAG_PLAN_APPLY.base() {
                self.inner.isend(peer, tag, buf);
            }
        }
        fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> LossyRecv {
            if tag == TAG_PLAN_APPLY.base() {
                LossyRecv::Lost
            } else {
                LossyRecv::Real(self.inner.irecv(peer, tag, buf))
            }
        }
        fn rank(&self) -> usize {
            self.inner.rank()
        }
        fn size(&self) -> usize {
            self.inner.size()
        }
    }

    #[test]
    #[serial]
    fn failed_redistribution_leaves_destination_intact() {
        MailboxComm::reset();
        let run = |rank: usize| {
            move || {
                let comm = Arc::new(LossyComm {
                    inner: MailboxComm::new(rank, 2),
                });
                let src_layout = if rank == 0 {
                    IndexLayout::contiguous(0, 5, 10, rank).unwrap()
                } else {
                    IndexLayout::contiguous(5, 10, 10, rank).unwrap()
                };
                let dst_layout = if rank == 0 {
                    IndexLayout::contiguous(5, 10, 10, rank).unwrap()
                } else {
                    IndexLayout::contiguous(0, 5, 10, rank).unwrap()
                };
                let mut src = DistVector::<f64, _>::new(Arc::new(src_layout), comm.clone());
                src.fill(1.0).unwrap();
                let mut dst = DistVector::<f64, _>::new(Arc::new(dst_layout), comm);
                dst.fill(7.0).unwrap();

                let err = dst.assign_from(&src).unwrap_err();
                assert!(matches!(err, DistVectorError::CommError { .. }));
                // The buffer must still match the layout and hold its old
                // values; local reads stay valid after the failure.
                assert_eq!(dst.local_len(), dst.layout().local_len());
                assert_eq!(dst.local_values(), &[7.0; 5]);
                let g = dst.layout().owned_indices().next().unwrap();
                assert_eq!(dst.extract(&[g]).unwrap(), vec![7.0]);
            }
        };
        let h0 = std::thread::spawn(run(0));
        let h1 = std::thread::spawn(run(1));
        h0.join().unwrap();
        h1.join().unwrap();
    }
}
