#![cfg_attr(docsrs, feature(doc_cfg))]
//! # dist-vector
//!
//! dist-vector is a Rust library for globally indexed numeric vectors sharded
//! across a group of cooperating participants, designed for scientific
//! computing and PDE codes. Each participant owns a set of half-open global
//! index ranges and stores only those entries; cross-vector operations
//! reconcile differing partitions automatically by building, caching, and
//! applying redistribution plans over a pluggable communication backend.
//!
//! ## Features
//! - Immutable [`layout::IndexLayout`] partition descriptors with identity
//!   tracking for cheap plan-cache invalidation
//! - [`redistribute::RedistributionPlan`]: precomputed, reusable routing
//!   between any two partitions of the same global range
//! - [`vector::DistVector`]: elementwise arithmetic, norms, and reductions
//!   with layout reconciliation on every binary operation
//! - Sparse imports routing externally held `(index, value)` pairs to their
//!   owners, with `Insert` and `Add` combine modes
//! - Pluggable communication backends (serial, in-process mailbox, MPI)
//!
//! ## Determinism
//!
//! Every collective resolves contributions in ascending participant order and
//! ascending global index order, so `Insert` outcomes are deterministic and
//! repeated runs on the same partitioning are bitwise reproducible.
//!
//! ## Usage
//! Add `dist-vector` as a dependency in your `Cargo.toml` and enable features
//! as needed:
//!
//! ```toml
//! [dependencies]
//! dist-vector = "0.1"
//! # Optional features:
//! # features = ["mpi-support"]
//! ```

pub mod algs;
pub mod layout;
pub mod redistribute;
pub mod vector;
pub mod vector_error;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{CommTag, Communicator, NoComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::layout::{IndexLayout, LayoutId};
    pub use crate::redistribute::{CombineMode, MissingPolicy, RedistributionPlan};
    pub use crate::vector::{
        CommPattern, DistVector, ImportPlan, PrintOptions, Scalar, SparseImport,
    };
    pub use crate::vector_error::DistVectorError;
}
