//! The redistribution protocol: combine policies, precomputed plans, and the
//! value exchange that applies them.

pub mod combine;
pub mod exchange;
pub mod plan;

pub use combine::{AddCombine, Combine, CombineMode, InsertCombine, MissingPolicy};
pub use plan::RedistributionPlan;
