//! Partition descriptors: which global indices each participant owns.

pub mod index_layout;

pub use index_layout::{IndexLayout, LayoutId};
