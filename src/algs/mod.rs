//! Communication plumbing: the communicator façade, wire records, and the
//! collective exchange helpers the redistribution protocol is built on.

pub mod collective;
pub mod communicator;
pub mod wire;
