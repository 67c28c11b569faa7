//! Small shared utilities.

pub mod random;

pub use random::{RandomSource, SmallRngSource};
