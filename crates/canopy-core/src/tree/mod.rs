//! Nested-interval tree maintenance: placement validation, bound
//! bookkeeping, and materialized-path upkeep.

pub mod path;
pub mod range;
pub mod validate;
