pub mod annotation;
pub mod metric;
pub mod stats;
pub mod step;
pub mod trace;
