pub mod coalescer;
pub mod loaders;

pub use coalescer::{BatchLoader, Coalescer};
pub use loaders::{AnnotationLoader, StepLoader, TestcaseLoader, TraceLoader};
