pub mod query_cache;
pub mod session;

pub use query_cache::{Invalidation, QueryCache};
pub use session::EvalSession;
