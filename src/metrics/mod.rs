//! Metric reconciliation: normalizing stat leaves, classifying records,
//! repairing stale data and reading values back out.

pub mod aggregate;
pub mod keys;
pub mod lookup;
pub mod merge;
pub mod processor;
pub mod run;
pub mod scenario;
pub mod temporal;

pub use aggregate::ScenarioMetricData;
pub use keys::MetricKeys;
pub use lookup::{LookupHit, LookupRequest, MetricLookup};
pub use processor::{FlushOptions, FlushResult, MetricProcessor, RefreshLedger};
pub use run::{RunLevelStatsMap, RunMetricsLoader, RunMetricsSnapshot};
pub use scenario::ScenarioMetricsLoader;
pub use temporal::{TemporalMetricPoint, TemporalStore};
