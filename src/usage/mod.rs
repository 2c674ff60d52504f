pub mod aggregator;
pub mod extraction;
pub mod rollup;

pub use aggregator::{AggregationError, AggregatorSettings, UsageAggregator, UsageWindow};
pub use extraction::{UsageExtractor, UsageRule};
