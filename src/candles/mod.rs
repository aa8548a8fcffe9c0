pub mod aggregator;
pub mod builder;

pub use aggregator::{Aggregator, BarsSource, NewsSink, UpdateSink};
pub use builder::{CandleBuilder, TradeOutcome};
