pub mod executor;
pub mod planner;
pub mod resolver;
pub mod tracker;

pub use executor::{ApplySummary, MergeExecutor, MergeStep};
pub use planner::propose_plan;
pub use resolver::{resolve, AssociationDiff};
pub use tracker::MergeJobTracker;
