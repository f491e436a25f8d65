pub mod dedup;
pub mod wquantile;

pub use dedup::{aggregate_by_branch_and_event, DedupRow, Sample};
pub use wquantile::{
    add_missing_zeroes, type7_quantile, weighted_harrell_davis_quantile, weighted_mean,
    weighted_quantile,
};
