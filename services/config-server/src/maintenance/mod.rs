//! Maintainers run by the config server.

mod reindexing;

pub use reindexing::{
    with_new_ready, ReindexingMaintainer, ReindexingMaintainerConfig, DEFAULT_REINDEXING_INTERVAL_DAYS,
};
