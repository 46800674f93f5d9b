//! Reindexing status: the model and its store.

mod model;
mod store;

pub use model::{ApplicationReindexing, ClusterReindexing, Status};
pub use store::{reindexing_key, ReindexingStore};
