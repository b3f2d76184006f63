//! Typed facades over [`WebApiClient`](crate::WebApiClient).
//!
//! Each facade method fixes a method name and argument shape and supplies
//! its own result transform; facades hold no state of their own.

pub mod dataset;

pub use dataset::{DataSource, DataStore, DatasetApi};
