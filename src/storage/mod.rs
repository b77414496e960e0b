//! The two SQLite stores behind the pipeline.
//!
//! The WRITE store absorbs tracker batches and is the aggregation engine's
//! working set; the READ store is the query-surface projection fed by the
//! materialization job. The two are never mixed: components receive the
//! handle(s) they need, there is no global.

pub mod read_store;
pub mod write_store;

pub use read_store::{ArbitrageFilter, ArbitrageSort, ReadStore};
pub use write_store::WriteStore;
