//! SuperCouch: an external sorted-set index for CouchDB-compatible databases.
//!
//! Map functions emit keys tagged with the `$SSET` marker; instead of
//! landing in the view index, those emissions are diverted into an external
//! sorted-set store (Redis). Read queries carrying the same marker are
//! intercepted client-side and answered from the store. Three components
//! compose the pipeline:
//!
//! - [`engine`]: the view-server protocol engine the database drives over
//!   stdio, including the embedded map-function evaluator;
//! - [`sset`]: the sorted-set contract plus its Redis and in-memory
//!   realizations;
//! - [`client`]: the view interceptor wrapping a native database handle.

pub mod client;
pub mod config;
pub mod engine;
pub mod logging;
pub mod sset;
pub mod types;

pub use config::Config;
pub use types::*;
