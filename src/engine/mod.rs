//! Query-server protocol engine
//!
//! A long-lived child process the database talks to over its view-server
//! line protocol. The engine registers map functions, executes them against
//! documents through an embedded JavaScript evaluator, diverts emissions
//! tagged with the sorted-set marker into the sorted-set store, and answers
//! every request with one JSON line.
//!
//! ```text
//! Database ──stdio lines──▶ server ──▶ handler ──▶ evaluator (map code)
//!                                        │
//!                                        ▼ diverted emissions, one batch/doc
//!                                   SSetStore
//! ```

pub mod evaluator;
pub mod handler;
pub mod protocol;
pub mod server;

pub use evaluator::{EvalError, Evaluator};
pub use handler::{classify_emission, Engine};
pub use protocol::{Command, ProtocolError, Reply};
pub use server::{serve, serve_stdio};
