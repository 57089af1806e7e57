//! Minimal worker-side runtime.
//!
//! Enough of the launch contract to host handlers in a Rust worker binary:
//! attach to the pipes named in the environment, run setup, send Ready, and
//! answer requests from a static [`HandlerTable`].

mod handlers;
mod runtime;

pub use handlers::{HandlerTable, HandlerTableBuilder};
pub use runtime::WorkerRuntime;
