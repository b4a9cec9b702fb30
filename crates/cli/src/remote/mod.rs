//! HTTP-backed ledger, result store and job store.

mod common;
mod jobs;
mod ledger;
mod results;

pub use common::{resolve_token, RemoteClient};
pub use jobs::HttpJobStore;
pub use ledger::HttpLedger;
pub use results::HttpResultSink;
