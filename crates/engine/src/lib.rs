#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! The dispatcher core: fetcher transports, the rate governor, the ingestion
//! pipeline, the claim-dispatch-ingest control loop and staging recovery.

pub mod dispatcher;
pub mod governor;
pub mod ingest;
pub mod recovery;
pub mod transport;

pub use dispatcher::{DispatchStats, Dispatcher, DispatcherConfig, StopFlag};
pub use transport::{FetchError, Transport, TransportKind, load_transports};
