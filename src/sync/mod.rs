//! Keeping the spec store fresh: network access, data adapters and the background poller.
pub mod data_adapter;
pub mod network;
mod poller_thread;
mod specs_sync;

pub use data_adapter::{DataAdapter, InMemoryDataAdapter};
pub use network::{NetworkClient, ReqwestTransport, Request, Response, RetryPolicy, Transport};
pub use poller_thread::{PollerThread, PollerThreadConfig, SyncState};
pub use specs_sync::{SpecsSyncer, SpecsUpdateCallback, SyncEndpoints};
