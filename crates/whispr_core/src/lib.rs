pub mod client;
pub mod errors;
pub mod metrics;
pub mod searcher;
pub mod wire;

pub use client::{ClientConfig, RpcClient, UserDispatcher};
pub use errors::{AppserverError, GatewayError, RpcError, StorageError};
pub use metrics::{normalize_metric_name, MetricsSnapshot, ServerMetrics};
pub use searcher::{Searcher, SearcherDocument, UserData};
pub use wire::{decode, encode, from_json, to_json, EnvelopeError, WireValue, CONTENT_TYPE};
