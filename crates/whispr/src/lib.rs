//! Public facade for the whispr workspace.
//! Default path: use this crate first. Reach for `whispr::cell`, `whispr::core`,
//! or `whispr::storage` directly for lower-level control.

mod app;

pub use app::{App, AppConfig};
pub use whispr_core::{
    AppserverError, ClientConfig, RpcClient, RpcError, Searcher, SearcherDocument, ServerMetrics,
    UserData, UserDispatcher, WireValue,
};
pub use whispr_storage::{Appstorage, Item};

pub use whispr_cell as cell;
pub use whispr_core as core;
pub use whispr_storage as storage;
