//! Response caching: key derivation, storage backends and the request
//! orchestrator that ties them to an origin.

pub mod admission;
pub mod backend;
pub mod cache_control;
pub mod entry;
pub mod key;
pub mod local;
pub mod lock;
pub mod orchestrator;
pub mod registry;
pub mod remote;

pub use backend::{Backend, BackendError, CacheBackend, FlushScope};
pub use key::{CacheKey, KeyDeriver, KeyOptions};
pub use local::{LocalStore, LocalStoreOptions};
pub use orchestrator::{CacheOptions, FlushTarget, ResponseCache};
pub use registry::{BackendRegistry, spawn_health_monitor};
pub use remote::RemoteStore;
