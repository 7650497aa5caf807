pub mod config;
pub mod host;
pub mod request;
pub mod server;

pub use config::{LoadBalancerKind, SpawnerConfig};
pub use host::HostRecord;
pub use request::SpawnRequest;
pub use server::{Endpoint, Liveness, ServerStatus, Signal, SpawnedServerRecord};
