pub mod config_loader;
pub mod discovery;
pub mod launcher;
pub mod liveness;
pub mod pool;
pub mod session;
pub mod spawner;
pub mod ssh;

pub use pool::{HostPool, LeastLoaded, LoadBalancer, RoundRobin};
pub use session::{Credentials, ExecOutput, RemoteSession, SessionConnector};
pub use spawner::SshSpawner;
pub use ssh::{OpenSshConnector, OpenSshSession};
