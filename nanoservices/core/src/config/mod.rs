pub mod loader;
pub mod types;

pub use loader::{load_node_config, load_processors_dir, parse_node_config};
pub use types::{ClusterConfig, LifecycleConfig, NodeConfig, RouteConfig};
