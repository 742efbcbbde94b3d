pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod monitor;
pub mod orchestrator;
pub mod secrets;
pub mod status;

pub use broadcast::{UpgradeEvent, UpgradeEventBus};
pub use config::{load_config, EngineConfig};
pub use db::Database;
pub use error::{ConfigError, OrgPushError, Result, ValidationError};
pub use gateway::{Connector, GatewayError, OrgConnection};
pub use monitor::{MonitorLoop, PassOutcome};
pub use orchestrator::{JobReporter, LogReporter, Orchestrator};
pub use secrets::{resolve_secret, SecretError};
pub use status::{PushStatus, UpgradeStatus};
