// 私有模块声明
mod app;
mod cli;
mod config;
mod connector;
mod init;
mod strategy;
mod utils;

// 通过 pub use 精确控制对外暴露的接口
pub use app::CliApp;
pub use cli::{Cli, Commands};
pub use config::AppConfig;
pub use connector::PsqlClusterConnector;
pub use init::run_init;
pub use strategy::PgDumpStrategy;
pub use utils::setup_logging;
