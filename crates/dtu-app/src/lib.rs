mod config;

pub use config::DtuConfig;
