pub mod admission;
pub mod app;
pub mod auth;
pub mod config;
pub mod management;
pub mod otlp;
pub mod proxy;
pub mod secrets;
pub mod subst;
pub mod telemetry;

pub use app::App;
pub use config::Config;
