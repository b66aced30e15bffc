//! flotillad library — configuration, the simulated capacity source and
//! subsystem wiring used by the `flotillad` binary.

pub mod app;
pub mod config;
pub mod simulated;

pub use app::App;
pub use config::FlotillaConfig;
pub use simulated::SimulatedSource;
