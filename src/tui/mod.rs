//! Terminal UI modules

pub mod session_monitor;

pub use session_monitor::SessionMonitorApp;
