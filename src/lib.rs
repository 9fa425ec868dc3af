pub mod api;
pub mod config;
pub mod health_monitor;
pub mod port_allocator;
pub mod process_monitor;
pub mod service;
pub mod supervisor;
