pub mod adb;
pub mod capture;
pub mod commands;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod hal;
pub mod logging;
pub mod models;
pub mod output;
pub mod playback;
pub mod registry;
pub mod remote;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod sweep;
