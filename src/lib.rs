//! carrier: a control plane for a small fleet of virtual machines.
//!
//! The [`registry::Registry`] owns every VM, hands out console ports, VNC
//! displays and MAC addresses, and persists configs to a JSON snapshot. The
//! [`console::ConsoleTunnel`] relays a caller's connection to a VM's serial
//! console. [`api::router`] exposes both over HTTP.

pub mod api;
pub mod config;
pub mod console;
pub mod error;
pub mod logging;
pub mod paths;
pub mod registry;
pub mod vm;
