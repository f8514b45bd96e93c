//! camnode device control plane library.
//!
//! This library exposes the control-plane modules for testing and for
//! alternative hardware backends. The main entry point is the `camnode`
//! binary.

pub mod bus;
pub mod camera;
pub mod capture;
pub mod command;
pub mod config_store;
pub mod control;
pub mod hardware;
pub mod mqtt;
pub mod publisher;
pub mod router;
pub mod sim;
pub mod state;
pub mod store;
pub mod stream;
pub mod upload;
pub mod voice;
