pub mod actions;
pub mod frames;
pub mod handshake;
pub mod host;
pub mod listener;
pub mod models;
pub mod settings;
pub mod store;
