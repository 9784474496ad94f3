pub mod clearing_house;
pub mod client_manager;
pub mod config;
pub mod connection;
pub mod logging;
pub mod node;
pub mod peer;
pub mod server;
pub mod subscription;
pub mod tracker;

pub use clearing_house::ClearingHouse;
pub use client_manager::ClientManager;
pub use config::{load_config, Config};
pub use connection::Connection;
pub use node::{SinkNode, SourceNode};
pub use peer::Peer;
pub use server::Server;
pub use subscription::{load_subscription, Subscription};
pub use tracker::{Tracker, TrackerProxy};
