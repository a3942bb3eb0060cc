pub mod config;
pub mod logger;
pub mod server;

pub use config::*;
pub use logger::*;
pub use server::ProxyApplicationServer;
pub use server::*;
