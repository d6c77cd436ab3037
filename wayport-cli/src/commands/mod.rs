pub mod client;
pub mod server;
pub mod token;
pub mod version;
