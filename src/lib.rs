pub mod config;
pub mod echo;
pub mod error;
pub mod fanout;
pub mod server;
