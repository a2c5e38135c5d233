pub mod cli;
pub mod config;
pub mod execution;
pub mod handlers;
pub mod origin;
pub mod printer;
pub mod session;
