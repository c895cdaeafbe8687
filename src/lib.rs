pub mod can;
pub mod clock;
pub mod config;
pub mod io;
pub mod messages;
pub mod module;
pub mod motor;
pub mod runtime;
