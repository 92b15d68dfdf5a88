pub mod backend;
pub mod bundle;
pub mod chat;
pub mod connection;
#[cfg(test)]
pub mod fake_backend;
pub mod files;
pub mod gate;
pub mod init;
pub mod resolver;
pub mod sessions;
