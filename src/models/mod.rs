#![allow(unused_imports)]

//! Domain models split into separate files.
//! This module re-exports individual model modules so imports like
//! `use crate::models::*;` work from anywhere in the crate.

pub mod chat;
pub mod connection;
pub mod file;
pub mod share;

pub use self::chat::*;
pub use self::connection::*;
pub use self::file::*;
pub use self::share::*;
