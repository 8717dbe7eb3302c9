pub extern crate actix_web;

pub mod config;
pub mod connection;
mod persistence;
mod registry;
mod room;
pub mod server;
