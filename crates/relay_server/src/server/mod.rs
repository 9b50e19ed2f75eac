#![forbid(unsafe_code)]

pub mod connection;
pub mod dispatch;
pub mod health;
pub mod listener;
pub mod registry;
pub mod router;
pub mod state;

#[cfg(test)]
mod dispatch_tests;
