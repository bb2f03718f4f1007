#![forbid(unsafe_code)]

pub mod auth;
pub mod directory;
pub mod dispatcher;
pub mod gateway;
pub mod health;
pub mod history;
pub mod registry;
pub mod store;




#[cfg(test)]
mod registry_tests;

#[cfg(test)]
mod store_tests;
