pub mod client;
pub mod persist;
pub mod store;
pub mod web;
