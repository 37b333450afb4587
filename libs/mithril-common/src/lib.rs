pub mod bus;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod subjects;
pub mod types;
