pub mod config;
pub mod error;
pub mod mapper;
pub mod model;
pub mod repo;
