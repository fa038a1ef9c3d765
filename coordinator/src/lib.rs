pub mod config;
pub mod error;
pub mod hashing;
pub mod jobs;
pub mod protocol;
pub mod service;
pub mod shares;
pub mod upstream;
pub mod workers;
