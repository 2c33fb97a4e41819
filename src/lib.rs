pub mod api;
pub mod config;
pub mod error;
pub mod helpers;
pub mod jobs;
pub mod services;
