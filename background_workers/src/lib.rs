pub mod app;
pub mod configuration;
