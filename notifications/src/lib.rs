pub mod channel;
pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod event;
pub mod listener;
pub mod producer;
