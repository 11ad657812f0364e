pub mod config;
pub mod data;
pub mod event_handler;
pub mod fireboard;
pub mod gateway;
pub mod message_locks;
