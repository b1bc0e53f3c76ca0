//! deskrelay — helpdesk conversation event and messaging pipeline.

pub mod automation;
pub mod config;
pub mod error;
pub mod hub;
pub mod inbox;
pub mod models;
pub mod pipeline;
pub mod store;
pub mod template;
pub mod textutil;
