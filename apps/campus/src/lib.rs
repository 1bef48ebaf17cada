pub mod api;
pub mod cli;
pub mod config;
pub mod drafts;
pub mod epoch;
pub mod error;
pub mod guard;
pub mod realtime;
pub mod resource;
pub mod submit;
pub mod telemetry;
