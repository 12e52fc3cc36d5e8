pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod labels;
pub mod logging;
pub mod models;
pub mod preprocess;
pub mod registry;
