pub mod config;
pub mod dispatcher;
pub mod evaluator;
pub mod feed;
pub mod model;
pub mod notifier;
pub mod path;
pub mod queue;
pub mod resolution;
pub mod server;
pub mod store;
