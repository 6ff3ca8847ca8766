pub mod app;
pub mod cluster;
pub mod config;
pub mod flow;
pub mod graph;
pub mod health;
pub mod message;
pub mod model;
pub mod recovery;
pub mod runtime;
pub mod snapshot;
pub mod state;
pub mod supervisor;

#[cfg(test)]
mod test_support;
