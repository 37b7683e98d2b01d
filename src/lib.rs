pub mod config;
pub mod engine;
pub mod fanout;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod resolver;
pub mod store;
pub mod tenant;
pub mod trigger;
pub mod wal;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;
