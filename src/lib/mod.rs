#[macro_use]
extern crate lazy_static;
extern crate tracing;

pub mod aggregation;
pub mod cli;
pub mod counter;
pub mod detection;
pub mod error;
pub mod frame;
pub mod logger;
pub mod persistence;
pub mod prediction;
pub mod replay;
pub mod settings;
pub mod source;
pub mod stats;
pub mod worker;
