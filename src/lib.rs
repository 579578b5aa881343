// Library crate exposing modules for the binary and integration tests

pub mod analyze;
pub mod clock;
pub mod config;
pub mod crawl;
pub mod dispatch;
pub mod error;
pub mod feed;
pub mod harvest;
pub mod logging;
pub mod model;
pub mod queue;
pub mod ratelimit;
pub mod sink;
pub mod util;
pub mod worker;
