pub mod cache;
pub mod cli;
pub mod constants;
pub mod feed;
pub mod logging;
pub mod quote;
pub mod relay;
pub mod tail;
