pub mod clock;
pub mod config;
pub mod logging;
pub mod storage;
pub mod sync;
pub mod token_provider;
