pub mod applier;
pub mod auth;
pub mod classify;
pub mod engine;
pub mod index;
pub mod manifest;
pub mod paths;
pub mod remote;
