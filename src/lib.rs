//! Stream resolution and resilient dual-sink playback for library tracks
//! that only exist as metadata.

pub mod cache;
pub mod config;
pub mod cover;
pub mod engine;
pub mod gateway;
pub mod player;
pub mod proxy;
pub mod resilience;
pub mod resolver;
pub mod retry;
pub mod service;
pub mod track;

#[cfg(test)]
mod testing;
