pub mod client;
pub mod config;
pub mod coordinator_impl;
pub mod coordinator_service;
pub mod error;
pub mod message;
pub mod storage_impl;
pub mod storage_service;
pub mod util;
pub mod wire;
