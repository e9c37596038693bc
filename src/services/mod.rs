//! 伙伴服务调用层

pub mod stork_api;

pub use stork_api::{StorkApiClient, ValidationApi};
