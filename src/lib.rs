// src/lib.rs
pub mod ports {
    pub mod paper_gateway;
}
pub mod analysis;
pub mod config;
pub mod pairtrade;
pub mod rate_limit_notifier;
pub mod scanner;
pub mod trade;
