pub mod aggregator;
pub mod allocator;
pub mod backtest;
pub mod bar_utils;
pub mod cache;
pub mod commands;
pub mod config;
pub mod context;
pub mod data_context;
pub mod database;
pub mod error;
pub mod kelly;
pub mod models;
pub mod optimizer;
pub mod optimizer_status;
pub(crate) mod retry;
pub mod simulator;
