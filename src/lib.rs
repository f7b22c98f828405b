pub mod broadcast;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod model;
pub mod persistence;
pub mod portfolio;
pub mod reporter;
pub mod risk;
pub mod strategy;
pub mod ui;
