#![allow(async_fn_in_trait)]
pub mod config;
pub mod date_window;
pub mod error;
pub mod geo_area;
pub mod georectify;
pub mod http;
pub mod normalize;
pub mod orchestrator;
pub mod output;
pub mod progress;
pub mod provider;
pub mod retry;
pub mod thumbnail;
