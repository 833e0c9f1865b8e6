#![forbid(unsafe_code)]

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod extractor;
pub mod feed;
pub mod limiter;
pub mod metadata;
pub mod models;
pub mod stream;
pub mod takeout;
