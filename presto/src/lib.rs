//! A high-performance HTTP client engine.
//!
//! `presto` multiplexes requests over a pool of persistent HTTP/1.1 and
//! HTTP/2 connections and exposes one request/response API over both wire
//! protocols. The engine owns connection lifecycle (keep-alive, GOAWAY
//! draining, outlier detection), DNS resolution with TTL caching, per-SNI
//! TLS context reuse, and the request pipeline: decorators, timeouts,
//! retries, circuit breaking, redirects, and per-request logs.
//!
//! ```no_run
//! use presto::WebClient;
//!
//! # async fn run() -> Result<(), presto::Error> {
//! let client = WebClient::builder("https://api.example.com")?.build()?;
//! let response = client.get("/status").await?;
//! println!("{}", response.content_utf8().unwrap_or_default());
//! # Ok(())
//! # }
//! ```
//!
//! Streaming exchanges use [`WebClient::execute`] directly with a
//! [`Body`]; responses stream until the caller drops or drains them, at
//! which point the underlying stream slot returns to the pool.

#![warn(rust_2018_idioms, unreachable_pub)]

pub mod body;
pub mod client;
pub mod context;
pub mod dns;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod metrics;
pub mod pool;
pub mod response;
pub mod service;
pub mod session;
pub mod tls;

pub use body::{Body, BodySender};
pub use client::{ClientOptions, RequestOptions, WebClient, WebClientBuilder};
pub use context::{ClientRequestContext, ExchangeType, RequestLog, ServerContext};
pub use endpoint::{Endpoint, EndpointGroup};
pub use error::{Error, ErrorKind};
pub use response::AggregatedResponse;
pub use session::SessionProtocol;

/// A type-erased error, as carried in [`Error`] sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
