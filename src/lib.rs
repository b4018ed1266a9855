//! # json-lines
//!
//! Long-lived HTTP streaming of newline-delimited JSON, built on Axum.
//!
//! A client issues a request; the server keeps the connection open
//! indefinitely and pushes one JSON value per line, interleaved with
//! periodic `{"name":"heartbeat"}` messages that keep proxies and load
//! balancers from timing out the idle connection.
//!
//! ## Features
//!
//! - **Shared heartbeat clock**: N open connections cost one timer, not N
//! - **Event-driven lifecycle**: `Open` and `Close` fire exactly once per
//!   session, and every listener is released on close
//! - **Race-safe writes**: a send that loses the race against the peer
//!   hanging up is dropped silently, never a crash
//! - **Method gate**: anything other than POST/OPTIONS gets a plain 405
//!
//! ## Modules
//!
//! - [`heartbeat`]: the shared periodic ticker
//! - [`session`]: per-connection session handles and lifecycle events
//! - [`route`]: the Axum route factory, router assembly and server loop
//! - [`config`]: TOML + environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use json_lines::{build_router, serve, Config, StreamRoute};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_default();
//!     json_lines::logging::init(&config.logging);
//!
//!     let route = StreamRoute::from_config(&config.stream);
//!     let app = build_router("/events", &route, |session| {
//!         let producer = session.clone();
//!         session.on_open(move || {
//!             let _ = producer.send(&serde_json::json!({ "name": "welcome" }));
//!         });
//!     });
//!
//!     serve(app, &config.server).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod logging;
pub mod route;
pub mod session;

// Re-export top-level types for convenience
pub use config::{Config, ConfigError, LoggingConfig, ServerConfig, StreamConfig};

pub use error::{ServeError, StreamError};

pub use heartbeat::{HeartbeatClock, SubscriptionId};

pub use route::{build_router, serve, StreamRoute};

pub use session::{SessionEvent, SessionRequest, StreamSession};
