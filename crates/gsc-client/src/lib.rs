//! gsc-client: Rust client library for the game server console.
//!
//! Provides the process-wide console link: one shared WebSocket connection
//! to the console gateway with reconnect/backoff, fanning inbound frames
//! out to any number of local subscribers.
//!
//! # Quick Start
//!
//! ```no_run
//! use gsc_client::ConsoleLink;
//! use std::time::Duration;
//!
//! # async fn example() -> gsc_core::GscResult<()> {
//! let link = ConsoleLink::instance();
//! link.configure("ws://127.0.0.1:8081", Duration::from_secs(3), 5).await;
//! link.connect().await?;
//!
//! let (_id, mut messages) = link.subscribe_messages().await;
//! link.send("help").await?;
//! while let Some(frame) = messages.recv().await {
//!     println!("{frame}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod link;

// Re-export primary public types.
pub use backoff::ReconnectPolicy;
pub use link::{ConnectionState, ConsoleLink};

// Re-export gsc-core error types for convenience.
pub use gsc_core::{GscError, GscResult};
