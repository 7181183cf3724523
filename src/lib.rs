//! # mass-blocker
//!
//! Resumable engine for blocking or muting accounts in bulk.
//!
//! ## Design Philosophy
//!
//! mass-blocker is designed to be:
//! - **Resumable** - every operation persists its progress and picks up where it left off
//! - **Rate-limit aware** - exhausted windows suspend work until the reported reset
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use mass_blocker::{Action, BlockLikersRequest, Config, Engine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.api.client_id = "my-client-id".to_string();
//!
//!     let engine = Engine::new(config).await?;
//!     engine.start().await?;
//!
//!     // Subscribe to events
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     engine
//!         .block_likers(BlockLikersRequest {
//!             tweet_id: "1234567890".to_string(),
//!             action: Action::Block,
//!             exclude_followers: true,
//!             exclude_follows: true,
//!             include_likers: true,
//!             include_retweeters: false,
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Authenticated API access
pub mod client;
/// Configuration types
pub mod config;
/// Queue consumption loop
pub mod consume;
/// Database persistence layer
pub mod db;
/// Engine wiring and lifecycle
pub mod engine;
/// Error types
pub mod error;
/// Persisted operation logs
pub mod logging;
/// Block/mute membership lookups
pub mod membership;
/// Persisted operations and their dispatch
pub mod operations;
/// Paginated collection loop
pub mod pagination;
/// Retry logic with exponential backoff
pub mod retry;
/// Core types and events
pub mod types;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

// Re-export commonly used types
pub use client::{ApiClient, ApiRequester, ApiResponse, Request};
pub use config::Config;
pub use db::Database;
pub use engine::{Engine, OperationInfo};
pub use error::{Error, Result};
pub use operations::{BlockLikersRequest, OperationState, parse_tweet_id};
pub use types::{
    Action, ErrorRecord, Event, ListType, LogEntry, QueueType, Severity, Token, UserHandle,
};

/// Helper function to run a started engine with graceful signal handling.
///
/// Waits for a termination signal and then calls the engine's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use mass_blocker::{Config, Engine, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut config = Config::default();
///     config.api.client_id = "my-client-id".to_string();
///     let engine = Engine::new(config).await?;
///     engine.start().await?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(engine).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(engine: Engine) -> Result<()> {
    wait_for_signal().await;
    engine.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
