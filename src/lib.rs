//! # usenet-engine
//!
//! Usenet (NNTP) binary download engine: given bundles of articles spread
//! across multiple news servers, the engine fetches every article, decodes
//! the binary payload (yEnc or uuencode) and assembles the original files.
//!
//! ## Design Philosophy
//!
//! - **Engine as a value** - no global state; tests run independent engines
//! - **Multi-level failover** - servers are tried by tier, burned per
//!   article, with group-equivalent peers failing together
//! - **Streaming decode** - article bodies decode line by line into the
//!   output file, optionally at their final offset ("direct write")
//! - **Event-driven** - consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use usenet_engine::{Config, DownloadEngine, NzbInfo, FileInfo, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         servers: vec![ServerConfig::new(1, "news.example.com", 119)],
//!         ..Default::default()
//!     };
//!     let engine = DownloadEngine::new(config).await?;
//!     engine.start();
//!
//!     // Subscribe to events
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     // Bundles come from an external manifest parser
//!     let mut nzb = NzbInfo::new("my.download", "./downloads");
//!     let mut file = FileInfo::new("subject", "archive.rar", vec!["alt.binaries.test".into()]);
//!     file.add_article(1, "<part1of2@example.com>", 500_000);
//!     file.add_article(2, "<part2of2@example.com>", 500_000);
//!     nzb.add_file(file);
//!     engine.add_nzb(nzb).await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Streaming yEnc/UU decoders
pub mod decoder;
/// The download engine and its worker pool
pub mod engine;
/// Error types
pub mod error;
/// NNTP connection and server pool
pub mod nntp;
/// Par-repair coordination
pub mod par;
/// Download queue data model and persistence hooks
pub mod queue;
/// Download speed metering and throttling
pub mod speed;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{Config, DownloadConfig, ParConfig, ServerConfig};
pub use engine::DownloadEngine;
pub use error::{Error, NntpError, Result};
pub use par::{
    NoOpParityHandler, ParCoordinator, ParityCapabilities, ParityHandler, RepairOutcome,
    VerifyOutcome,
};
pub use queue::persistence::{JsonDiskPersistence, NoOpPersistence, QueuePersistence};
pub use queue::{ArticleInfo, DownloadQueue, FileInfo, NzbInfo};
pub use types::{
    ArticleOutcome, ArticleStatus, EditAction, Event, FileId, NzbId, NzbStats, PostStage,
    Priority, ServerId,
};
