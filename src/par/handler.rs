//! Trait seam to the external par2 repair engine
//!
//! The engine core does not implement Reed-Solomon itself; it drives an
//! implementation of [`ParityHandler`] through the post-download pipeline
//! and reacts to its block counts. [`NoOpParityHandler`] stands in when no
//! repair engine is wired up — bundles then skip verification entirely.

use async_trait::async_trait;
use std::path::Path;

use crate::error::Result;

/// Result of verifying a bundle against its par set
#[must_use]
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    /// All source files are intact
    pub complete: bool,
    /// Recovery blocks required to repair the damage
    pub blocks_needed: u32,
    /// Recovery blocks already available on disk
    pub recovery_blocks_available: u32,
}

/// Result of a repair run
#[must_use]
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    /// Repair reconstructed all damaged blocks
    pub success: bool,
    /// Error message when repair failed
    pub error: Option<String>,
}

/// What a handler implementation is able to do
#[derive(Debug, Clone, Copy)]
pub struct ParityCapabilities {
    /// Can verify file integrity
    pub can_verify: bool,
    /// Can repair damaged files
    pub can_repair: bool,
}

/// Interface of a par2 verification/repair engine
#[async_trait]
pub trait ParityHandler: Send + Sync {
    /// Implementation name, for logging
    fn name(&self) -> &str;

    /// What this implementation can do
    fn capabilities(&self) -> ParityCapabilities;

    /// Verify the file collection referenced by `par_file`
    async fn verify(&self, par_file: &Path) -> Result<VerifyOutcome>;

    /// Repair using the recovery data referenced by `par_file`
    async fn repair(&self, par_file: &Path) -> Result<RepairOutcome>;
}

/// Handler used when no repair engine is available; reports everything as
/// complete so the pipeline finishes without verification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpParityHandler;

#[async_trait]
impl ParityHandler for NoOpParityHandler {
    fn name(&self) -> &str {
        "noop"
    }

    fn capabilities(&self) -> ParityCapabilities {
        ParityCapabilities {
            can_verify: false,
            can_repair: false,
        }
    }

    async fn verify(&self, _par_file: &Path) -> Result<VerifyOutcome> {
        Ok(VerifyOutcome {
            complete: true,
            blocks_needed: 0,
            recovery_blocks_available: 0,
        })
    }

    async fn repair(&self, _par_file: &Path) -> Result<RepairOutcome> {
        Ok(RepairOutcome {
            success: false,
            error: Some("par repair not available".into()),
        })
    }
}
