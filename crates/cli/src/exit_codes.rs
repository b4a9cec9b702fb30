//! CLI Exit Code Registry
//!
//! Single source of truth for `tillmatch` exit codes. Schedulers and shell
//! wrappers branch on them, so existing values never change meaning.
//!
//! # Exit Code Ranges
//!
//! | Range   | Domain    | Description                                   |
//! |---------|-----------|-----------------------------------------------|
//! | 0       | Universal | Success, every published group matched        |
//! | 1       | recon     | Run finished but exceptions were classified   |
//! | 2       | Universal | CLI usage error (bad args, bad date range)    |
//! | 3-9     | recon     | Engine failures                               |
//! | 50-59   | remote    | Remote ledger / result / job store clients    |

// =============================================================================
// Universal (0-2)
// =============================================================================

/// Success - every group in every chunk matched.
pub const EXIT_SUCCESS: u8 = 0;

/// Reconciliation finished and at least one group is mismatched, failed, or
/// could not be published. Like `diff(1)`, 1 means "ledgers differ".
pub const EXIT_EXCEPTIONS: u8 = 1;

/// Usage error - bad arguments, unparseable dates, unknown type names.
pub const EXIT_USAGE: u8 = 2;

// =============================================================================
// Engine (3-9)
// =============================================================================

/// Pipeline config could not be parsed or failed validation.
pub const EXIT_CONFIG: u8 = 3;

/// A ledger source stayed unavailable or paginated inconsistently.
pub const EXIT_SOURCE: u8 = 4;

/// Result store lookup or publish failed for the whole run.
pub const EXIT_PUBLISH: u8 = 5;

/// Job tracking store failure.
pub const EXIT_TRACKER: u8 = 6;

/// Local file read/write failure.
pub const EXIT_IO: u8 = 7;

/// One or more chunks of a job failed outright.
pub const EXIT_CHUNK_FAILED: u8 = 8;

/// Unexpected engine failure (arithmetic overflow outside a group).
pub const EXIT_ENGINE: u8 = 9;

// =============================================================================
// Remote (50-59)
// =============================================================================

/// A remote URL was given but no token (neither flag nor env var).
pub const EXIT_REMOTE_NOT_AUTH: u8 = 50;

/// HTTP client could not be constructed (TLS backend initialisation).
pub const EXIT_REMOTE_CLIENT: u8 = 51;
