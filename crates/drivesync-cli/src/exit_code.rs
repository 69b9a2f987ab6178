//! Exit codes for the CLI.
//!
//! These follow common Unix conventions and provide meaningful
//! status information for scripting and automation.

/// Successful execution
pub const SUCCESS: u8 = 0;

/// General/unspecified error
pub const GENERAL_ERROR: u8 = 1;

/// Item, store, or bookmarked folder not found
pub const NOT_FOUND: u8 = 2;

/// The scope provider refused access, or the token was revoked
pub const ACCESS_DENIED: u8 = 3;

/// Another folder selection is already pending
pub const BUSY: u8 = 4;

/// Selection cancelled, empty, or interrupted
pub const CANCELLED: u8 = 5;
