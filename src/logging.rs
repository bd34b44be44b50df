//! ## Logging Configuration
//!
//! This module sets up logging automatically at program startup using the `ctor` crate.
//! Logging behavior is controlled by the `DEBUG_TRIP_INGEST` environment variable:
//!
//! - **Disabled** (default): If the variable is unset, empty, or explicitly set to `"0"` or `"false"`,
//!   no logging will be initialized.
//! - **Enabled**: Any other value enables logging with a maximum log level of `DEBUG`, which
//!   includes one line per written batch and per window fetch attempt.
//!
//! ### Usage Example
//!
//! ```sh
//! export DEBUG_TRIP_INGEST=true
//! ```

use ctor::ctor;
use tracing::Level;

/// Name of the environment variable that switches on debug logging.
pub const DEBUG_ENV_VAR: &str = "DEBUG_TRIP_INGEST";

/// Returns true when the given value of [`DEBUG_ENV_VAR`] asks for logging.
pub fn debug_enabled(value: Option<&str>) -> bool {
    value.is_some_and(|v| !(v == "0" || v == "false" || v.is_empty()))
}

#[ctor]
fn set_debug_level() {
    let value = std::env::var(DEBUG_ENV_VAR).ok();
    if debug_enabled(value.as_deref()) {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .try_init();
    }
}
