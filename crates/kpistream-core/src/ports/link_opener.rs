//! Dashboard link opener port.

use crate::error::CoreError;

/// Shows a link to the user, typically in a browser
pub trait LinkOpener: Send + Sync {
    fn open(&self, link: &str) -> Result<(), CoreError>;
}
