//! Startup and reinitialization hooks.

use crate::capability::Server;
use crate::error::InitError;

/// A lifecycle hook run by the server.
///
/// On start the server calls `pre_init` on every initializer, then `init`
/// in registration order (the first failure aborts start), then
/// `post_init`. `reinit` runs on a reinitialization trigger.
pub trait Initializer: Send + Sync {
    fn init(&self, server: &dyn Server) -> Result<(), InitError>;

    fn reinit(&self, server: &dyn Server) -> Result<(), InitError>;

    fn pre_init(&self) {}

    fn post_init(&self) {}
}
