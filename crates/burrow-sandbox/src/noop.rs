use std::path::Path;

use tracing::debug;

use crate::{Permissions, Promise, Sandbox, SandboxError, promise_list};

/// Sandbox for platforms without unveil/pledge. Every call succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSandbox;

impl Sandbox for NoopSandbox {
    fn restrict_visibility(
        &self,
        path: &Path,
        permissions: Permissions,
    ) -> Result<(), SandboxError> {
        debug!(path = %path.display(), perms = %permissions, "unveil skip");
        Ok(())
    }

    fn lock_visibility(&self) -> Result<(), SandboxError> {
        debug!("unveil block skip");
        Ok(())
    }

    fn restrict_syscalls(&self, promises: &[Promise]) -> Result<(), SandboxError> {
        debug!(promises = %promise_list(promises), "pledge skip");
        Ok(())
    }
}
