//! unveil(2) and pledge(2) via libc.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use tracing::debug;

use crate::{Permissions, Promise, Sandbox, SandboxError, promise_list};

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenBsdSandbox;

impl Sandbox for OpenBsdSandbox {
    fn restrict_visibility(
        &self,
        path: &Path,
        permissions: Permissions,
    ) -> Result<(), SandboxError> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| SandboxError::InvalidPath(path.to_path_buf()))?;
        let c_perms = CString::new(permissions.to_string())
            .map_err(|_| SandboxError::InvalidPath(path.to_path_buf()))?;

        // SAFETY: both pointers come from live, NUL-terminated CStrings.
        let rc = unsafe { libc::unveil(c_path.as_ptr(), c_perms.as_ptr()) };
        if rc == -1 {
            return Err(SandboxError::Unveil {
                path: path.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }

        debug!(path = %path.display(), perms = %permissions, "unveil");
        Ok(())
    }

    fn lock_visibility(&self) -> Result<(), SandboxError> {
        // SAFETY: unveil(NULL, NULL) is the documented lock call.
        let rc = unsafe { libc::unveil(ptr::null(), ptr::null()) };
        if rc == -1 {
            return Err(SandboxError::UnveilBlock(io::Error::last_os_error()));
        }

        debug!("unveil block");
        Ok(())
    }

    fn restrict_syscalls(&self, promises: &[Promise]) -> Result<(), SandboxError> {
        let promises = promise_list(promises);
        let c_promises = CString::new(promises.as_str()).map_err(|_| SandboxError::Pledge {
            promises: promises.clone(),
            source: io::Error::from(io::ErrorKind::InvalidInput),
        })?;

        // SAFETY: a NULL execpromises leaves exec behaviour unchanged.
        let rc = unsafe { libc::pledge(c_promises.as_ptr(), ptr::null()) };
        if rc == -1 {
            return Err(SandboxError::Pledge {
                promises,
                source: io::Error::last_os_error(),
            });
        }

        debug!(promises = %promises, "pledge");
        Ok(())
    }
}
