//! Opens the system browser for interactive authorization.

use crate::error::{AuthError, AuthResult};

/// Open `url` in the default browser.
///
/// Spawns the platform opener and returns without waiting for it. Callers
/// treat failure as non-fatal: the authorization URL is always logged so the
/// user can open it by hand.
pub fn open(url: &str) -> AuthResult<()> {
    let result = {
        #[cfg(target_os = "macos")]
        {
            std::process::Command::new("open").arg(url).spawn()
        }
        #[cfg(target_os = "windows")]
        {
            std::process::Command::new("cmd")
                .args(["/C", "start", "", url])
                .spawn()
        }
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            std::process::Command::new("xdg-open").arg(url).spawn()
        }
    };

    result.map(|_| ()).map_err(|e| AuthError::Browser(e.to_string()))
}
