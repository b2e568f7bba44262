use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

/// How long to sleep between failed attempts while polling
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Socket file the agent publishes when no name is given
pub const DEFAULT_SOCKET_NAME: &str = "S.gpg-agent";

#[cfg(windows)]
const APP_DATA_ENV: &str = "APPDATA";
#[cfg(not(windows))]
const HOME_ENV: &str = "HOME";
#[cfg(not(windows))]
const GNUPG_HOME_ENV: &str = "GNUPGHOME";

const AGENT_SUBDIR: &str = "gnupg";

/// Directory the agent publishes its handshake files into.
///
/// On Windows this is `%APPDATA%\gnupg`. Elsewhere `$GNUPGHOME` wins, falling
/// back to `$HOME/.gnupg`, and finally to a relative `.gnupg`.
pub fn agent_dir() -> PathBuf {
    #[cfg(windows)]
    {
        let base = env::var_os(APP_DATA_ENV).map(PathBuf::from).unwrap_or_default();
        base.join(AGENT_SUBDIR)
    }

    #[cfg(not(windows))]
    {
        if let Some(dir) = env::var_os(GNUPG_HOME_ENV).filter(|d| !d.is_empty()) {
            return PathBuf::from(dir);
        }
        let base = env::var_os(HOME_ENV).map(PathBuf::from).unwrap_or_default();
        base.join(format!(".{AGENT_SUBDIR}"))
    }
}

/// Resolves the handshake file for an Assuan target.
///
/// Absolute paths are used as given. A relative name is looked up inside
/// [`agent_dir`]; with no name at all the default agent socket is used.
pub fn resolve_handshake_path(target: Option<&str>) -> PathBuf {
    resolve_in(&agent_dir(), target)
}

fn resolve_in(dir: &Path, target: Option<&str>) -> PathBuf {
    let name = target.filter(|t| !t.is_empty()).unwrap_or(DEFAULT_SOCKET_NAME);
    let path = Path::new(name);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}
