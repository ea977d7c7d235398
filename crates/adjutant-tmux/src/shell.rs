//! Executable resolution utilities.

use std::{
    collections::HashSet,
    env::{join_paths, split_paths},
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::process::Command;

const PATH_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolve an executable by name, falling back to the login shell's PATH.
///
/// The search order is:
/// 1. Explicit paths (absolute or containing a separator).
/// 2. The current process PATH via `which`.
/// 3. The PATH a login shell would see (services started by launchd or
///    systemd often run with a minimal PATH that lacks Homebrew and friends).
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }

    if let Some(found) = which_async(executable, None).await {
        return Some(found);
    }

    let refreshed = login_shell_path().await?;
    let existing = std::env::var_os("PATH").unwrap_or_default();
    let merged = merge_paths(&existing, OsString::from(&refreshed));
    tracing::debug!(?merged, "Searching refreshed PATH for {executable}");
    which_async(executable, Some(merged)).await
}

/// Merge two PATH strings into a single, de-duplicated PATH.
#[must_use]
pub fn merge_paths(primary: impl AsRef<OsStr>, secondary: impl AsRef<OsStr>) -> OsString {
    let mut seen = HashSet::<PathBuf>::new();
    let mut merged = Vec::<PathBuf>::new();

    for p in split_paths(primary.as_ref()).chain(split_paths(secondary.as_ref())) {
        if !p.as_os_str().is_empty() && seen.insert(p.clone()) {
            merged.push(p);
        }
    }

    join_paths(merged).unwrap_or_default()
}

async fn which_async(executable: &str, path: Option<OsString>) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || match path {
        Some(path) => {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
            which::which_in(executable, Some(path), cwd)
        }
        None => which::which(executable),
    })
    .await
    .ok()
    .and_then(Result::ok)
}

/// The user's login shell from `$SHELL`, or `/bin/sh`.
#[must_use]
pub fn login_shell() -> PathBuf {
    std::env::var_os("SHELL")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute() && p.is_file())
        .unwrap_or_else(|| PathBuf::from("/bin/sh"))
}

fn source_command(shell: &Path) -> Option<String> {
    let home = dirs::home_dir()?;
    let rc = match shell.file_name().and_then(OsStr::to_str) {
        Some("zsh") => home.join(".zshrc"),
        Some("bash") => home.join(".bashrc"),
        _ => return None,
    };
    if !rc.is_file() {
        return None;
    }
    let rc_str = rc.to_string_lossy();
    let escaped = shlex::try_quote(rc_str.as_ref()).ok()?;
    Some(format!("source {escaped}"))
}

async fn login_shell_path() -> Option<String> {
    let shell = login_shell();
    let mut cmd = Command::new(&shell);
    cmd.arg("-l");
    if let Some(source) = source_command(&shell) {
        cmd.arg("-c")
            .arg(format!("{source} >/dev/null 2>&1; printf '%s' \"$PATH\""));
    } else {
        cmd.arg("-c").arg("printf '%s' \"$PATH\"");
    }
    cmd.env("TERM", "dumb")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let child = cmd.spawn().ok()?;
    let output = match tokio::time::timeout(PATH_REFRESH_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            tracing::debug!(shell = %shell.display(), ?err, "Failed to read PATH from login shell");
            return None;
        }
        Err(_) => {
            tracing::warn!(shell = %shell.display(), "Timed out reading PATH from login shell");
            return None;
        }
    };

    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8(output.stdout).ok()?.trim().to_string();
    (!path.is_empty()).then_some(path)
}
