use std::path::PathBuf;

pub const DAEMON_TCP_PORT: u16 = 9147;
const DAEMON_TCP_HOST: &str = "127.0.0.1";

pub fn daemon_address() -> String {
    format!("{}:{}", DAEMON_TCP_HOST, DAEMON_TCP_PORT)
}

/// IPC socket name for one mpv session.  Each session gets its own socket so
/// a dying player can never be confused with its replacement.
#[cfg(unix)]
pub fn mpv_socket_name(tag: u64) -> String {
    format!(
        "{}/televizor-mpv-{}-{}.sock",
        std::env::temp_dir().display(),
        std::process::id(),
        tag
    )
}

#[cfg(windows)]
pub fn mpv_socket_name(tag: u64) -> String {
    format!("televizor-mpv-{}-{}", std::process::id(), tag)
}

#[cfg(unix)]
pub fn mpv_socket_arg(tag: u64) -> String {
    format!("--input-ipc-server={}", mpv_socket_name(tag))
}

#[cfg(windows)]
pub fn mpv_socket_arg(tag: u64) -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", mpv_socket_name(tag))
}

pub fn data_dir() -> PathBuf {
    // Use ~/.local/share/televizor on all unix platforms (XDG layout, even on
    // macOS, for consistency with the config dir).
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("televizor")
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("televizor")
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("televizor")
    }
    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("televizor")
    }
}

#[cfg(unix)]
fn mpv_binary_name() -> &'static str {
    "mpv"
}

#[cfg(windows)]
fn mpv_binary_name() -> &'static str {
    "mpv.exe"
}

/// Find the mpv binary: beside the current executable first (portable
/// installs), then on PATH.
pub fn find_mpv_binary() -> Option<PathBuf> {
    let name = mpv_binary_name();

    if let Ok(current_exe) = std::env::current_exe() {
        if let Some(dir) = current_exe.parent() {
            let local = dir.join(name);
            if local.exists() {
                return Some(local);
            }
        }
    }

    let path = std::env::var("PATH").ok()?;
    #[cfg(unix)]
    let sep = ":";
    #[cfg(windows)]
    let sep = ";";
    for dir in path.split(sep) {
        let candidate = PathBuf::from(dir).join(name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}
