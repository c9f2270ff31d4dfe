use std::path::PathBuf;

pub const DAEMON_TCP_PORT: u16 = 9876;

const APP_DIR: &str = "radio";

/// IPC endpoint name of the mpv process backing playback slot `index`.
#[cfg(unix)]
pub fn mpv_socket_name(index: usize) -> String {
    format!("{}/radio-mpv-{}.sock", std::env::temp_dir().display(), index)
}

#[cfg(windows)]
pub fn mpv_socket_name(index: usize) -> String {
    format!("radio-mpv-{}", index)
}

#[cfg(unix)]
pub fn mpv_socket_arg(index: usize) -> String {
    format!("--input-ipc-server={}", mpv_socket_name(index))
}

#[cfg(windows)]
pub fn mpv_socket_arg(index: usize) -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", mpv_socket_name(index))
}

/// `<exe dir>/<marker>`'s directory when a portable install ships one.
#[cfg(windows)]
fn portable_dir(marker: &str) -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;
    dir.join(marker).exists().then(|| dir.to_path_buf())
}

/// XDG-style `~/<rel>/radio` on unix, the platform dir elsewhere.
#[cfg(unix)]
fn app_dir(rel: &[&str], _platform: Option<PathBuf>) -> PathBuf {
    let mut dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
    for part in rel {
        dir.push(part);
    }
    dir.join(APP_DIR)
}

#[cfg(windows)]
fn app_dir(_rel: &[&str], platform: Option<PathBuf>) -> PathBuf {
    platform.unwrap_or_else(|| PathBuf::from(".")).join(APP_DIR)
}

pub fn data_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Some(dir) = portable_dir("data") {
            return dir.join("data");
        }
    }
    app_dir(&[".local", "share"], dirs::data_local_dir())
}

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Some(dir) = portable_dir("config.toml") {
            return dir;
        }
    }
    app_dir(&[".config"], dirs::config_dir())
}

#[cfg(unix)]
pub fn mpv_binary_name() -> &'static str {
    "mpv"
}

#[cfg(windows)]
pub fn mpv_binary_name() -> &'static str {
    "mpv.exe"
}

fn existing(path: PathBuf) -> Option<PathBuf> {
    path.exists().then_some(path)
}

fn find_beside_exe(name: &str) -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;
    existing(dir.join(name)).or_else(|| existing(dir.join("external").join(name)))
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).find_map(|dir| existing(dir.join(name)))
}

/// Locate mpv: `MPV_PATH`, then beside the executable, then `PATH`.
pub fn find_mpv_binary() -> Option<PathBuf> {
    std::env::var_os("MPV_PATH")
        .map(PathBuf::from)
        .and_then(existing)
        .or_else(|| find_beside_exe(mpv_binary_name()))
        .or_else(|| find_on_path(mpv_binary_name()))
}
