use std::path::{Path, PathBuf};

pub const DAEMON_SOCKET: &str = "docbot.sock";
pub const CONFIG_FILE: &str = "config.yaml";
pub const PID_FILE: &str = "docbot.pid";

pub fn docbot_root(home: &Path) -> PathBuf {
    home.join(".docbot")
}

pub fn resources_root(home: &Path) -> PathBuf {
    docbot_core::store::resources_root(home)
}

pub fn config_path(home: &Path) -> PathBuf {
    docbot_root(home).join(CONFIG_FILE)
}

pub fn run_dir(home: &Path) -> PathBuf {
    docbot_root(home).join("run")
}

pub fn pid_path(home: &Path) -> PathBuf {
    run_dir(home).join(PID_FILE)
}

pub fn socket_path(home: &Path) -> PathBuf {
    docbot_root(home).join(DAEMON_SOCKET)
}
