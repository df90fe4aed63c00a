use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Node home layout
// ---------------------------------------------------------------------------

pub const DATA_DIR: &str = "data";
pub const UPGRADE_INFO_FILE: &str = "upgrade-info.json";

// ---------------------------------------------------------------------------
// Store keys
// ---------------------------------------------------------------------------

pub const STORE_PREFIX: &str = "upgrade/";
pub const PLAN_KEY: &str = "plan";
pub const DONE_PREFIX: &str = "done/";
pub const LAST_APPLIED_KEY: &str = "last_applied";
pub const VERSION_MAP_KEY: &str = "version_map";
pub const APP_VERSION_KEY: &str = "app_version";

pub fn data_dir(home: &Path) -> PathBuf {
    home.join(DATA_DIR)
}

/// The descriptor the halted node leaves for its supervisor.
pub fn upgrade_info_path(home: &Path) -> PathBuf {
    data_dir(home).join(UPGRADE_INFO_FILE)
}

pub fn done_key(name: &str) -> String {
    format!("{DONE_PREFIX}{name}")
}
