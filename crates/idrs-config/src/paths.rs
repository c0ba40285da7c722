use std::path::PathBuf;

/// XDG app name used for the default state directory.
pub const APP_NAME: &str = "idrs";

fn project_state_dir(app_name: &str) -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", app_name).map(|dirs| {
        dirs.state_dir()
            .unwrap_or_else(|| dirs.data_local_dir())
            .to_path_buf()
    })
}

/// Default snapshot directory: `<state dir>/resources`.
///
/// `None` when the platform exposes no home directory.
pub fn default_data_dir() -> Option<PathBuf> {
    project_state_dir(APP_NAME).map(|dir| dir.join("resources"))
}
