/*
 * Standard per-user locations: where the configuration lives and where exported
 * layers go by default.
 */
use directories::{ProjectDirs, UserDirs};
use std::fs;
use std::path::PathBuf;

pub const OUTPUT_DIR_NAME: &str = "layer_export";

/*
 * The local (non-roaming) configuration directory for `app_name`, created if it
 * does not exist yet. `None` when the platform has no such directory or it cannot
 * be created.
 */
pub fn get_base_app_config_local_dir(app_name: &str) -> Option<PathBuf> {
    let proj_dirs = ProjectDirs::from("", "", app_name)?;
    let config_path = proj_dirs.config_local_dir();
    if !config_path.exists() {
        if let Err(e) = fs::create_dir_all(config_path) {
            log::error!("PathUtils: Failed to create config directory {config_path:?}: {e}");
            return None;
        }
        log::debug!("PathUtils: Created config directory {config_path:?}");
    }
    Some(config_path.to_path_buf())
}

/*
 * Default export location: `layer_export` on the user's desktop, or in the home
 * directory when the platform reports no desktop. The directory is not created
 * here; the export sink does that when it is opened.
 */
pub fn default_output_dir() -> Option<PathBuf> {
    let user_dirs = UserDirs::new()?;
    let base = user_dirs
        .desktop_dir()
        .unwrap_or_else(|| user_dirs.home_dir())
        .to_path_buf();
    log::trace!("PathUtils: Default output base directory is {base:?}");
    Some(base.join(OUTPUT_DIR_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ProjectDirs/UserDirs results depend on the environment the tests run in.

    #[test]
    fn test_config_dir_is_created_and_stable() {
        let unique_app_name = format!("TestApp_LayerSorterPaths_{}", rand::random::<u128>());

        let first = get_base_app_config_local_dir(&unique_app_name)
            .expect("config directory should be available");
        assert!(first.is_dir());
        assert!(
            first
                .to_string_lossy()
                .to_lowercase()
                .contains(&unique_app_name.to_lowercase())
        );
        assert_eq!(get_base_app_config_local_dir(&unique_app_name), Some(first.clone()));

        if let Err(e) = fs::remove_dir_all(&first) {
            eprintln!("Test cleanup failed for {first:?}: {e}");
        }
    }

    #[test]
    fn test_default_output_dir_ends_with_export_folder() {
        if let Some(dir) = default_output_dir() {
            assert!(dir.ends_with(OUTPUT_DIR_NAME));
        }
    }
}
