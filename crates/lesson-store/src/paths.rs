use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "org";
pub const APP_ORG: &str = "lessonplanner";
pub const APP_NAME: &str = "lesson-store";

fn project_dirs() -> anyhow::Result<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))
}

pub fn data_dir() -> anyhow::Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

pub fn config_path() -> anyhow::Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("store.json"))
}

pub fn store_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("records.json"))
}

pub fn device_id_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("device_id"))
}
