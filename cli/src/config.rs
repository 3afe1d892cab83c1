use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::PathBuf;

pub struct Config {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub media_dir: PathBuf,
}

impl Config {
    /// Resolve the data and media directories, creating them if needed.
    ///
    /// Without an explicit `data_dir` the platform data directory for
    /// `cookbook` is used. The media directory defaults to `<data_dir>/media`.
    pub fn load(data_dir: Option<PathBuf>, media_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => ProjectDirs::from("", "", "cookbook")
                .context("Could not determine home directory")?
                .data_dir()
                .to_path_buf(),
        };
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let media_dir = media_dir.unwrap_or_else(|| data_dir.join("media"));
        std::fs::create_dir_all(&media_dir).with_context(|| {
            format!("Failed to create media directory: {}", media_dir.display())
        })?;

        let db_path = data_dir.join("cookbook.db");

        Ok(Config {
            data_dir,
            db_path,
            media_dir,
        })
    }
}
