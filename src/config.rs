use std::{env, path::PathBuf};

use crate::error::AppError;

const DEFAULT_DB_FILE: &str = "ffqueue.db";
const DEFAULT_FFMPEG: &str = "ffmpeg";
const DEFAULT_FFPROBE: &str = "ffprobe";
const DEFAULT_LISTEN: &str = "0.0.0.0:3000";

/// Runtime settings, read from the environment (and `.env`) and optionally
/// overridden from the command line.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: PathBuf,
    pub ffmpeg: String,
    pub ffprobe: String,
    pub listen: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_FILE),
            ffmpeg: DEFAULT_FFMPEG.to_owned(),
            ffprobe: DEFAULT_FFPROBE.to_owned(),
            listen: DEFAULT_LISTEN.to_owned(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();
        Ok(Self {
            db_path: var_or("FFQUEUE_DB", defaults.db_path)?,
            ffmpeg: var_or("FFMPEG_PATH", defaults.ffmpeg)?,
            ffprobe: var_or("FFPROBE_PATH", defaults.ffprobe)?,
            listen: var_or("FFQUEUE_LISTEN", defaults.listen)?,
        })
    }
}

fn var_or<T: From<String>>(key: &str, default: T) -> Result<T, AppError> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Ok(value.into()),
        Ok(_) | Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(AppError::EnvConfig(err)),
    }
}
