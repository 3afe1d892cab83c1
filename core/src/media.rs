use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{Error, Result};

/// Where recipe images land, relative to the media root.
pub const RECIPE_UPLOAD_DIR: &str = "uploads/recipe";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ImageFormat {
    /// Sniff the format from magic bytes. The client-supplied filename and
    /// content type are not trusted.
    #[must_use]
    pub fn detect(data: &[u8]) -> Option<Self> {
        match data {
            [0xFF, 0xD8, 0xFF, ..] => Some(Self::Jpeg),
            [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some(Self::Png),
            [b'G', b'I', b'F', b'8', b'7' | b'9', b'a', ..] => Some(Self::Gif),
            [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some(Self::Webp),
            _ => None,
        }
    }

    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Webp => "webp",
        }
    }
}

/// Filesystem-backed image storage rooted at the media directory.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate and write a recipe image under a fresh UUID name.
    ///
    /// Returns the path relative to the media root, with `/` separators.
    pub fn save_recipe_image(&self, data: &[u8]) -> Result<String> {
        let format = ImageFormat::detect(data).ok_or_else(|| {
            Error::validation(
                "Upload a valid image. The file you uploaded was either not an image or a corrupted image.",
            )
        })?;

        let dir = self.root.join(RECIPE_UPLOAD_DIR);
        fs::create_dir_all(&dir)?;

        let file_name = format!("{}.{}", Uuid::new_v4(), format.extension());
        fs::write(dir.join(&file_name), data)?;

        Ok(format!("{RECIPE_UPLOAD_DIR}/{file_name}"))
    }

    #[must_use]
    pub fn path_for(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Delete a stored image. A file that is already gone is not an error.
    pub fn remove(&self, relative: &str) -> Result<()> {
        match fs::remove_file(self.path_for(relative)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
