//! Locating images and their label files on disk.

use crate::types::{BurnDatasetError, DatasetResult};
use std::ffi::OsStr;
use std::fs;
use std::path::{Component, Path, PathBuf};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Images listed by `source`: either a directory of images or a text file
/// with one image path per line (relative entries resolve against the list's directory).
pub fn index_images(source: &Path) -> DatasetResult<Vec<PathBuf>> {
    let mut files = if source.is_dir() {
        let entries = fs::read_dir(source).map_err(|e| BurnDatasetError::Io {
            path: source.to_path_buf(),
            source: e,
        })?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BurnDatasetError::Io {
                path: source.to_path_buf(),
                source: e,
            })?;
            let path = entry.path();
            if path.is_file() && is_image(&path) {
                files.push(path);
            }
        }
        files
    } else {
        let text = fs::read_to_string(source).map_err(|e| BurnDatasetError::Io {
            path: source.to_path_buf(),
            source: e,
        })?;
        let base = source.parent().unwrap_or_else(|| Path::new("."));
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| {
                let p = PathBuf::from(l);
                if p.is_absolute() {
                    p
                } else {
                    base.join(p)
                }
            })
            .filter(|p| is_image(p))
            .collect()
    };
    files.sort();
    if files.is_empty() {
        return Err(BurnDatasetError::Empty {
            path: source.to_path_buf(),
        });
    }
    Ok(files)
}

/// `.../images/.../name.png` -> `.../labels/.../name.txt`, replacing the last `images` component.
pub fn label_path_for(image: &Path) -> PathBuf {
    let components: Vec<Component> = image.components().collect();
    let last_images = components
        .iter()
        .rposition(|c| c.as_os_str() == OsStr::new("images"));
    let mut out = PathBuf::new();
    for (i, c) in components.iter().enumerate() {
        if Some(i) == last_images {
            out.push("labels");
        } else {
            out.push(c.as_os_str());
        }
    }
    out.set_extension("txt");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_path_swaps_last_images_component() {
        let p = label_path_for(Path::new("/data/images/kitti/images/0001.png"));
        assert_eq!(p, PathBuf::from("/data/images/kitti/labels/0001.txt"));
    }

    #[test]
    fn label_path_without_images_dir_keeps_directory() {
        let p = label_path_for(Path::new("frames/a.jpg"));
        assert_eq!(p, PathBuf::from("frames/a.txt"));
    }
}
