//! Input collection
//!
//! Turns the paths given on the command line (files and directories) into
//! the ordered, de-duplicated list of videos a batch runs over.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Video file extensions accepted as input (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "flv", "wmv", "webm", "m4v"];

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            VIDEO_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn walk_directory(root: &Path, out: &mut Vec<PathBuf>) {
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            // Skip hidden directories, but allow the root itself
            !(entry.file_type().is_dir()
                && entry.depth() > 0
                && entry
                    .file_name()
                    .to_str()
                    .map(|name| name.starts_with('.'))
                    .unwrap_or(false))
        });

    for entry in walker {
        match entry {
            Ok(entry) if entry.file_type().is_file() && is_video_file(entry.path()) => {
                out.push(entry.into_path());
            }
            Ok(_) => {}
            Err(e) => warn!(root = %root.display(), error = %e, "skipping unreadable entry"),
        }
    }
}

/// Expand files and directories into the list of input videos.
///
/// - Existing files are kept when they carry a video extension
/// - Directories are walked recursively, hidden subdirectories skipped,
///   entries in file name order
/// - Relative paths are made absolute
/// - Duplicates are dropped, keeping the first occurrence
pub fn collect_inputs(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for path in paths {
        let path = absolute(path);
        if path.is_dir() {
            walk_directory(&path, &mut found);
        } else if !path.exists() {
            warn!(path = %path.display(), "input does not exist");
        } else if is_video_file(&path) {
            found.push(path);
        } else {
            debug!(path = %path.display(), "not a video file, ignoring");
        }
    }

    let mut seen = HashSet::new();
    found.retain(|p| seen.insert(p.clone()));
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    #[test]
    fn test_is_video_file() {
        assert!(is_video_file(Path::new("/media/movie.mkv")));
        assert!(is_video_file(Path::new("/media/movie.MKV"))); // case-insensitive
        assert!(is_video_file(Path::new("/media/movie.Mp4")));
        assert!(is_video_file(Path::new("/media/clip.webm")));
        assert!(is_video_file(Path::new("/media/clip.flv")));
        assert!(!is_video_file(Path::new("/media/movie.txt")));
        assert!(!is_video_file(Path::new("/media/movie.ts")));
        assert!(!is_video_file(Path::new("/media/movie")));
    }

    #[test]
    fn test_collect_walks_directories_and_skips_hidden() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::create_dir_all(root.join(".cache")).unwrap();
        File::create(root.join("b.mp4")).unwrap();
        File::create(root.join("a.MOV")).unwrap();
        File::create(root.join("notes.txt")).unwrap();
        File::create(root.join("sub/c.mkv")).unwrap();
        File::create(root.join(".cache/hidden.mp4")).unwrap();

        let inputs = collect_inputs(&[root.to_path_buf()]);

        assert_eq!(
            inputs,
            vec![root.join("a.MOV"), root.join("b.mp4"), root.join("sub/c.mkv")]
        );
    }

    #[test]
    fn test_collect_keeps_explicit_files_in_order_without_duplicates() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.mp4");
        let b = temp.path().join("b.avi");
        File::create(&a).unwrap();
        File::create(&b).unwrap();

        let inputs = collect_inputs(&[b.clone(), a.clone(), b.clone(), temp.path().to_path_buf()]);

        assert_eq!(inputs, vec![b, a]);
    }

    #[test]
    fn test_collect_ignores_missing_and_non_video() {
        let temp = TempDir::new().unwrap();
        let txt = temp.path().join("readme.txt");
        File::create(&txt).unwrap();

        let inputs = collect_inputs(&[txt, temp.path().join("gone.mp4")]);
        assert!(inputs.is_empty());
    }

    #[test]
    fn test_relative_paths_become_absolute() {
        let path = absolute(Path::new("relative-clip.mp4"));
        assert!(path.is_absolute());
        assert!(path.ends_with("relative-clip.mp4"));
        assert_eq!(absolute(Path::new("/v/a.mp4")), PathBuf::from("/v/a.mp4"));
    }

    proptest! {
        #[test]
        fn prop_extension_matching_is_case_insensitive(
            stem in "[a-z0-9_]{1,10}",
            idx in 0usize..8,
            upper in proptest::bool::ANY,
        ) {
            let ext = if upper {
                VIDEO_EXTENSIONS[idx].to_uppercase()
            } else {
                VIDEO_EXTENSIONS[idx].to_string()
            };
            let path = PathBuf::from(format!("/v/{}.{}", stem, ext));
            prop_assert!(is_video_file(&path));
        }
    }
}
