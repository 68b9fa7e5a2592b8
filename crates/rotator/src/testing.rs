//! Test fixtures: shell scripts standing in for the encoder binary.

use std::fs;
use std::path::{Path, PathBuf};

/// Shell snippet that creates the file named by the last argument.
pub const TOUCH_OUTPUT: &str = r#"for last; do :; done
: > "$last""#;

/// Write an executable `/bin/sh` script named `name` into `dir`.
#[cfg(unix)]
pub fn fake_encoder(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Create empty input files and return their paths.
pub fn touch_inputs(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
    names
        .iter()
        .map(|name| {
            let path = dir.join(name);
            fs::write(&path, b"").unwrap();
            path
        })
        .collect()
}
