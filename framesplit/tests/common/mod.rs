// NOTE: every test will complain about the functions it doesn't use
#![allow(unused)]

use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use tempfile::TempDir;

/// Returns cargo's tmpdir
pub fn cargo_tmpdir() -> PathBuf {
    PathBuf::from(option_env!("CARGO_TARGET_TMPDIR").expect("no cargo tmpdir???"))
}

/// A fresh directory inside cargo's tmpdir, removed when dropped
pub fn tmp_dir() -> TempDir {
    TempDir::new_in(cargo_tmpdir()).expect("could not create temporary dir")
}

/// Renders `frames` frames of ffmpeg's test pattern into `name` inside cargo's tmpdir,
/// the container is decided by the extension. Returns None if the ffmpeg program can't
/// be run.
pub fn create_test_video(name: &str, frames: usize) -> Option<PathBuf> {
    let video = cargo_tmpdir().join(name);
    std::fs::remove_file(&video).ok();

    let status = Command::new("ffmpeg")
        .args(["-y", "-f", "lavfi", "-i", "testsrc=size=64x48:rate=25"])
        .args(["-frames:v", &frames.to_string()])
        .arg(&video)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .stdin(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Some(video),
        _ => {
            eprintln!("could not run ffmpeg, skipping");
            None
        }
    }
}

/// Sorted file names in `dir`
pub fn names_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("the dir exists")
        .map(|entry| {
            entry
                .expect("can read the dir")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    names.sort();
    names
}
