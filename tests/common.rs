//! Common test utilities and constants for the Seihon crate.
//!
//! Provides functions for setting up test directories, creating dummy media
//! files and sidecars, and reading back the packages a test produced.

use image::{Rgb, RgbImage};
use rand::{Rng, distributions::Alphanumeric};
use seihon::error::{Error, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

#[allow(dead_code)]
pub const TEST_TMP_DIR: &str = "tests/tmp";
#[allow(dead_code)]
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);
#[allow(dead_code)]
pub const LONG_TEST_TIMEOUT: Duration = Duration::from_secs(120);

/// A fresh base directory with empty `source` and `target` subdirectories.
#[allow(dead_code)]
pub struct TestDirs {
    pub base: PathBuf,
    pub source_dir: PathBuf,
    pub target_dir: PathBuf,
}

/// Creates a clean, uniquely named test directory with source and target subdirectories.
#[allow(dead_code)]
pub async fn setup_test_dirs(sub_path: &str) -> TestDirs {
    let rand_string: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let unique_sub_path = format!("{}-{}", sub_path, rand_string);
    let base = PathBuf::from(TEST_TMP_DIR).join(unique_sub_path);
    if base.exists() {
        fs::remove_dir_all(&base).await.unwrap();
    }
    let source_dir = base.join("source");
    let target_dir = base.join("target");

    fs::create_dir_all(&source_dir).await.unwrap();
    fs::create_dir_all(&target_dir).await.unwrap();

    TestDirs {
        base,
        source_dir,
        target_dir,
    }
}

/// Creates a solid-colour image; the format follows the file extension.
#[allow(dead_code)]
pub async fn create_dummy_image(path: &Path, color: Rgb<u8>, width: u32, height: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let img = RgbImage::from_pixel(width, height, color);
    let path_clone = path.to_path_buf();
    tokio::task::spawn_blocking(move || img.save(path_clone))
        .await
        .map_err(|e| Error::AsyncTaskError(e.to_string()))?
        .map_err(Error::Image)?;
    Ok(())
}

/// Creates a 100x150 red image.
#[allow(dead_code)]
pub async fn create_dummy_color_image(path: &Path) -> Result<()> {
    create_dummy_image(path, Rgb([255, 0, 0]), 100, 150).await
}

/// Writes a text file, creating parent directories.
#[allow(dead_code)]
pub async fn write_text(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, content).await?;
    Ok(())
}

/// Writes a JSON sidecar.
#[allow(dead_code)]
pub async fn write_sidecar(path: &Path, value: serde_json::Value) -> Result<()> {
    write_text(path, &serde_json::to_string_pretty(&value)?).await
}

/// Checks that a ZIP file exists and holds at least one entry.
#[allow(dead_code)]
pub async fn assert_valid_zip_file(path: &Path) {
    assert!(path.exists(), "Output ZIP file does not exist: {:?}", path);
    assert!(path.is_file(), "Output ZIP path is not a file: {:?}", path);
    let names = zip_entry_names(path);
    assert!(!names.is_empty(), "Output ZIP file is empty: {:?}", path);
}

/// Entry names in archive order.
#[allow(dead_code)]
pub fn zip_entry_names(path: &Path) -> Vec<String> {
    let file = std::fs::File::open(path).unwrap();
    let archive = zip::ZipArchive::new(file).unwrap();
    (0..archive.len())
        .filter_map(|i| archive.name_for_index(i).map(str::to_string))
        .collect()
}

/// Reads one entry as bytes, `None` when it does not exist.
#[allow(dead_code)]
pub fn read_zip_entry(path: &Path, name: &str) -> Option<Vec<u8>> {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let mut entry = archive.by_name(name).ok()?;
    let mut content = Vec::new();
    entry.read_to_end(&mut content).unwrap();
    Some(content)
}

/// Reads one entry as text; panics when it does not exist.
#[allow(dead_code)]
pub fn read_zip_text(path: &Path, name: &str) -> String {
    let bytes = read_zip_entry(path, name)
        .unwrap_or_else(|| panic!("{} missing from {:?}", name, path));
    String::from_utf8(bytes).unwrap()
}

/// Reads the ComicInfo.xml from a CBZ file.
#[allow(dead_code)]
pub fn get_comic_info_xml(cbz_path: &Path) -> String {
    read_zip_text(cbz_path, "ComicInfo.xml")
}

/// Whether the entry is stored without compression.
#[allow(dead_code)]
pub fn is_stored(path: &Path, name: &str) -> bool {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let entry = archive.by_name(name).unwrap();
    entry.compression() == zip::CompressionMethod::Stored
}
