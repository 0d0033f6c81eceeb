//! Unit tests for core Seihon functionality.
//!
//! Tests individual components against real directories without running a
//! full build.

use seihon::collector::collect_source;
use seihon::error::{Error, Result};
use seihon::prelude::*;
use seihon::types::get_file_info;
use serde_json::json;

mod common;
use common::{create_dummy_color_image, setup_test_dirs, write_sidecar, write_text};

fn file_names(paths: &[PathBuf], root: &Path) -> Vec<String> {
    paths
        .iter()
        .map(|p| {
            p.strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect()
}

#[tokio::test]
async fn test_seihon_config_builder_validation() -> Result<()> {
    let result = SeihonConfig::builder().language("  ").build();
    assert!(result.is_err());
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("Language must not be empty")
    );

    let result = SeihonConfig::builder().cover_width(0u32).build();
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("Cover width must be greater than zero")
    );

    let result = SeihonConfig::builder()
        .wrapper_names(vec!["userstuff".to_string(), " ".to_string()])
        .build();
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("Wrapper names must not be blank")
    );

    let config = SeihonConfig::builder().build()?;
    assert_eq!(config.language, "en");
    assert_eq!(config.cover_width, 1200);
    assert!(config.create_output_directory);
    assert!(!config.overwrite);
    assert_eq!(config.batch_policy, BatchPolicy::ContinueOnError);
    Ok(())
}

#[tokio::test]
async fn test_seihon_config_preflight_check() -> Result<()> {
    let test_dirs = setup_test_dirs("preflight_check").await;

    let config = SeihonConfig::builder()
        .source_path(test_dirs.source_dir.clone())
        .target_path(test_dirs.target_dir.clone())
        .build()?;
    assert!(config.preflight_check().is_ok());

    let config = SeihonConfig::builder()
        .target_path(test_dirs.target_dir.clone())
        .build()?;
    let result = config.preflight_check();
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("`source_path` must be set")
    );

    let config = SeihonConfig::builder()
        .source_path(test_dirs.source_dir.clone())
        .build()?;
    let result = config.preflight_check();
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("Target path is required")
    );

    let config = SeihonConfig::builder()
        .source_path(test_dirs.source_dir.join("nonexistent"))
        .target_path(test_dirs.target_dir.clone())
        .build()?;
    assert!(matches!(config.preflight_check(), Err(Error::NotFound(_))));

    let file = test_dirs.source_dir.join("plain.txt");
    write_text(&file, "not a directory").await?;
    let config = SeihonConfig::builder()
        .source_path(file)
        .target_path(test_dirs.target_dir.clone())
        .build()?;
    assert!(matches!(
        config.preflight_check(),
        Err(Error::InvalidPath(_, _))
    ));
    Ok(())
}

#[tokio::test]
async fn test_collect_source_listing() -> Result<()> {
    let test_dirs = setup_test_dirs("collect_source").await;
    let root = &test_dirs.source_dir;
    create_dummy_color_image(&root.join("b.png")).await?;
    create_dummy_color_image(&root.join("a.png")).await?;
    write_sidecar(&root.join("a.json"), json!({"title": "A"})).await?;
    write_text(&root.join(".DS_Store"), "junk").await?;
    create_dummy_color_image(&root.join("sub10").join("x.png")).await?;
    create_dummy_color_image(&root.join("sub2").join("y.png")).await?;
    create_dummy_color_image(&root.join(".cache").join("z.png")).await?;

    let listing = collect_source(root).await?;
    assert_eq!(file_names(&listing.media, root), vec!["a.png", "b.png"]);
    assert_eq!(file_names(&listing.sidecars, root), vec!["a.json"]);
    assert_eq!(
        file_names(&listing.tree, root),
        vec!["a.json", "a.png", "b.png", "sub2/y.png", "sub10/x.png"]
    );
    assert!(listing.is_images_only());
    assert_eq!(listing.eligible(FileFormat::Epub).len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_collect_source_rejects_files() -> Result<()> {
    let test_dirs = setup_test_dirs("collect_source_file").await;
    let file = test_dirs.source_dir.join("a.txt");
    write_text(&file, "text").await?;
    assert!(matches!(
        collect_source(&file).await,
        Err(Error::InvalidPath(_, _))
    ));
    Ok(())
}

#[tokio::test]
async fn test_default_chapters_from_directory() -> Result<()> {
    let test_dirs = setup_test_dirs("default_chapters").await;
    let root = &test_dirs.source_dir;
    write_text(&root.join("ch10.txt"), "ten").await?;
    write_text(&root.join("ch2.txt"), "two").await?;
    write_text(&root.join("ch1.html"), "<p>one</p>").await?;
    create_dummy_color_image(&root.join("img.png")).await?;
    write_sidecar(&root.join("ch1.json"), json!({})).await?;
    write_text(&root.join("clip.mp4"), "video").await?;
    write_text(&root.join(".hidden.txt"), "hidden").await?;
    write_text(&root.join("extra").join("ch0.txt"), "nested").await?;

    let chapters = default_chapters(root, FileFormat::Epub).await?;
    let titles: Vec<&str> = chapters.units().iter().map(|u| u.title.as_str()).collect();
    assert_eq!(titles, vec!["ch1", "ch2", "ch10", "img"]);
    assert!(chapters.units().iter().all(|u| u.include && !u.is_cover));

    let images_only = default_chapters(root, FileFormat::Cbz).await?;
    assert_eq!(images_only.len(), 1);

    let grouped = chapters.group(&[1, 2]);
    assert_eq!(grouped.len(), 3);
    assert_eq!(grouped.units()[1].title, "ch2");
    assert_eq!(grouped.units()[1].source_files.len(), 2);
    assert_eq!(grouped.separate(1), chapters);
    Ok(())
}

#[tokio::test]
async fn test_default_chapters_without_media() -> Result<()> {
    let test_dirs = setup_test_dirs("default_chapters_empty").await;
    write_sidecar(&test_dirs.source_dir.join("info.json"), json!({"title": "x"})).await?;
    let result = default_chapters(&test_dirs.source_dir, FileFormat::Epub).await;
    assert!(matches!(result, Err(Error::MissingSourceMedia(_, 0))));
    Ok(())
}

#[tokio::test]
async fn test_resolve_metadata_fallbacks_and_overrides() -> Result<()> {
    let test_dirs = setup_test_dirs("resolve_metadata").await;
    let root = &test_dirs.source_dir;
    write_text(&root.join("story.txt"), "Once.").await?;

    let listing = collect_source(root).await?;
    let config = SeihonConfig::builder().language("de").build()?;
    let metadata = config.resolve_metadata(&listing, FileFormat::Epub).await;
    assert_eq!(metadata.title.as_deref(), Some("source"));
    assert_eq!(metadata.language.as_deref(), Some("de"));
    assert_eq!(metadata.age_rating, AgeRating::Unknown);

    write_sidecar(
        &root.join("story.json"),
        json!({
            "title": "From Sidecar",
            "url": "https://archiveofourown.org/works/1",
            "rating": "Mature",
            "language": "fr"
        }),
    )
    .await?;
    let listing = collect_source(root).await?;
    let config = SeihonConfig::builder()
        .metadata_overrides(CanonicalMetadata {
            series: Some("Saga".to_string()),
            series_number: Some("3".to_string()),
            ..Default::default()
        })
        .build()?;
    let metadata = config.resolve_metadata(&listing, FileFormat::Epub).await;
    assert_eq!(metadata.title.as_deref(), Some("From Sidecar"));
    assert_eq!(metadata.publisher.as_deref(), Some("Archive of Our Own"));
    assert_eq!(metadata.age_rating, AgeRating::Mature17Plus);
    assert_eq!(metadata.series.as_deref(), Some("Saga"));
    assert_eq!(metadata.series_number.as_deref(), Some("3"));
    Ok(())
}

#[tokio::test]
async fn test_archive_codec_open_errors() -> Result<()> {
    let test_dirs = setup_test_dirs("archive_open").await;
    let missing = test_dirs.target_dir.join("missing.cbz");
    assert!(matches!(
        ArchiveCodec::open(&missing).await,
        Err(Error::NotFound(_))
    ));

    let not_a_zip = test_dirs.target_dir.join("broken.cbz");
    write_text(&not_a_zip, "definitely not a zip").await?;
    assert!(matches!(
        ArchiveCodec::open(&not_a_zip).await,
        Err(Error::Zip(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_get_file_info_utility() -> Result<()> {
    assert_eq!(get_file_info(Path::new("a/B.JPEG"))?, ("jpg", "image/jpeg"));
    assert_eq!(get_file_info(Path::new("page.webp"))?, ("webp", "image/webp"));
    assert!(matches!(
        get_file_info(Path::new("notes.txt")),
        Err(Error::Unsupported(_))
    ));
    Ok(())
}
