//! Tests for rewriting the metadata of existing packages.

use std::io::Write;

use seihon::error::{Error, Result};
use seihon::prelude::*;
use tokio::time::timeout;

mod common;
use common::{
    TEST_TIMEOUT, create_dummy_color_image, get_comic_info_xml, is_stored, read_zip_entry,
    read_zip_text, setup_test_dirs, write_text, zip_entry_names,
};

/// Builds a package from `files` (name, text content; images for `.png`).
async fn build_package(
    base: &Path,
    name: &str,
    files: &[(&str, &str)],
) -> Result<PathBuf> {
    let source = base.join("sources").join(name);
    for (file, content) in files {
        let path = source.join(file);
        if file.ends_with(".png") {
            create_dummy_color_image(&path).await?;
        } else {
            write_text(&path, content).await?;
        }
    }
    let target = base.join("packages");
    tokio::fs::create_dir_all(&target).await?;
    let report = SeihonConfig::builder()
        .source_path(source)
        .target_path(target)
        .create_output_directory(false)
        .build()?
        .convert_from_source()
        .await?;
    Ok(report.output_path)
}

fn updater(overrides: CanonicalMetadata) -> SeihonConfigBuilder {
    let mut builder = SeihonConfig::builder();
    builder.metadata_overrides(overrides);
    builder
}

fn titled(title: &str) -> CanonicalMetadata {
    CanonicalMetadata::with_title(title)
}

fn entry_bytes(path: &Path) -> Vec<(String, Vec<u8>)> {
    zip_entry_names(path)
        .into_iter()
        .map(|name| {
            let bytes = read_zip_entry(path, &name).unwrap();
            (name, bytes)
        })
        .collect()
}

async fn assert_no_scratch_dirs(dir: &Path) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        assert!(
            !entry.file_name().to_string_lossy().starts_with(".seihon-"),
            "scratch directory left behind in {:?}",
            dir
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_noop_update_leaves_file_untouched() -> Result<()> {
    let dirs = setup_test_dirs("update_noop").await;
    let cbz = build_package(&dirs.base, "Comic", &[("1.png", ""), ("2.png", "")]).await?;
    let before = tokio::fs::read(&cbz).await?;

    let report = timeout(
        TEST_TIMEOUT,
        updater(CanonicalMetadata::default()).build()?.update_archive(&cbz),
    )
    .await
    .expect("Test timed out")?;
    assert_eq!(report.outcome, BuildOutcome::Unchanged);
    assert_eq!(report.format, FileFormat::Cbz);

    // An override equal to what is stored changes nothing either.
    let report = updater(titled("Comic")).build()?.update_archive(&cbz).await?;
    assert_eq!(report.outcome, BuildOutcome::Unchanged);
    assert_eq!(tokio::fs::read(&cbz).await?, before);
    Ok(())
}

#[tokio::test]
async fn test_cbz_update_rewrites_only_comic_info() -> Result<()> {
    let dirs = setup_test_dirs("update_cbz").await;
    let cbz = build_package(&dirs.base, "Comic", &[("1.png", ""), ("2.png", "")]).await?;
    let before = entry_bytes(&cbz);

    let overrides = CanonicalMetadata {
        title: Some("Renamed".to_string()),
        age_rating: AgeRating::Teen,
        ..Default::default()
    };
    let report = updater(overrides).build()?.update_archive(&cbz).await?;
    assert_eq!(report.outcome, BuildOutcome::Replaced);
    assert_eq!(report.output_path, cbz);

    let metadata = ArchiveCodec::open(&cbz).await?.read_metadata().await?;
    assert_eq!(metadata.title.as_deref(), Some("Renamed"));
    assert_eq!(metadata.age_rating, AgeRating::Teen);
    assert_eq!(metadata.page_count, Some(2));
    assert_eq!(metadata.language.as_deref(), Some("en"));

    let after = entry_bytes(&cbz);
    let names: Vec<&str> = after.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["ComicInfo.xml", "1.png", "2.png"]);
    for ((name, old), (_, new)) in before.iter().zip(after.iter()) {
        if name != "ComicInfo.xml" {
            assert_eq!(old, new, "{} changed", name);
        }
    }
    assert!(get_comic_info_xml(&cbz).contains("<AgeRating>Teen</AgeRating>"));
    assert_no_scratch_dirs(cbz.parent().unwrap()).await
}

#[tokio::test]
async fn test_cbz_without_comic_info_gets_one_appended() -> Result<()> {
    let dirs = setup_test_dirs("update_bare_cbz").await;
    let cbz = dirs.target_dir.join("bare.cbz");
    let mut writer = zip::ZipWriter::new(std::fs::File::create(&cbz)?);
    writer.start_file("p1.jpg", zip::write::SimpleFileOptions::default())?;
    writer.write_all(b"not really a jpeg")?;
    writer.finish()?;

    let codec = ArchiveCodec::open(&cbz).await?;
    assert_eq!(codec.format(), FileFormat::Cbz);
    assert_eq!(codec.read_metadata().await?, CanonicalMetadata::default());

    let report = updater(titled("Bare")).build()?.update_archive(&cbz).await?;
    assert_eq!(report.outcome, BuildOutcome::Replaced);
    assert_eq!(zip_entry_names(&cbz), vec!["p1.jpg", "ComicInfo.xml"]);
    assert!(get_comic_info_xml(&cbz).contains("<Title>Bare</Title>"));
    Ok(())
}

#[tokio::test]
async fn test_epub_update_rewrites_opf_and_ncx() -> Result<()> {
    let dirs = setup_test_dirs("update_epub").await;
    let epub = build_package(
        &dirs.base,
        "Novel",
        &[("0.png", ""), ("1.txt", "First."), ("2.txt", "Second.")],
    )
    .await?;
    let before = entry_bytes(&epub);

    let overrides = CanonicalMetadata {
        title: Some("Retitled".to_string()),
        writers: Some(vec!["Author".to_string()]),
        ..Default::default()
    };
    let report = updater(overrides).build()?.update_archive(&epub).await?;
    assert_eq!(report.outcome, BuildOutcome::Replaced);
    assert_eq!(report.format, FileFormat::Epub);

    let metadata = ArchiveCodec::open(&epub).await?.read_metadata().await?;
    assert_eq!(metadata.title.as_deref(), Some("Retitled"));
    assert_eq!(metadata.writers, Some(vec!["Author".to_string()]));

    let names = zip_entry_names(&epub);
    assert_eq!(names[0], "mimetype");
    assert!(is_stored(&epub, "mimetype"));

    let opf = read_zip_text(&epub, "EPUB/content.opf");
    assert!(opf.contains("<dc:title>Retitled</dc:title>"));
    assert!(opf.contains("properties=\"cover-image\""));
    assert!(opf.contains("<itemref idref=\"item1\"/>"));
    let ncx = read_zip_text(&epub, "EPUB/toc.ncx");
    assert!(ncx.contains("<docTitle>\n    <text>Retitled</text>"));

    let after = entry_bytes(&epub);
    assert_eq!(
        before.iter().map(|(n, _)| n).collect::<Vec<_>>(),
        after.iter().map(|(n, _)| n).collect::<Vec<_>>()
    );
    for ((name, old), (_, new)) in before.iter().zip(after.iter()) {
        if name != "EPUB/content.opf" && name != "EPUB/toc.ncx" {
            assert_eq!(old, new, "{} changed", name);
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_regenerate_cover_adds_cbz_cover_page() -> Result<()> {
    let dirs = setup_test_dirs("update_cbz_cover").await;
    let cbz = build_package(&dirs.base, "Covered", &[("1.png", ""), ("2.png", "")]).await?;
    let page_one = read_zip_entry(&cbz, "1.png");
    assert!(get_comic_info_xml(&cbz).contains("<PageCount>2</PageCount>"));

    let report = updater(CanonicalMetadata::default())
        .generate_cover(true)
        .cover_width(50u32)
        .build()?
        .update_archive(&cbz)
        .await?;
    assert_eq!(report.outcome, BuildOutcome::Replaced);

    assert_eq!(
        zip_entry_names(&cbz),
        vec!["ComicInfo.xml", "00 Cover.png", "1.png", "2.png"]
    );
    let cover = read_zip_entry(&cbz, "00 Cover.png").unwrap();
    let image = image::load_from_memory(&cover)?;
    assert_eq!((image.width(), image.height()), (50, 75));
    // The first page is untouched.
    assert_eq!(read_zip_entry(&cbz, "1.png"), page_one);
    assert!(get_comic_info_xml(&cbz).contains("<PageCount>3</PageCount>"));

    // A second regeneration overwrites the added cover.
    updater(CanonicalMetadata::default())
        .generate_cover(true)
        .cover_width(30u32)
        .build()?
        .update_archive(&cbz)
        .await?;
    assert_eq!(zip_entry_names(&cbz).len(), 4);
    let cover = read_zip_entry(&cbz, "00 Cover.png").unwrap();
    assert_eq!(image::load_from_memory(&cover)?.width(), 30);
    assert!(get_comic_info_xml(&cbz).contains("<PageCount>3</PageCount>"));
    Ok(())
}

#[tokio::test]
async fn test_regenerate_cover_resizes_epub_cover_page() -> Result<()> {
    let dirs = setup_test_dirs("update_epub_cover").await;
    let epub = build_package(&dirs.base, "Book", &[("0.png", ""), ("a.txt", "Text.")]).await?;
    let original_mirror = read_zip_entry(&epub, "EPUB/original/0.png");
    let cover_page = read_zip_text(&epub, "EPUB/content/item0.xhtml");
    assert!(cover_page.contains("viewBox=\"0 0 100 150\""));
    let text_page = read_zip_entry(&epub, "EPUB/content/item1.xhtml");

    updater(CanonicalMetadata::default())
        .generate_cover(true)
        .cover_width(40u32)
        .build()?
        .update_archive(&epub)
        .await?;

    let cover = read_zip_entry(&epub, "EPUB/images/image0.png").unwrap();
    let image = image::load_from_memory(&cover)?;
    assert_eq!((image.width(), image.height()), (40, 60));

    let cover_page = read_zip_text(&epub, "EPUB/content/item0.xhtml");
    assert!(cover_page.contains("viewBox=\"0 0 40 60\""));
    assert!(cover_page.contains("<image width=\"40\" height=\"60\" xlink:href=\"../images/image0.png\"/>"));
    assert!(!cover_page.contains("100 150"));

    assert_eq!(read_zip_entry(&epub, "EPUB/content/item1.xhtml"), text_page);
    assert_eq!(read_zip_entry(&epub, "EPUB/original/0.png"), original_mirror);
    Ok(())
}

#[tokio::test]
async fn test_cover_is_kept_without_regeneration() -> Result<()> {
    let dirs = setup_test_dirs("update_keep_cover").await;
    let epub = build_package(&dirs.base, "Book", &[("0.png", ""), ("a.txt", "Text.")]).await?;
    let cover = read_zip_entry(&epub, "EPUB/images/image0.png");

    let codec = ArchiveCodec::open(&epub).await?;
    let options = UpdateOptions {
        force: true,
        regenerate_cover: false,
        cover_generator: Arc::new(PlainCoverGenerator),
        cover_width: 100,
        modified: None,
    };
    let outcome = codec.update(&CanonicalMetadata::default(), options).await?;
    assert_eq!(outcome, BuildOutcome::Replaced);
    assert_eq!(read_zip_entry(&epub, "EPUB/images/image0.png"), cover);
    Ok(())
}

#[tokio::test]
async fn test_failed_update_keeps_original() -> Result<()> {
    let dirs = setup_test_dirs("update_failure").await;
    let broken = dirs.target_dir.join("broken.epub");
    let mut writer = zip::ZipWriter::new(std::fs::File::create(&broken)?);
    writer.start_file("mimetype", zip::write::SimpleFileOptions::default())?;
    writer.write_all(b"application/epub+zip")?;
    writer.start_file("EPUB/chapter.xhtml", zip::write::SimpleFileOptions::default())?;
    writer.write_all(b"<html/>")?;
    writer.finish()?;
    let before = tokio::fs::read(&broken).await?;

    let codec = ArchiveCodec::open(&broken).await?;
    assert_eq!(codec.format(), FileFormat::Epub);
    assert_eq!(codec.read_metadata().await?, CanonicalMetadata::default());

    let result = updater(titled("Never")).build()?.update_archive(&broken).await;
    assert!(matches!(result, Err(Error::NotFound(_))));
    assert_eq!(tokio::fs::read(&broken).await?, before);
    assert_no_scratch_dirs(&dirs.target_dir).await
}

#[tokio::test]
async fn test_extract_to_skips_unsafe_entries() -> Result<()> {
    let dirs = setup_test_dirs("update_extract").await;
    let archive = dirs.target_dir.join("odd.cbz");
    let mut writer = zip::ZipWriter::new(std::fs::File::create(&archive)?);
    for name in ["p1.png", "sub/p2.png", ".hidden.png", "../escape.png"] {
        writer.start_file(name, zip::write::SimpleFileOptions::default())?;
        writer.write_all(name.as_bytes())?;
    }
    writer.finish()?;

    let out = dirs.base.join("extracted");
    let written = ArchiveCodec::open(&archive).await?.extract_to(&out).await?;
    assert_eq!(written, vec![out.join("p1.png"), out.join("sub").join("p2.png")]);
    assert!(!dirs.base.join("escape.png").exists());
    Ok(())
}

#[tokio::test]
async fn test_update_batch_policies() -> Result<()> {
    let dirs = setup_test_dirs("update_batch").await;
    let a = build_package(&dirs.base, "a", &[("1.png", "")]).await?;
    let c = build_package(&dirs.base, "c", &[("1.png", "")]).await?;
    let missing = a.with_file_name("b.cbz");
    let archives = vec![c.clone(), missing.clone(), a.clone()];

    let aborting = updater(titled("Shared"))
        .batch_policy(BatchPolicy::AbortOnError)
        .build()?;
    let report = aborting.update_batch(archives.clone()).await;
    assert!(report.aborted);
    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.completed[0].output_path, a);
    assert_eq!(report.failures[0].input, missing);
    assert!(get_comic_info_xml(&c).contains("<Title>c</Title>"));

    let continuing = updater(titled("Shared")).build()?;
    let report = continuing.update_batch(archives).await;
    assert!(!report.aborted);
    assert!(!report.is_success());
    assert_eq!(report.failures.len(), 1);
    let outcomes: Vec<BuildOutcome> = report.completed.iter().map(|r| r.outcome).collect();
    // `a` already carries the title from the aborted run.
    assert_eq!(outcomes, vec![BuildOutcome::Unchanged, BuildOutcome::Replaced]);
    assert!(get_comic_info_xml(&c).contains("<Title>Shared</Title>"));
    Ok(())
}
