//! Collaborator interfaces consumed by the assembler.
//!
//! Cover artwork and image inspection are pluggable. The defaults are backed by
//! the `image` crate: [`ImageCrateProbe`] only reads headers, and
//! [`PlainCoverGenerator`] paints a flat placeholder canvas. Anything fancier
//! (typeset titles, artwork) belongs to an external implementation of
//! [`CoverGenerator`].

use std::path::Path;

use image::{ImageFormat, Rgb, RgbImage};
use log::{debug, warn};
use uuid::Uuid;

/// Reports the pixel dimensions of an image file.
pub trait ImageProbe: Send + Sync {
    /// Returns `(width, height)`, or `None` when the file is not a readable image.
    fn dimensions(&self, path: &Path) -> Option<(u32, u32)>;
}

/// Renders a cover image for a title.
pub trait CoverGenerator: Send + Sync {
    /// Writes a cover of the given width to `target`. Returns `true` on success.
    fn generate(&self, title: &str, authors: &[String], target: &Path, width: u32) -> bool;
}

/// [`ImageProbe`] reading image headers through the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCrateProbe;

impl ImageProbe for ImageCrateProbe {
    fn dimensions(&self, path: &Path) -> Option<(u32, u32)> {
        match image::image_dimensions(path) {
            Ok(dims) => Some(dims),
            Err(e) => {
                debug!("Cannot probe image {:?}: {}", path, e);
                None
            }
        }
    }
}

/// [`CoverGenerator`] producing a single-colour 2:3 canvas.
///
/// The colour is derived from the title so the same title always yields the
/// same bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCoverGenerator;

impl PlainCoverGenerator {
    fn colour_for(title: &str, authors: &[String]) -> Rgb<u8> {
        let key = format!("{}\u{1f}{}", title, authors.join("\u{1f}"));
        let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes());
        let [r, g, b, ..] = *digest.as_bytes();
        // Keep it dark enough for light text drawn on top by other tools.
        Rgb([r / 2, g / 2, b / 2])
    }
}

impl CoverGenerator for PlainCoverGenerator {
    fn generate(&self, title: &str, authors: &[String], target: &Path, width: u32) -> bool {
        if width == 0 {
            return false;
        }
        let height = width.saturating_mul(3) / 2;
        let canvas = RgbImage::from_pixel(width, height, Self::colour_for(title, authors));
        let format = ImageFormat::from_path(target).unwrap_or(ImageFormat::Png);
        match canvas.save_with_format(target, format) {
            Ok(()) => true,
            Err(e) => {
                warn!("Cover generation failed for {:?}: {}", target, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cover_colour_follows_title_and_authors() {
        let authors = vec!["Someone".to_string()];
        let colour = PlainCoverGenerator::colour_for("Title", &authors);
        assert_eq!(colour, PlainCoverGenerator::colour_for("Title", &authors));
        assert_ne!(colour, PlainCoverGenerator::colour_for("Title", &[]));
        assert!(colour.0.iter().all(|c| *c < 128));
    }

    #[test]
    fn plain_cover_is_two_by_three() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cover.png");
        assert!(PlainCoverGenerator.generate("T", &[], &target, 40));
        assert_eq!(ImageCrateProbe.dimensions(&target), Some((40, 60)));
        assert!(!PlainCoverGenerator.generate("T", &[], &dir.path().join("zero.png"), 0));
    }
}
