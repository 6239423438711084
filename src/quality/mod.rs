//! Quality gate: structural checks, hashing and duplicate admission.
//!
//! [`QualityGate::inspect`] is pure and runs on the worker pool (decode,
//! dimension floor, aspect ratio, hashes, flags). [`QualityGate::admit`] looks at
//! shared state and runs serialized in the persisting stage, so two concurrent
//! near-duplicates can never both be admitted.

pub mod hashing;
pub mod index;

use image::{DynamicImage, GenericImageView};

use crate::catalog::Catalog;
use crate::config::QualityConfig;
use crate::error::{DuplicateError, Rejection, ValidationError};
use crate::model::{CandidateImage, ImageContent, QualityFlag};

pub use index::NearDuplicateIndex;

/// Everything the gate learned about a decodable candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Inspection {
    pub content_hash: String,
    pub perceptual_hash: String,
    pub width: u32,
    pub height: u32,
    pub flags: Vec<QualityFlag>,
}

#[derive(Debug, Clone)]
pub struct QualityGate {
    config: QualityConfig,
}

impl QualityGate {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    /// Decodability, dimension floor and aspect ratio, cheapest first.
    pub fn inspect(
        &self,
        candidate: &CandidateImage,
        content: &ImageContent,
    ) -> Result<Inspection, ValidationError> {
        let img = image::load_from_memory(&content.bytes)
            .map_err(|e| ValidationError::Undecodable(e.to_string()))?;
        let (width, height) = img.dimensions();

        if width < self.config.min_width || height < self.config.min_height {
            return Err(ValidationError::BelowDimensionFloor {
                width,
                height,
                min_width: self.config.min_width,
                min_height: self.config.min_height,
            });
        }

        let ratio = f64::from(width.max(height)) / f64::from(width.min(height).max(1));
        if ratio > self.config.max_aspect_ratio {
            return Err(ValidationError::AspectRatio {
                ratio,
                max: self.config.max_aspect_ratio,
            });
        }

        let perceptual_hash = hashing::perceptual_hash(&img, self.config.hash_size)
            .ok_or_else(|| ValidationError::Undecodable("pixel buffer rejected by hasher".to_string()))?;

        Ok(Inspection {
            content_hash: hashing::content_hash(&content.bytes),
            perceptual_hash,
            width,
            height,
            flags: self.flags(candidate, &img),
        })
    }

    fn flags(&self, candidate: &CandidateImage, img: &DynamicImage) -> Vec<QualityFlag> {
        let (width, height) = img.dimensions();
        let mut flags = Vec::new();

        let declared_differs = matches!(
            (candidate.declared_width, candidate.declared_height),
            (Some(w), Some(h)) if (w, h) != (width, height)
        );
        if declared_differs {
            flags.push(QualityFlag::DeclaredDimensionMismatch);
        }

        if is_grayscale(img) {
            flags.push(QualityFlag::Grayscale);
        }

        let near = |value: u32, floor: u32| f64::from(value) < f64::from(floor) * 1.1;
        if near(width, self.config.min_width) || near(height, self.config.min_height) {
            flags.push(QualityFlag::NearDimensionFloor);
        }

        flags
    }

    /// Exact then near duplicate checks against the catalog and the run's index.
    pub fn admit(
        &self,
        inspection: &Inspection,
        catalog: &Catalog,
        index: &NearDuplicateIndex,
    ) -> Result<(), Rejection> {
        if catalog.contains_content_hash(&inspection.content_hash)? {
            return Err(DuplicateError::ExactContent {
                content_hash: inspection.content_hash.clone(),
            }
            .into());
        }

        if let Some((existing, distance)) = index.find_within(
            &inspection.perceptual_hash,
            self.config.duplicate_hash_distance_threshold,
        ) {
            return Err(DuplicateError::NearDuplicate { existing, distance }.into());
        }

        Ok(())
    }
}

fn is_grayscale(img: &DynamicImage) -> bool {
    if !img.color().has_color() {
        return true;
    }
    img.thumbnail(32, 32)
        .to_rgb8()
        .pixels()
        .all(|p| {
            let [r, g, b] = p.0;
            r.abs_diff(g) <= 2 && g.abs_diff(b) <= 2 && r.abs_diff(b) <= 2
        })
}
