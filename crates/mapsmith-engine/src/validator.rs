//! Statistical acceptance checks for generated maps.
//!
//! These checks catch obviously broken output (a gray fog where a mask
//! should be, a flat field where depth should be). They do not judge whether
//! the map is structurally right for the photo; a plausible but wrong map
//! passes.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use mapsmith_contracts::MapKind;

use crate::error::MapError;

/// All values are empirically tuned against real provider output and are
/// expected to be recalibrated; none of them is a derived quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationThresholds {
    pub near_black_max: u8,
    pub near_white_min: u8,
    /// Inclusive luma band counted as mid-tone.
    pub mid_tone_min: u8,
    pub mid_tone_max: u8,
    pub mask_two_tone_min: f64,
    pub edges_two_tone_min: f64,
    pub edges_black_min: f64,
    pub edges_white_max: f64,
    pub depth_mid_tone_min: f64,
    pub depth_std_min: f64,
    pub normals_channel_std_min: f64,
    /// Largest relative aspect-ratio difference a resize may paper over.
    pub aspect_tolerance: f64,
    pub sample_budget: u64,
}

impl Default for ValidationThresholds {
    fn default() -> Self {
        Self {
            near_black_max: 24,
            near_white_min: 231,
            mid_tone_min: 64,
            mid_tone_max: 191,
            mask_two_tone_min: 0.92,
            edges_two_tone_min: 0.90,
            edges_black_min: 0.35,
            edges_white_max: 0.50,
            depth_mid_tone_min: 0.20,
            depth_std_min: 18.0,
            normals_channel_std_min: 8.0,
            aspect_tolerance: 0.03,
            sample_budget: 20_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapStats {
    pub samples: u64,
    pub near_black: f64,
    pub near_white: f64,
    pub mid_tone: f64,
    pub mean: f64,
    pub variance: f64,
    pub channel_variance: [f64; 3],
}

impl MapStats {
    pub fn two_tone(&self) -> f64 {
        self.near_black + self.near_white
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }

    pub fn max_channel_std_dev(&self) -> f64 {
        self.channel_variance
            .iter()
            .map(|variance| variance.sqrt())
            .fold(0.0, f64::max)
    }
}

#[derive(Debug, Clone)]
pub struct AcceptedMap {
    pub image: DynamicImage,
    pub stats: MapStats,
    pub repaired: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MapValidator {
    thresholds: ValidationThresholds,
}

impl MapValidator {
    pub fn new(thresholds: ValidationThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &ValidationThresholds {
        &self.thresholds
    }

    pub fn decode(bytes: &[u8]) -> Result<DynamicImage, MapError> {
        image::load_from_memory(bytes).map_err(|err| MapError::DecodeFailure(err.to_string()))
    }

    pub fn validate(
        &self,
        kind: MapKind,
        bytes: &[u8],
        expected: (u32, u32),
    ) -> Result<AcceptedMap, MapError> {
        let image = Self::decode(bytes)?;
        let stats = self.check(kind, &image, expected)?;
        Ok(AcceptedMap {
            image,
            stats,
            repaired: false,
        })
    }

    /// Decode and check; a pure size miss within the aspect tolerance is
    /// resampled to the expected size and checked again.
    pub fn accept(
        &self,
        kind: MapKind,
        bytes: &[u8],
        expected: (u32, u32),
    ) -> Result<AcceptedMap, MapError> {
        let image = Self::decode(bytes)?;
        match self.check(kind, &image, expected) {
            Ok(stats) => Ok(AcceptedMap {
                image,
                stats,
                repaired: false,
            }),
            Err(err @ MapError::DimensionMismatch { .. }) => {
                let Some(resized) = self.repair(kind, &image, expected) else {
                    return Err(err);
                };
                let stats = self.check(kind, &resized, expected)?;
                tracing::debug!(
                    kind = kind.as_str(),
                    from_width = image.width(),
                    from_height = image.height(),
                    to_width = expected.0,
                    to_height = expected.1,
                    "accepted map after resize repair"
                );
                Ok(AcceptedMap {
                    image: resized,
                    stats,
                    repaired: true,
                })
            }
            Err(err) => Err(err),
        }
    }

    pub fn check(
        &self,
        kind: MapKind,
        image: &DynamicImage,
        expected: (u32, u32),
    ) -> Result<MapStats, MapError> {
        let (width, height) = image.dimensions();
        if (width, height) != expected {
            return Err(MapError::DimensionMismatch {
                expected_width: expected.0,
                expected_height: expected.1,
                actual_width: width,
                actual_height: height,
            });
        }
        let stats = self.measure(image);
        self.apply_rules(kind, &stats)?;
        Ok(stats)
    }

    /// Resamples `image` to `expected` when the aspect ratios are close
    /// enough. Two-tone kinds use nearest-neighbour so they stay two-tone.
    pub fn repair(
        &self,
        kind: MapKind,
        image: &DynamicImage,
        expected: (u32, u32),
    ) -> Option<DynamicImage> {
        let delta = aspect_delta(image.dimensions(), expected)?;
        if delta > self.thresholds.aspect_tolerance {
            tracing::debug!(
                kind = kind.as_str(),
                delta,
                "aspect ratio too far off for resize repair"
            );
            return None;
        }
        let filter = if kind.is_binary() {
            FilterType::Nearest
        } else {
            FilterType::Triangle
        };
        Some(image.resize_exact(expected.0, expected.1, filter))
    }

    pub fn measure(&self, image: &DynamicImage) -> MapStats {
        let (width, height) = image.dimensions();
        let total = u64::from(width) * u64::from(height);
        let budget = self.thresholds.sample_budget.max(1);
        let stride = total.div_ceil(budget).max(1);
        let t = &self.thresholds;

        let mut samples = 0u64;
        let (mut black, mut white, mut mid) = (0u64, 0u64, 0u64);
        let (mut sum, mut sum_sq) = (0.0f64, 0.0f64);
        let mut channel_sum = [0.0f64; 3];
        let mut channel_sum_sq = [0.0f64; 3];

        let mut idx = 0u64;
        while idx < total {
            let x = (idx % u64::from(width)) as u32;
            let y = (idx / u64::from(width)) as u32;
            let pixel = image.get_pixel(x, y).0;
            let luma = luma(pixel[0], pixel[1], pixel[2]);
            if luma <= t.near_black_max {
                black += 1;
            }
            if luma >= t.near_white_min {
                white += 1;
            }
            if (t.mid_tone_min..=t.mid_tone_max).contains(&luma) {
                mid += 1;
            }
            let value = f64::from(luma);
            sum += value;
            sum_sq += value * value;
            for channel in 0..3 {
                let value = f64::from(pixel[channel]);
                channel_sum[channel] += value;
                channel_sum_sq[channel] += value * value;
            }
            samples += 1;
            idx += stride;
        }

        if samples == 0 {
            return MapStats {
                samples: 0,
                near_black: 0.0,
                near_white: 0.0,
                mid_tone: 0.0,
                mean: 0.0,
                variance: 0.0,
                channel_variance: [0.0; 3],
            };
        }

        let n = samples as f64;
        let mean = sum / n;
        let mut channel_variance = [0.0f64; 3];
        for channel in 0..3 {
            let channel_mean = channel_sum[channel] / n;
            channel_variance[channel] =
                (channel_sum_sq[channel] / n - channel_mean * channel_mean).max(0.0);
        }
        MapStats {
            samples,
            near_black: black as f64 / n,
            near_white: white as f64 / n,
            mid_tone: mid as f64 / n,
            mean,
            variance: (sum_sq / n - mean * mean).max(0.0),
            channel_variance,
        }
    }

    fn apply_rules(&self, kind: MapKind, stats: &MapStats) -> Result<(), MapError> {
        let t = &self.thresholds;
        match kind {
            MapKind::Segmentation | MapKind::FaceMask | MapKind::HandsMask => {
                at_least(kind, "twoToneFraction", stats.two_tone(), t.mask_two_tone_min)
            }
            MapKind::Edges => {
                at_least(kind, "twoToneFraction", stats.two_tone(), t.edges_two_tone_min)?;
                at_least(kind, "nearBlackFraction", stats.near_black, t.edges_black_min)?;
                at_most(kind, "nearWhiteFraction", stats.near_white, t.edges_white_max)
            }
            MapKind::Depth => {
                at_least(kind, "midToneFraction", stats.mid_tone, t.depth_mid_tone_min)?;
                at_least(kind, "luminanceStdDev", stats.std_dev(), t.depth_std_min)
            }
            MapKind::Normals => {
                let measured = stats.max_channel_std_dev();
                if measured > t.normals_channel_std_min {
                    return Ok(());
                }
                Err(MapError::HeuristicValidationFailure {
                    kind,
                    measurement: "maxChannelStdDev",
                    measured,
                    requirement: format!("> {}", t.normals_channel_std_min),
                })
            }
        }
    }
}

fn at_least(
    kind: MapKind,
    measurement: &'static str,
    measured: f64,
    minimum: f64,
) -> Result<(), MapError> {
    if measured >= minimum {
        return Ok(());
    }
    Err(MapError::HeuristicValidationFailure {
        kind,
        measurement,
        measured,
        requirement: format!(">= {minimum}"),
    })
}

fn at_most(
    kind: MapKind,
    measurement: &'static str,
    measured: f64,
    maximum: f64,
) -> Result<(), MapError> {
    if measured <= maximum {
        return Ok(());
    }
    Err(MapError::HeuristicValidationFailure {
        kind,
        measurement,
        measured,
        requirement: format!("<= {maximum}"),
    })
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((299 * u32::from(r) + 587 * u32::from(g) + 114 * u32::from(b) + 500) / 1000) as u8
}

pub fn aspect_delta(actual: (u32, u32), expected: (u32, u32)) -> Option<f64> {
    if actual.0 == 0 || actual.1 == 0 || expected.0 == 0 || expected.1 == 0 {
        return None;
    }
    let actual_ratio = f64::from(actual.0) / f64::from(actual.1);
    let expected_ratio = f64::from(expected.0) / f64::from(expected.1);
    Some((actual_ratio - expected_ratio).abs() / expected_ratio)
}
