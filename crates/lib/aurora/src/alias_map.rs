//! Importance sampling tables for lat-long environment images.
//!
//! Each pixel gets one Walker alias entry. Sampling picks a pixel uniformly,
//! then either keeps it or jumps to its alias, which draws pixels in
//! proportion to their solid-angle weighted luminance.

use bytemuck::{Pod, Zeroable};
use std::f32::consts::{FRAC_PI_2, PI};

const LUMINANCE_WEIGHTS: [f32; 3] = [0.2125, 0.7154, 0.0721];

/// One entry of the GPU-side table. Exactly 16 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct AliasEntry {
    pub alias: u32,
    pub prob: f32,
    pub pdf: f32,
    pub _pad: f32,
}

#[derive(Clone, Debug)]
pub struct AliasMap {
    pub entries: Vec<AliasEntry>,
    /// Solid-angle weighted luminance summed over the sphere.
    pub luminance_integral: f32,
}

fn luminance(rgb: &[f32]) -> f32 {
    rgb[0] * LUMINANCE_WEIGHTS[0] + rgb[1] * LUMINANCE_WEIGHTS[1] + rgb[2] * LUMINANCE_WEIGHTS[2]
}

/// Weight of each pixel of row `y`:
/// `Ω = (sin θ_top − sin θ_bottom) · π / width`, with θ walking down from π/2
/// in steps of π/height.
///
/// The longitude factor is π/width rather than the geometric 2π/width, so the
/// weights sum to 2π over the image and a single lit pixel of a 2×1 image has
/// a luminance integral of exactly π. Pdfs are normalized against these same
/// weights, so `Σ pdf·Ω = 1` either way.
fn row_solid_angle(y: usize, width: usize, height: usize) -> f32 {
    let step = PI / height as f32;
    let theta_top = FRAC_PI_2 - y as f32 * step;
    let theta_bottom = theta_top - step;
    (theta_top.sin() - theta_bottom.sin()) * (PI / width as f32)
}

impl AliasMap {
    /// Builds the table from `width * height` pixels of `channels` floats
    /// each. Only the first three channels are read.
    pub fn build(pixels: &[f32], width: usize, height: usize, channels: usize) -> Self {
        assert!(channels >= 3, "alias maps need RGB input");
        assert!(width > 0 && height > 0);
        assert!(pixels.len() >= width * height * channels);

        let count = width * height;
        let mut entries = vec![AliasEntry::default(); count];

        let mut luminances = Vec::with_capacity(count);
        let mut weighted = Vec::with_capacity(count);
        let mut integral = 0.0f64;

        for y in 0..height {
            let solid_angle = row_solid_angle(y, width, height);
            for x in 0..width {
                let i = y * width + x;
                let l = luminance(&pixels[i * channels..i * channels + 3]).max(0.0);
                luminances.push(l);
                weighted.push(solid_angle * l);
                integral += (solid_angle * l) as f64;
            }
        }

        let integral = integral as f32;

        if integral <= 0.0 {
            // A black environment: sample uniformly, nothing is ever hit.
            for (i, entry) in entries.iter_mut().enumerate() {
                entry.alias = i as u32;
                entry.prob = 1.0;
            }
            return Self {
                entries,
                luminance_integral: 0.0,
            };
        }

        let average = integral / count as f32;

        for (i, entry) in entries.iter_mut().enumerate() {
            entry.alias = i as u32;
            entry.pdf = luminances[i] / integral;
            entry.prob = weighted[i] / average;
        }

        // Smalls grow from the front, larges from the back.
        let mut indices = vec![0usize; count];
        let mut front = 0;
        let mut back = count;
        for (i, entry) in entries.iter().enumerate() {
            if entry.prob < 1.0 {
                indices[front] = i;
                front += 1;
            } else {
                back -= 1;
                indices[back] = i;
            }
        }

        let mut small = 0;
        let mut large = back;

        while small < large && large < count {
            let s = indices[small];
            let l = indices[large];

            entries[s].alias = l as u32;
            entries[l].prob -= 1.0 - entries[s].prob;

            if entries[l].prob < 1.0 {
                // The large one is now small; it is paired in turn.
                large += 1;
            }
            small += 1;
        }

        Self {
            entries,
            luminance_integral: integral,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Walker sampling with `u` in [0, 1)².
    pub fn sample(&self, u: [f32; 2]) -> usize {
        let n = self.entries.len();
        let i = ((u[0] * n as f32) as usize).min(n - 1);
        if u[1] < self.entries[i].prob {
            i
        } else {
            self.entries[i].alias as usize
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_angles(width: usize, height: usize) -> Vec<f32> {
        (0..height)
            .flat_map(|y| std::iter::repeat(row_solid_angle(y, width, height)).take(width))
            .collect()
    }

    #[test]
    fn entry_is_16_bytes() {
        assert_eq!(std::mem::size_of::<AliasEntry>(), 16);
    }

    #[test]
    fn two_pixel_image() {
        let pixels = [1.0, 1.0, 1.0, 0.0, 0.0, 0.0];
        let map = AliasMap::build(&pixels, 2, 1, 3);

        assert!((map.luminance_integral - PI).abs() < 1e-5);
        assert!((map.entries[0].pdf - 1.0 / PI).abs() < 1e-6);
        assert_eq!(map.entries[1].pdf, 0.0);
        assert_eq!(map.entries[1].alias, 0);
        assert_eq!(map.entries[1].prob, 0.0);
        // Started at 2, gave 1 to pixel 1.
        assert!((map.entries[0].prob - 1.0).abs() < 1e-6);
    }

    #[test]
    fn black_image_samples_uniformly() {
        let map = AliasMap::build(&[0.0; 12], 2, 2, 3);
        assert_eq!(map.luminance_integral, 0.0);
        for (i, entry) in map.entries.iter().enumerate() {
            assert_eq!(entry.alias, i as u32);
            assert_eq!(entry.prob, 1.0);
        }
    }

    fn gradient(width: usize, height: usize) -> Vec<f32> {
        let mut pixels = Vec::with_capacity(width * height * 4);
        for y in 0..height {
            for x in 0..width {
                let r = ((x * 7 + y * 3) % 11) as f32 * 0.3;
                let g = ((x * 5 + y * 13) % 7) as f32 * 0.1;
                let b = if (x + y) % 5 == 0 { 4.0 } else { 0.05 };
                pixels.extend_from_slice(&[r, g, b, 1.0]);
            }
        }
        pixels
    }

    #[test]
    fn pdf_integrates_to_one_and_aliases_are_in_range() {
        let (width, height) = (32, 16);
        let map = AliasMap::build(&gradient(width, height), width, height, 4);
        let omega = solid_angles(width, height);

        let total: f64 = map
            .entries
            .iter()
            .zip(&omega)
            .map(|(entry, omega)| (entry.pdf * omega) as f64)
            .sum();
        assert!((total - 1.0).abs() < 1e-4, "{}", total);

        for entry in &map.entries {
            assert!((entry.alias as usize) < map.len());
            assert!(entry.prob >= -1e-4);
        }
    }

    #[test]
    fn walker_table_reproduces_target_distribution() {
        let (width, height) = (16, 8);
        let map = AliasMap::build(&gradient(width, height), width, height, 4);
        let omega = solid_angles(width, height);
        let n = map.len() as f64;

        // Exact selection probability of each entry from the table itself.
        let mut selected = vec![0.0f64; map.len()];
        for (i, entry) in map.entries.iter().enumerate() {
            let keep = (entry.prob as f64).clamp(0.0, 1.0);
            selected[i] += keep / n;
            selected[entry.alias as usize] += (1.0 - keep) / n;
        }

        for (i, entry) in map.entries.iter().enumerate() {
            let expected = (entry.pdf * omega[i]) as f64;
            assert!(
                (selected[i] - expected).abs() < 1e-4,
                "entry {}: selected {} expected {}",
                i,
                selected[i],
                expected
            );
        }
    }

    #[test]
    fn sampling_respects_alias() {
        let map = AliasMap::build(&[1.0, 1.0, 1.0, 0.0, 0.0, 0.0], 2, 1, 3);
        assert_eq!(map.sample([0.25, 0.5]), 0);
        assert_eq!(map.sample([0.75, 0.5]), 0);
        assert_eq!(map.sample([0.999, 0.0]), 0);
    }

    #[test]
    fn pixel_weights_cover_half_the_sphere_measure() {
        for (width, height) in [(2, 1), (16, 8), (7, 5)] {
            let total: f32 = solid_angles(width, height).iter().sum();
            assert!((total - 2.0 * PI).abs() < 1e-4, "{}x{}: {}", width, height, total);
        }
        assert!((row_solid_angle(0, 2, 1) - PI).abs() < 1e-6);
    }
}
