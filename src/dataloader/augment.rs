use image::{GrayImage, Luma};
use imageproc::{
    filter::gaussian_blur_f32,
    geometric_transformations::{warp, Interpolation, Projection},
};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use super::config::AugmentationConfig;

// Chance that each enabled transform fires for a given variant
const APPLY_PROBABILITY: f64 = 0.5;

/// Randomized geometric and photometric distortions for grayscale text lines.
#[derive(Clone, Debug)]
pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    pub fn augment<R: Rng + ?Sized>(&self, image: &GrayImage, rng: &mut R) -> GrayImage {
        let mut out = match self.projection(image.width(), image.height(), rng) {
            Some(projection) => warp(image, &projection, Interpolation::Bilinear, Luma([border_mean(image)])),
            None => image.clone(),
        };

        if let Some(kernel) = self.blur_kernel(rng) {
            out = gaussian_blur_f32(&out, blur_sigma(kernel));
        }

        if self.config.add_noise_factor > 0.0 && rng.gen_bool(APPLY_PROBABILITY) {
            add_noise(&mut out, self.config.add_noise_factor, rng);
        }
        out
    }

    // Magnitude uniform in [-bound, bound] when the transform fires
    fn draw<R: Rng + ?Sized>(bound: f32, rng: &mut R) -> Option<f32> {
        if bound > 0.0 && rng.gen_bool(APPLY_PROBABILITY) {
            Some(rng.gen_range(-bound..=bound))
        } else {
            None
        }
    }

    /// Shift, zoom, shear and rotation composed about the image centre.
    fn projection<R: Rng + ?Sized>(&self, width: u32, height: u32, rng: &mut R) -> Option<Projection> {
        let shift_x = Self::draw(self.config.width_shift_range, rng);
        let shift_y = Self::draw(self.config.height_shift_range, rng);
        let zoom = Self::draw(self.config.zoom_range, rng);
        let shear = Self::draw(self.config.shear_range, rng);
        let rotation = Self::draw(self.config.rotation_range, rng);

        if [shift_x, shift_y, zoom, shear, rotation].iter().all(Option::is_none) {
            return None;
        }

        let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
        let mut around_centre = Projection::translate(-cx, -cy);
        if let Some(percent) = zoom {
            let s = 1.0 + percent / 100.0;
            around_centre = Projection::scale(s, s) * around_centre;
        }
        if let Some(degrees) = shear {
            let k = degrees.to_radians().tan();
            if let Some(shear) = Projection::from_matrix([1.0, k, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]) {
                around_centre = shear * around_centre;
            }
        }
        if let Some(degrees) = rotation {
            around_centre = Projection::rotate(degrees.to_radians()) * around_centre;
        }

        let translate = Projection::translate(cx + shift_x.unwrap_or(0.0), cy + shift_y.unwrap_or(0.0));
        Some(translate * around_centre)
    }

    fn blur_kernel<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<u32> {
        let max_half = self.config.blur_factor.saturating_sub(1) / 2;
        if max_half == 0 || !rng.gen_bool(APPLY_PROBABILITY) {
            return None;
        }
        Some(2 * rng.gen_range(1..=max_half) + 1)
    }
}

/// Sigma OpenCV derives for an odd kernel size.
pub fn blur_sigma(kernel: u32) -> f32 {
    0.3 * ((kernel as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

/// Mean of the outermost pixels, used to fill exposed corners.
pub fn border_mean(image: &GrayImage) -> u8 {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return 0;
    }
    let mut sum = 0u64;
    let mut count = 0u64;
    for (x, y, p) in image.enumerate_pixels() {
        if x == 0 || y == 0 || x == w - 1 || y == h - 1 {
            sum += p.0[0] as u64;
            count += 1;
        }
    }
    (sum / count.max(1)) as u8
}

fn add_noise<R: Rng + ?Sized>(image: &mut GrayImage, factor: f32, rng: &mut R) {
    let Ok(normal) = Normal::new(0.0f32, factor * 255.0) else {
        return;
    };
    for p in image.pixels_mut() {
        let v = p.0[0] as f32 + normal.sample(rng);
        p.0[0] = v.round().clamp(0.0, 255.0) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn stripes() -> GrayImage {
        GrayImage::from_fn(40, 16, |x, y| Luma([if (x / 4 + y / 4) % 2 == 0 { 230 } else { 20 }]))
    }

    fn disabled() -> AugmentationConfig {
        AugmentationConfig {
            max_augmentations_per_sample: 1,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            zoom_range: 0.0,
            shear_range: 0.0,
            rotation_range: 0.0,
            blur_factor: 0,
            add_noise_factor: 0.0,
            cache_path: None,
        }
    }

    #[test]
    fn disabled_transforms_leave_image_untouched() {
        let augmenter = Augmenter::new(disabled());
        let mut rng = StdRng::seed_from_u64(1);
        let image = stripes();
        for _ in 0..10 {
            assert_eq!(augmenter.augment(&image, &mut rng), image);
        }
    }

    #[test]
    fn same_seed_gives_same_variant() {
        let augmenter = Augmenter::new(AugmentationConfig::default());
        let image = stripes();
        let a = augmenter.augment(&image, &mut StdRng::seed_from_u64(42));
        let b = augmenter.augment(&image, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
        assert_eq!(a.dimensions(), image.dimensions());
    }

    #[test]
    fn variants_differ_from_source() {
        let augmenter = Augmenter::new(AugmentationConfig::default());
        let image = stripes();
        let mut rng = StdRng::seed_from_u64(7);
        let changed = (0..20).filter(|_| augmenter.augment(&image, &mut rng) != image).count();
        assert!(changed > 10);
    }

    #[test]
    fn blur_kernel_is_odd_and_bounded() {
        let augmenter = Augmenter::new(AugmentationConfig { blur_factor: 7, ..disabled() });
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            if let Some(k) = augmenter.blur_kernel(&mut rng) {
                assert!(k % 2 == 1 && (3..=7).contains(&k));
            }
        }
        assert!((blur_sigma(3) - 0.8).abs() < 1e-6);
        assert!((blur_sigma(5) - 1.1).abs() < 1e-6);
    }

    #[test]
    fn border_mean_averages_edges() {
        let image = GrayImage::from_fn(3, 3, |x, y| Luma([if x == 1 && y == 1 { 255 } else { 10 }]));
        assert_eq!(border_mean(&image), 10);
    }
}
