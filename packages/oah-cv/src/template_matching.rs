use std::ops::{Add, Sub};

use anyhow::{bail, Context};
use fftconvolve::{fftcorrelate, Mode};
use image::{ImageBuffer, Luma};
use imageproc::template_matching::Extremes;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::utils::{array2_to_luma32f, luma32f_to_array2, luma32f_to_luma8};

/// Every method here produces a score map where higher is better, in `[-1, 1]`
/// for [`MatchTemplateMethod::CorrelationCoefficientNormed`] and `[0, 1]` for the others.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchTemplateMethod {
    /// `TM_CCOEFF_NORMED` in OpenCV's words
    #[default]
    CorrelationCoefficientNormed,
    CrossCorrelationNormed,
    /// Mapped to `1 - v` so a perfect match scores 1
    SumOfSquaredErrorsNormed,
}

/// Slides `template` over `image` and scores every position.
///
/// The result is `(W - w + 1) x (H - h + 1)`.
pub fn match_template(
    image: &ImageBuffer<Luma<f32>, Vec<f32>>,
    template: &ImageBuffer<Luma<f32>, Vec<f32>>,
    method: MatchTemplateMethod,
) -> anyhow::Result<ImageBuffer<Luma<f32>, Vec<f32>>> {
    if template.width() == 0 || template.height() == 0 {
        bail!("empty template");
    }
    if template.width() > image.width() || template.height() > image.height() {
        bail!(
            "template {}x{} is larger than image {}x{}",
            template.width(),
            template.height(),
            image.width(),
            image.height()
        );
    }

    match method {
        MatchTemplateMethod::CorrelationCoefficientNormed => {
            let res = ccoeff_normed(&luma32f_to_array2(image), &luma32f_to_array2(template))?;
            Ok(array2_to_luma32f(&res))
        }
        MatchTemplateMethod::CrossCorrelationNormed => Ok(imageproc::template_matching::match_template(
            &luma32f_to_luma8(image),
            &luma32f_to_luma8(template),
            imageproc::template_matching::MatchTemplateMethod::CrossCorrelationNormalized,
        )),
        MatchTemplateMethod::SumOfSquaredErrorsNormed => {
            let mut res = imageproc::template_matching::match_template(
                &luma32f_to_luma8(image),
                &luma32f_to_luma8(template),
                imageproc::template_matching::MatchTemplateMethod::SumOfSquaredErrorsNormalized,
            );
            res.pixels_mut().for_each(|p| p.0[0] = 1.0 - p.0[0]);
            Ok(res)
        }
    }
}

/// Variances below this are treated as flat
const FLAT_VARIANCE: f64 = 1e-9;

/// Normalized correlation coefficient.
///
/// The raw correlation comes from an fft, the window sums and variances come
/// from integral images. Windows (or templates) without variance score 0.
pub fn ccoeff_normed(image: &Array2<f64>, kernel: &Array2<f64>) -> anyhow::Result<Array2<f64>> {
    let (image_h, image_w) = image.dim();
    let (kernel_h, kernel_w) = kernel.dim();
    if kernel_h == 0 || kernel_w == 0 {
        bail!("empty template");
    }
    if kernel_h > image_h || kernel_w > image_w {
        bail!("template {kernel_w}x{kernel_h} is larger than image {image_w}x{image_h}");
    }
    let (y_len, x_len) = (image_h - kernel_h + 1, image_w - kernel_w + 1);

    let mut res = fftcorrelate(image, kernel, Mode::Valid)
        .map_err(|err| anyhow::anyhow!("{err}"))
        .context("fft correlation failed")?;
    if res.dim() != (y_len, x_len) {
        bail!(
            "unexpected correlation size {:?}, expected {:?}",
            res.dim(),
            (y_len, x_len)
        );
    }

    let squared_image = image.mapv(|x| x * x);
    let integral_image = integral_arr2(image);
    let integral_squared_image = integral_arr2(&squared_image);

    let n = kernel.len() as f64;
    let kernel_avg = kernel.sum() / n;
    let kernel_var = kernel.mapv(|x| x * x).sum() / n - kernel_avg * kernel_avg;

    for ((y, x), v) in res.indexed_iter_mut() {
        let value_sum = subsum_from_integral(&integral_image, x, y, kernel_w, kernel_h);
        let value_sqsum = subsum_from_integral(&integral_squared_image, x, y, kernel_w, kernel_h);

        let value_avg = value_sum / n;
        let value_var = (value_sqsum / n - value_avg * value_avg).max(0.0);

        if value_var < FLAT_VARIANCE || kernel_var < FLAT_VARIANCE {
            *v = 0.0;
            continue;
        }

        let numerator = *v - value_sum * kernel_avg;
        let factor = (value_var * kernel_var).sqrt() * n;
        // float error can push a perfect match slightly past the factor
        *v = if numerator.abs() < factor {
            numerator / factor
        } else if numerator.abs() < 1.125 * factor {
            numerator.signum()
        } else {
            0.0
        };
    }

    Ok(res)
}

/// `res[y][x]` is the sum of `mat[0..=y][0..=x]`
pub fn integral_arr2<T>(mat: &Array2<T>) -> Array2<T>
where
    T: Copy + Add<Output = T> + Sub<Output = T>,
{
    let (y_len, x_len) = mat.dim();
    let mut res = mat.clone();
    for y in 0..y_len {
        for x in 0..x_len {
            let mut v = res[[y, x]];
            if y > 0 {
                v = v + res[[y - 1, x]];
            }
            if x > 0 {
                v = v + res[[y, x - 1]];
            }
            if x > 0 && y > 0 {
                v = v - res[[y - 1, x - 1]];
            }
            res[[y, x]] = v;
        }
    }
    res
}

/// Sum of the `width x height` window at `(x, y)`, read from an integral image
pub fn subsum_from_integral(
    integral_mat: &Array2<f64>,
    x: usize,
    y: usize,
    width: usize,
    height: usize,
) -> f64 {
    let (right, bottom) = (x + width - 1, y + height - 1);

    let mut res = integral_mat[[bottom, right]];
    if x > 0 {
        res -= integral_mat[[bottom, x - 1]];
    }
    if y > 0 {
        res -= integral_mat[[y - 1, right]];
    }
    if x > 0 && y > 0 {
        res += integral_mat[[y - 1, x - 1]];
    }
    res
}

pub fn find_extremes(input: &ImageBuffer<Luma<f32>, Vec<f32>>) -> Extremes<f32> {
    imageproc::template_matching::find_extremes(input)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub location: (u32, u32),
    pub value: f32,
}

/// Every location scoring at least `threshold`, keeping only the best one
/// among locations closer than a template size to each other.
pub fn find_matches(
    input: &ImageBuffer<Luma<f32>, Vec<f32>>,
    template_width: u32,
    template_height: u32,
    threshold: f32,
) -> Vec<Match> {
    let mut matches: Vec<Match> = Vec::new();

    for (x, y, pixel) in input.enumerate_pixels() {
        let value = pixel.0[0];
        if value < threshold {
            continue;
        }

        let overlapped = matches.iter_mut().rev().find(|m| {
            m.location.0.abs_diff(x) < template_width && m.location.1.abs_diff(y) < template_height
        });
        match overlapped {
            Some(m) => {
                if value > m.value {
                    m.location = (x, y);
                    m.value = value;
                }
            }
            None => matches.push(Match {
                location: (x, y),
                value,
            }),
        }
    }

    matches
}
