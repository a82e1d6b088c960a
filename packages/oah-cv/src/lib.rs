//! Template matching on grayscale images.
//!
//! A cpu alternative to [imageproc::template_matching](https://docs.rs/imageproc/latest/imageproc/template_matching/index.html)
//! adding the correlation coefficient method.

#![deny(clippy::all)]

pub mod template_matching;
pub mod utils;

pub use template_matching::{find_extremes, find_matches, match_template, Match, MatchTemplateMethod};
