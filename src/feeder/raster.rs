use super::HeightmapFormat;
use anyhow::{anyhow, Result};
use image::{
    imageops::{self, FilterType},
    ImageBuffer, Luma,
};
use itertools::iproduct;
use ndarray::Array2;

type HeightImage = ImageBuffer<Luma<f32>, Vec<f32>>;
type IndexImage = ImageBuffer<Luma<u8>, Vec<u8>>;

fn into_array<T>(width: u32, height: u32, data: Vec<T>) -> Result<Array2<T>> {
    Ok(Array2::from_shape_vec((height as usize, width as usize), data)?)
}

/// Decodes a heightmap into normalized heights with the shape of the grid.
pub(crate) fn decode_heightmap(
    bytes: &[u8],
    format: HeightmapFormat,
    width: u32,
    height: u32,
) -> Result<Array2<f32>> {
    let image = match format {
        HeightmapFormat::Image => {
            let image = image::load_from_memory(bytes)?.to_luma16();
            let (source_width, source_height) = image.dimensions();
            let values = image
                .into_raw()
                .into_iter()
                .map(|value| value as f32 / u16::MAX as f32)
                .collect();

            HeightImage::from_raw(source_width, source_height, values)
        }
        raw => {
            let (values, side) = raw.decode_raw(bytes)?;
            HeightImage::from_raw(side, side, values)
        }
    }
    .ok_or_else(|| anyhow!("Heightmap samples do not fill the image."))?;

    let image = if image.dimensions() == (width, height) {
        image
    } else {
        imageops::resize(&image, width, height, FilterType::Triangle)
    };

    into_array(width, height, image.into_raw())
}

fn decode_gray(bytes: &[u8], width: u32, height: u32, filter: FilterType) -> Result<Array2<u8>> {
    let image: IndexImage = image::load_from_memory(bytes)?.to_luma8();

    let image = if image.dimensions() == (width, height) {
        image
    } else {
        imageops::resize(&image, width, height, filter)
    };

    into_array(width, height, image.into_raw())
}

/// Decodes a grayscale image whose values are material palette indices.
pub(crate) fn decode_index_map(bytes: &[u8], width: u32, height: u32) -> Result<Array2<u8>> {
    decode_gray(bytes, width, height, FilterType::Nearest)
}

/// Decodes a grayscale coverage image of a single material.
pub(crate) fn decode_alpha_map(bytes: &[u8], width: u32, height: u32) -> Result<Array2<u8>> {
    decode_gray(bytes, width, height, FilterType::Triangle)
}

/// Separable `[1, 2, 1] / 4` blur, the outermost samples of each pass are copied.
pub(crate) fn smooth_heights(heights: &mut Array2<f32>) {
    let (rows, columns) = heights.dim();
    if rows < 3 || columns < 3 {
        return;
    }

    let mut scratch = heights.clone();

    for (y, x) in iproduct!(0..rows, 1..columns - 1) {
        scratch[[y, x]] =
            0.25 * heights[[y, x - 1]] + 0.5 * heights[[y, x]] + 0.25 * heights[[y, x + 1]];
    }

    heights.row_mut(0).assign(&scratch.row(0));
    heights.row_mut(rows - 1).assign(&scratch.row(rows - 1));

    for (y, x) in iproduct!(1..rows - 1, 0..columns) {
        heights[[y, x]] =
            0.25 * scratch[[y - 1, x]] + 0.5 * scratch[[y, x]] + 0.25 * scratch[[y + 1, x]];
    }
}
