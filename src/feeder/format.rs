use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Encoding of a heightmap source.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeightmapFormat {
    /// Any grayscale image the `image` crate decodes, normalized to `[0, 1]`.
    #[default]
    Image,
    Raw8,
    Raw16Le,
    Raw16Be,
    Raw32Le,
    Raw32Be,
    /// 32 bit floats, taken as-is.
    RawFloatLe,
    RawFloatBe,
}

impl HeightmapFormat {
    pub const ALL: [HeightmapFormat; 8] = [
        HeightmapFormat::Image,
        HeightmapFormat::Raw8,
        HeightmapFormat::Raw16Le,
        HeightmapFormat::Raw16Be,
        HeightmapFormat::Raw32Le,
        HeightmapFormat::Raw32Be,
        HeightmapFormat::RawFloatLe,
        HeightmapFormat::RawFloatBe,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HeightmapFormat::Image => "image",
            HeightmapFormat::Raw8 => "raw8",
            HeightmapFormat::Raw16Le => "raw16le",
            HeightmapFormat::Raw16Be => "raw16be",
            HeightmapFormat::Raw32Le => "raw32le",
            HeightmapFormat::Raw32Be => "raw32be",
            HeightmapFormat::RawFloatLe => "rawfloatle",
            HeightmapFormat::RawFloatBe => "rawfloatbe",
        }
    }

    /// Bytes per sample of raw formats, `None` for images.
    pub fn sample_size(self) -> Option<usize> {
        match self {
            HeightmapFormat::Image => None,
            HeightmapFormat::Raw8 => Some(1),
            HeightmapFormat::Raw16Le | HeightmapFormat::Raw16Be => Some(2),
            _ => Some(4),
        }
    }

    /// Decodes raw samples into normalized heights and the side length of the square they form.
    pub fn decode_raw(self, bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
        let Some(sample_size) = self.sample_size() else {
            bail!("The {self} format is not a raw format.");
        };

        ensure!(
            !bytes.is_empty() && bytes.len() % sample_size == 0,
            "Raw heightmap of {} bytes is not a whole number of {self} samples.",
            bytes.len()
        );

        let samples = bytes.len() / sample_size;
        let side = (samples as f64).sqrt().round() as usize;
        ensure!(
            side * side == samples,
            "Raw heightmap holds {samples} samples, which is not a square."
        );

        let chunks = bytes.chunks_exact(sample_size);
        let values: Vec<f32> = match self {
            HeightmapFormat::Raw8 => bytes.iter().map(|&value| value as f32 / u8::MAX as f32).collect(),
            HeightmapFormat::Raw16Le => chunks
                .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]) as f32 / u16::MAX as f32)
                .collect(),
            HeightmapFormat::Raw16Be => chunks
                .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]) as f32 / u16::MAX as f32)
                .collect(),
            HeightmapFormat::Raw32Le => chunks
                .map(|chunk| (u32::from_le_bytes(word(chunk)) as f64 / u32::MAX as f64) as f32)
                .collect(),
            HeightmapFormat::Raw32Be => chunks
                .map(|chunk| (u32::from_be_bytes(word(chunk)) as f64 / u32::MAX as f64) as f32)
                .collect(),
            HeightmapFormat::RawFloatLe => chunks.map(|chunk| f32::from_le_bytes(word(chunk))).collect(),
            HeightmapFormat::RawFloatBe => chunks.map(|chunk| f32::from_be_bytes(word(chunk))).collect(),
            HeightmapFormat::Image => unreachable!(),
        };

        Ok((values, side as u32))
    }
}

fn word(chunk: &[u8]) -> [u8; 4] {
    [chunk[0], chunk[1], chunk[2], chunk[3]]
}

impl fmt::Display for HeightmapFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HeightmapFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();

        match HeightmapFormat::ALL
            .into_iter()
            .find(|format| format.name().eq_ignore_ascii_case(value))
        {
            Some(format) => Ok(format),
            None => bail!("Unknown heightmap format `{value}`."),
        }
    }
}
