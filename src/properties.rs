//! String keyed parameter bags attached to every cell.
//!
//! Each bag is a plain struct that can also be driven through
//! [`Properties::set_parameter`] with human readable names such as
//! `"block resolution"` or `"heightmap source"`.

use crate::feeder::HeightmapFormat;
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

/// A named accessor pair into a property bag.
pub struct Parameter<T: 'static> {
    pub name: &'static str,
    set: fn(&mut T, &str) -> Result<()>,
    get: fn(&T) -> String,
}

impl<T: 'static> Parameter<T> {
    pub const fn new(
        name: &'static str,
        set: fn(&mut T, &str) -> Result<()>,
        get: fn(&T) -> String,
    ) -> Self {
        Self { name, set, get }
    }
}

pub trait Properties: Sized + 'static {
    const PARAMETERS: &'static [Parameter<Self>];

    fn set_parameter(&mut self, name: &str, value: &str) -> Result<()> {
        set_table_parameter(self, name, value)
    }

    fn get_parameter(&self, name: &str) -> Option<String> {
        get_table_parameter(self, name)
    }

    /// All parameters with their current values.
    fn parameters(&self) -> Vec<(String, String)> {
        Self::PARAMETERS
            .iter()
            .map(|parameter| (parameter.name.to_string(), (parameter.get)(self)))
            .collect()
    }
}

fn find<T: Properties>(name: &str) -> Option<&'static Parameter<T>> {
    let name = name.trim();
    T::PARAMETERS
        .iter()
        .find(|parameter| parameter.name.eq_ignore_ascii_case(name))
}

fn set_table_parameter<T: Properties>(properties: &mut T, name: &str, value: &str) -> Result<()> {
    let parameter = find::<T>(name).ok_or_else(|| anyhow!("Unknown parameter `{name}`."))?;

    (parameter.set)(properties, value.trim())
        .with_context(|| format!("Invalid value `{value}` for parameter `{name}`."))
}

fn get_table_parameter<T: Properties>(properties: &T, name: &str) -> Option<String> {
    find::<T>(name).map(|parameter| (parameter.get)(properties))
}

pub fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => bail!("`{value}` is not a boolean."),
    }
}

/// Per cell renderer settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellRenderProperties {
    pub visible: bool,
    /// Quads per block side, a power of two of at least two.
    pub block_resolution: u32,
    /// Blocks are never split below this sample step.
    pub min_steps: u32,
    pub lod_split_coeff: f32,
    /// Beyond this distance only the base material is drawn.
    pub splat_distance: f32,
    pub splat_render_priority: i32,
}

impl Default for CellRenderProperties {
    fn default() -> Self {
        Self {
            visible: true,
            block_resolution: 32,
            min_steps: 1,
            lod_split_coeff: 16.0,
            splat_distance: 100.0,
            splat_render_priority: 0,
        }
    }
}

impl Properties for CellRenderProperties {
    const PARAMETERS: &'static [Parameter<Self>] = &[
        Parameter::new(
            "visible",
            |p, v| {
                p.visible = parse_bool(v)?;
                Ok(())
            },
            |p| p.visible.to_string(),
        ),
        Parameter::new(
            "block resolution",
            |p, v| {
                let resolution: u32 = v.parse()?;
                if resolution < 2 || !resolution.is_power_of_two() {
                    bail!("Block resolution must be a power of two of at least two.");
                }
                p.block_resolution = resolution;
                Ok(())
            },
            |p| p.block_resolution.to_string(),
        ),
        Parameter::new(
            "min steps",
            |p, v| {
                p.min_steps = v.parse::<u32>()?.max(1);
                Ok(())
            },
            |p| p.min_steps.to_string(),
        ),
        Parameter::new(
            "lod splitcoeff",
            |p, v| {
                p.lod_split_coeff = v.parse()?;
                Ok(())
            },
            |p| p.lod_split_coeff.to_string(),
        ),
        Parameter::new(
            "splat distance",
            |p, v| {
                p.splat_distance = v.parse()?;
                Ok(())
            },
            |p| p.splat_distance.to_string(),
        ),
        Parameter::new(
            "splat render priority",
            |p, v| {
                p.splat_render_priority = v.parse()?;
                Ok(())
            },
            |p| p.splat_render_priority.to_string(),
        ),
    ];
}

/// Per cell collider settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellCollisionProperties {
    pub collidable: bool,
}

impl Default for CellCollisionProperties {
    fn default() -> Self {
        Self { collidable: true }
    }
}

impl Properties for CellCollisionProperties {
    const PARAMETERS: &'static [Parameter<Self>] = &[Parameter::new(
        "collidable",
        |p, v| {
            p.collidable = parse_bool(v)?;
            Ok(())
        },
        |p| p.collidable.to_string(),
    )];
}

/// An alpha map source bound to a palette material by name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlphaMapSource {
    pub material: String,
    pub source: String,
}

/// Per cell data feeder settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeederProperties {
    pub heightmap_source: String,
    pub heightmap_format: HeightmapFormat,
    pub materialmap_source: String,
    pub offset: f32,
    pub scale: f32,
    pub smooth_heightmap: bool,
    pub alpha_maps: Vec<AlphaMapSource>,
}

impl Default for FeederProperties {
    fn default() -> Self {
        Self {
            heightmap_source: String::new(),
            heightmap_format: HeightmapFormat::Image,
            materialmap_source: String::new(),
            offset: 0.0,
            scale: 1.0,
            smooth_heightmap: false,
            alpha_maps: Vec::new(),
        }
    }
}

const ALPHA_MAP_PREFIX: &str = "alphamap ";

impl FeederProperties {
    pub fn alpha_map(&self, material: &str) -> Option<&str> {
        self.alpha_maps
            .iter()
            .find(|alpha_map| alpha_map.material == material)
            .map(|alpha_map| alpha_map.source.as_str())
    }

    pub fn set_alpha_map(&mut self, material: &str, source: &str) {
        match self
            .alpha_maps
            .iter_mut()
            .find(|alpha_map| alpha_map.material == material)
        {
            Some(alpha_map) => alpha_map.source = source.to_string(),
            None => self.alpha_maps.push(AlphaMapSource {
                material: material.to_string(),
                source: source.to_string(),
            }),
        }
    }
}

fn alpha_map_material(name: &str) -> Option<&str> {
    let name = name.trim();
    let prefix = name.get(..ALPHA_MAP_PREFIX.len())?;

    prefix
        .eq_ignore_ascii_case(ALPHA_MAP_PREFIX)
        .then(|| name[ALPHA_MAP_PREFIX.len()..].trim())
        .filter(|material| !material.is_empty())
}

impl Properties for FeederProperties {
    const PARAMETERS: &'static [Parameter<Self>] = &[
        Parameter::new(
            "heightmap source",
            |p, v| {
                p.heightmap_source = v.to_string();
                Ok(())
            },
            |p| p.heightmap_source.clone(),
        ),
        Parameter::new(
            "heightmap format",
            |p, v| {
                p.heightmap_format = v.parse()?;
                Ok(())
            },
            |p| p.heightmap_format.to_string(),
        ),
        Parameter::new(
            "materialmap source",
            |p, v| {
                p.materialmap_source = v.to_string();
                Ok(())
            },
            |p| p.materialmap_source.clone(),
        ),
        Parameter::new(
            "offset",
            |p, v| {
                p.offset = v.parse()?;
                Ok(())
            },
            |p| p.offset.to_string(),
        ),
        Parameter::new(
            "scale",
            |p, v| {
                p.scale = v.parse()?;
                Ok(())
            },
            |p| p.scale.to_string(),
        ),
        Parameter::new(
            "smooth heightmap",
            |p, v| {
                p.smooth_heightmap = parse_bool(v)?;
                Ok(())
            },
            |p| p.smooth_heightmap.to_string(),
        ),
    ];

    fn set_parameter(&mut self, name: &str, value: &str) -> Result<()> {
        match alpha_map_material(name) {
            Some(material) => {
                self.set_alpha_map(material, value.trim());
                Ok(())
            }
            None => set_table_parameter(self, name, value),
        }
    }

    fn get_parameter(&self, name: &str) -> Option<String> {
        match alpha_map_material(name) {
            Some(material) => self.alpha_map(material).map(str::to_string),
            None => get_table_parameter(self, name),
        }
    }

    fn parameters(&self) -> Vec<(String, String)> {
        let mut parameters: Vec<_> = Self::PARAMETERS
            .iter()
            .map(|parameter| (parameter.name.to_string(), (parameter.get)(self)))
            .collect();

        parameters.extend(self.alpha_maps.iter().map(|alpha_map| {
            (
                format!("{ALPHA_MAP_PREFIX}{}", alpha_map.material),
                alpha_map.source.clone(),
            )
        }));

        parameters
    }
}
