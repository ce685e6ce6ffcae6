use anyhow::{bail, Result};
use derive_more::derive::Display;
use std::sync::Arc;

/// An opaque, cheaply clonable reference to a render material, identified by name.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("{_0}")]
pub struct MaterialHandle(Arc<str>);

impl MaterialHandle {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MaterialHandle {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// The terrain wide list of splat materials.
///
/// Material maps store indices into this list, so entries may only be appended.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MaterialPalette {
    materials: Vec<MaterialHandle>,
}

impl MaterialPalette {
    pub fn new(materials: impl IntoIterator<Item = MaterialHandle>) -> Self {
        Self {
            materials: materials.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&MaterialHandle> {
        self.materials.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.materials
            .iter()
            .position(|material| material.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MaterialHandle> {
        self.materials.iter()
    }

    /// Replaces the palette, rejecting any change to an existing index.
    ///
    /// Returns whether new materials were appended.
    pub(crate) fn update(&mut self, materials: Vec<MaterialHandle>) -> Result<bool> {
        if let Some((index, (old, new))) = self
            .materials
            .iter()
            .zip(&materials)
            .enumerate()
            .find(|(_, (old, new))| old != new)
        {
            bail!("Material palette index {index} changed from `{old}` to `{new}`.");
        }

        if materials.len() < self.materials.len() {
            bail!(
                "Material palette shrank from {} to {} entries.",
                self.materials.len(),
                materials.len()
            );
        }

        let grew = materials.len() > self.materials.len();
        self.materials = materials;
        Ok(grew)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handles(names: &[&str]) -> Vec<MaterialHandle> {
        names.iter().copied().map(MaterialHandle::new).collect()
    }

    #[test]
    fn palette_appends() {
        let mut palette = MaterialPalette::default();

        assert!(palette.update(handles(&["grass", "rock"])).unwrap());
        assert!(palette.update(handles(&["grass", "rock", "snow"])).unwrap());
        assert!(!palette.update(handles(&["grass", "rock", "snow"])).unwrap());

        assert_eq!(palette.len(), 3);
        assert_eq!(palette.index_of("snow"), Some(2));
        assert_eq!(palette.get(1).map(MaterialHandle::name), Some("rock"));
    }

    #[test]
    fn palette_rejects_reordering() {
        let mut palette = MaterialPalette::new(handles(&["grass", "rock"]));

        assert!(palette.update(handles(&["rock", "grass"])).is_err());
        assert!(palette.update(handles(&["grass"])).is_err());
        assert_eq!(palette.len(), 2);
    }
}
