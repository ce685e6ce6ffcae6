use crate::math::GridRect;
use ndarray::{Array2, Zip};
use std::sync::Arc;

/// Coverage of one palette material over a cell's material grid, `255` is full coverage.
#[derive(Clone, Debug, PartialEq)]
pub struct AlphaMap {
    data: Array2<u8>,
}

impl AlphaMap {
    fn new(width: u32, height: u32) -> Self {
        Self {
            data: Array2::zeros((height as usize, width as usize)),
        }
    }

    pub fn width(&self) -> u32 {
        self.data.ncols() as u32
    }

    pub fn height(&self) -> u32 {
        self.data.nrows() as u32
    }

    pub fn data(&self) -> &Array2<u8> {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|&alpha| alpha == 0)
    }

    /// Row major bytes, ready for upload.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        self.data.as_slice()
    }
}

struct MaskLayer {
    map: Arc<AlphaMap>,
    in_use: bool,
}

/// One [`AlphaMap`] per palette material of a cell.
pub(crate) struct MaterialMasks {
    width: u32,
    height: u32,
    layers: Vec<MaskLayer>,
}

impl MaterialMasks {
    pub(crate) fn new(width: u32, height: u32, materials: usize) -> Self {
        let mut masks = Self {
            width,
            height,
            layers: Vec::new(),
        };

        masks.resize(materials);
        masks
    }

    /// Adds empty masks for newly appended palette entries.
    pub(crate) fn resize(&mut self, materials: usize) {
        while self.layers.len() < materials {
            self.layers.push(MaskLayer {
                map: Arc::new(AlphaMap::new(self.width, self.height)),
                in_use: false,
            });
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.layers.len()
    }

    /// Rebuilds every mask inside `rect` from palette indices.
    pub(crate) fn update_from_indices(&mut self, rect: GridRect, indices: &Array2<u8>) {
        let rect = rect.clamp_to(self.width, self.height);
        if indices.dim() != (rect.height as usize, rect.width as usize) {
            return;
        }

        for (material, layer) in self.layers.iter_mut().enumerate() {
            let map = Arc::make_mut(&mut layer.map);

            Zip::from(map.data.slice_mut(rect.slice()))
                .and(indices)
                .for_each(|alpha, &index| {
                    *alpha = if index as usize == material { u8::MAX } else { 0 };
                });

            layer.in_use = !map.is_empty();
        }
    }

    /// Replaces the coverage of one material inside `rect`.
    pub(crate) fn set_alpha(&mut self, material: usize, rect: GridRect, alpha: &Array2<u8>) {
        let rect = rect.clamp_to(self.width, self.height);
        let Some(layer) = self.layers.get_mut(material) else {
            return;
        };
        if alpha.dim() != (rect.height as usize, rect.width as usize) {
            return;
        }

        let map = Arc::make_mut(&mut layer.map);
        map.data.slice_mut(rect.slice()).assign(alpha);
        layer.in_use = !map.is_empty();
    }

    /// Palette indices and masks of every material present in the cell.
    pub(crate) fn active(&self) -> impl Iterator<Item = (usize, &Arc<AlphaMap>)> {
        self.layers
            .iter()
            .enumerate()
            .filter(|(_, layer)| layer.in_use)
            .map(|(material, layer)| (material, &layer.map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn indices_split_into_masks() {
        let mut masks = MaterialMasks::new(2, 2, 3);

        masks.update_from_indices(GridRect::full(2, 2), &array![[0, 2], [2, 7]]);

        let active: Vec<_> = masks.active().map(|(material, map)| (material, map.data().clone())).collect();
        assert_eq!(
            active,
            vec![
                (0, array![[255, 0], [0, 0]]),
                (2, array![[0, 255], [255, 0]]),
            ]
        );
    }

    #[test]
    fn partial_updates_keep_the_rest() {
        let mut masks = MaterialMasks::new(4, 4, 2);
        masks.update_from_indices(GridRect::full(4, 4), &Array2::from_elem((4, 4), 1));

        let before = Arc::clone(masks.active().next().unwrap().1);
        masks.update_from_indices(GridRect::new(0, 0, 1, 1), &array![[0]]);

        let active: Vec<_> = masks.active().map(|(material, _)| material).collect();
        assert_eq!(active, vec![0, 1]);

        let rock = masks.active().nth(1).unwrap().1;
        assert_eq!(rock.data()[[0, 0]], 0);
        assert_eq!(rock.data()[[3, 3]], 255);
        // maps handed out before the update are not modified
        assert_eq!(before.data()[[0, 0]], 255);
    }

    #[test]
    fn alpha_and_palette_growth() {
        let mut masks = MaterialMasks::new(2, 2, 1);
        masks.set_alpha(3, GridRect::full(2, 2), &array![[1, 1], [1, 1]]);
        assert_eq!(masks.active().count(), 0);

        masks.resize(4);
        assert_eq!(masks.len(), 4);
        masks.set_alpha(3, GridRect::new(1, 1, 1, 1), &array![[128]]);

        let (material, map) = masks.active().next().unwrap();
        assert_eq!(material, 3);
        assert_eq!(map.data(), &array![[0, 0], [0, 128]]);
    }
}
