use super::{load_now, DataFeeder, DataSource};
use crate::{cell::Cell, material::MaterialPalette};
use std::sync::Arc;

/// Loads cells synchronously on the calling thread.
///
/// Pre-loading does nothing, all work happens in [`DataFeeder::load`].
#[derive(Clone)]
pub struct SimpleDataFeeder {
    source: Arc<dyn DataSource>,
}

impl SimpleDataFeeder {
    pub fn new(source: impl DataSource + 'static) -> Self {
        Self {
            source: Arc::new(source),
        }
    }
}

impl DataFeeder for SimpleDataFeeder {
    fn pre_load(&mut self, _cell: &mut Cell, _palette: &MaterialPalette) -> bool {
        true
    }

    fn load(&mut self, cell: &mut Cell, palette: &MaterialPalette) -> bool {
        load_now(cell, palette, self.source.as_ref())
    }
}
