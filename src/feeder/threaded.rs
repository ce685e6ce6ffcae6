use super::{decode, finish_load, load_now, DataFeeder, DataSource, FeederSnapshot, Job, JobQueue, StagedCellData};
use crate::{cell::Cell, material::MaterialPalette};
use anyhow::{anyhow, Result};
use bevy::prelude::*;
use std::sync::Arc;

/// The decode job of a pre-loaded cell, kept in the cell's feeder slot.
struct PendingLoad(Arc<Job<Result<StagedCellData>>>);

/// Decodes cell sources on the [`bevy::tasks::AsyncComputeTaskPool`].
///
/// Pre-loading queues a decode job. Loading waits for that job, running it
/// inline if no worker picked it up yet, and commits the result on the
/// calling thread. Cells that were never pre-loaded are decoded inline.
#[derive(Clone)]
pub struct ThreadedDataFeeder {
    source: Arc<dyn DataSource>,
    queue: JobQueue,
}

impl ThreadedDataFeeder {
    pub fn new(source: impl DataSource + 'static) -> Self {
        Self {
            source: Arc::new(source),
            queue: default(),
        }
    }
}

impl DataFeeder for ThreadedDataFeeder {
    fn pre_load(&mut self, cell: &mut Cell, palette: &MaterialPalette) -> bool {
        if cell.attachments().contains::<PendingLoad>() {
            return true;
        }

        let snapshot = FeederSnapshot::capture(cell, palette);
        let source = Arc::clone(&self.source);
        let job = Job::new(move || decode(&snapshot, source.as_ref()));

        self.queue.enqueue(Arc::clone(&job));
        cell.attachments_mut().insert(PendingLoad(job));
        debug!("Queued the sources of {}.", cell.id());

        true
    }

    fn load(&mut self, cell: &mut Cell, palette: &MaterialPalette) -> bool {
        match cell.attachments_mut().remove::<PendingLoad>() {
            Some(PendingLoad(job)) => {
                let staged = job
                    .wait()
                    .unwrap_or_else(|| Err(anyhow!("The decode job produced no result.")));
                finish_load(cell, staged)
            }
            None => load_now(cell, palette, self.source.as_ref()),
        }
    }
}
