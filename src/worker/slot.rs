//! Bounded pool of runner slots.
//!
//! Each slot holds at most one in-flight job, and a job id is held by at
//! most one slot. The table is owned by the runner loop, so no locking.

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::job::JobId;

/// A job dispatched into a slot.
#[derive(Debug)]
pub struct ActiveJob {
    pub job_id: JobId,
    /// Child of the shutdown token; cancelled on abort or shutdown.
    pub cancel: CancellationToken,
    pub handle: JoinHandle<()>,
    pub dispatched_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct RunnerSlot {
    pub slot_id: usize,
    pub current: Option<ActiveJob>,
}

impl RunnerSlot {
    pub fn occupied(&self) -> bool {
        self.current.is_some()
    }
}

#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<RunnerSlot>,
}

impl SlotTable {
    pub fn new(count: usize) -> Self {
        Self {
            slots: (0..count)
                .map(|slot_id| RunnerSlot {
                    slot_id,
                    current: None,
                })
                .collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Lowest-numbered free slot.
    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().find(|s| !s.occupied()).map(|s| s.slot_id)
    }

    pub fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|s| s.occupied()).count()
    }

    pub fn holds(&self, job_id: &JobId) -> bool {
        self.find_by_job(job_id).is_some()
    }

    pub fn find_by_job(&self, job_id: &JobId) -> Option<&RunnerSlot> {
        self.slots
            .iter()
            .find(|s| s.current.as_ref().is_some_and(|a| &a.job_id == job_id))
    }

    /// Put a job into a slot.
    pub fn occupy(&mut self, slot_id: usize, job: ActiveJob) -> Result<(), JobError> {
        if let Some(holder) = self.find_by_job(&job.job_id) {
            return Err(JobError::AlreadyInFlight {
                id: job.job_id,
                slot: holder.slot_id,
            });
        }
        let slot = self
            .slots
            .get_mut(slot_id)
            .filter(|s| !s.occupied())
            .ok_or(JobError::SlotOccupied { slot: slot_id })?;
        slot.current = Some(job);
        Ok(())
    }

    /// Free a slot, returning the job it held.
    pub fn release(&mut self, slot_id: usize) -> Option<ActiveJob> {
        self.slots.get_mut(slot_id).and_then(|s| s.current.take())
    }

    /// Cancel one job by id. Returns false if no slot holds it.
    pub fn cancel(&self, job_id: &JobId) -> bool {
        match self.find_by_job(job_id).and_then(|s| s.current.as_ref()) {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for active in self.slots.iter().filter_map(|s| s.current.as_ref()) {
            active.cancel.cancel();
        }
    }
}
