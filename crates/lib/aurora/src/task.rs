use crate::{
    error::RenderError,
    memory_pool::{ScratchAllocation, ScratchBufferPool},
};
use aurora_backend::{Command, CommandList, Device};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

/// Rotates command allocators, scratch memory and per-frame constants over
/// `task_count` in-flight tasks.
///
/// A task ends with `complete_task`, which signals the fence with the task's
/// number. Before slot `i` is reused, the fence value of the task that last
/// used it is awaited, so everything attributed to that slot is idle.
pub struct TaskScheduler {
    device: Device,
    task_count: usize,
    task_index: usize,
    task_number: u64,
    command_list: CommandList,
    // Submitted commands per slot. They own the resources they reference.
    in_flight: Vec<Vec<Command>>,
    scratch: ScratchBufferPool,
}

impl TaskScheduler {
    pub fn new(device: Device, task_count: usize) -> Self {
        assert!(task_count > 0);
        assert!(
            device.command_allocator_count() >= task_count,
            "device has {} command allocators, {} tasks requested",
            device.command_allocator_count(),
            task_count
        );

        Self {
            scratch: ScratchBufferPool::new(device.clone(), task_count),
            device,
            task_count,
            task_index: 0,
            task_number: 0,
            command_list: CommandList::new("main"),
            in_flight: (0..task_count).map(|_| Vec::new()).collect(),
        }
    }

    pub fn task_count(&self) -> usize {
        self.task_count
    }

    pub fn task_index(&self) -> usize {
        self.task_index
    }

    pub fn task_number(&self) -> u64 {
        self.task_number
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The open command list, beginning it on first use within a submission.
    pub fn command_list(&mut self) -> &mut CommandList {
        if !self.command_list.is_open() {
            self.command_list.begin();
        }
        &mut self.command_list
    }

    pub fn scratch(&mut self, size: u64) -> Result<ScratchAllocation, RenderError> {
        self.scratch.get(size)
    }

    /// Closes and submits the open command list, if any.
    pub fn submit_command_list(&mut self) -> Result<(), RenderError> {
        if !self.command_list.is_open() {
            return Ok(());
        }

        self.command_list.close();
        self.device.submit(self.task_index, &self.command_list)?;

        let commands = self.command_list.take_commands();
        self.in_flight[self.task_index].extend(commands);
        Ok(())
    }

    pub fn complete_task(&mut self) -> Result<(), RenderError> {
        self.submit_command_list()?;

        self.device.signal_fence(self.task_number + 1)?;
        self.task_number += 1;
        self.task_index = (self.task_number % self.task_count as u64) as usize;

        // The slot we are about to reuse was last used by task
        // `task_number - task_count + 1`.
        if self.task_number >= self.task_count as u64 {
            self.device
                .wait_for_fence(self.task_number - self.task_count as u64 + 1)?;
        }

        self.device.reset_command_allocator(self.task_index)?;
        self.in_flight[self.task_index].clear();
        self.scratch.advance_task(self.task_index);

        trace!(
            "Completed task {}; next slot {}",
            self.task_number,
            self.task_index
        );
        Ok(())
    }

    /// Blocks until the most recently completed task has finished on the GPU.
    pub fn wait_for_task(&mut self) -> Result<(), RenderError> {
        if self.task_number > 0 {
            self.device.wait_for_fence(self.task_number)?;
        }
        Ok(())
    }

    /// Submits pending work, then drains the queue and every slot.
    pub fn flush(&mut self) -> Result<(), RenderError> {
        if self.command_list.is_open() {
            self.complete_task()?;
        }
        self.wait_for_task()?;
        self.device.wait_idle()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aurora_backend::{headless::HeadlessDevice, RenderDevice};
    use std::sync::Arc;

    #[test]
    fn tasks_wrap_around_the_allocators() {
        let headless = Arc::new(HeadlessDevice::new(3));
        let mut tasks = TaskScheduler::new(Device::new(headless.clone()), 3);

        for _ in 0..7 {
            tasks.command_list();
            tasks.complete_task().unwrap();
        }

        let log = headless.log();
        assert_eq!(log.fence_signals, vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(log.allocator_resets, vec![1, 2, 0, 1, 2, 0, 1]);
        // Slot 0 is reset after tasks 3 and 6, each after waiting for the
        // task that last used it.
        assert_eq!(log.fence_waits, vec![1, 2, 3, 4, 5]);
        assert_eq!(log.submissions.len(), 7);
        assert_eq!(
            log.submissions
                .iter()
                .map(|s| s.allocator_index)
                .collect::<Vec<_>>(),
            vec![0, 1, 2, 0, 1, 2, 0]
        );

        tasks.wait_for_task().unwrap();
        assert!(headless.completed_fence_value() >= 7);
        assert_eq!(tasks.task_number(), 7);
        assert_eq!(tasks.task_index(), 1);
    }

    #[test]
    fn completing_without_work_still_signals() {
        let headless = Arc::new(HeadlessDevice::new(2));
        let mut tasks = TaskScheduler::new(Device::new(headless.clone()), 2);
        tasks.complete_task().unwrap();
        assert_eq!(headless.log().fence_signals, vec![1]);
        assert!(headless.log().submissions.is_empty());
    }
}
