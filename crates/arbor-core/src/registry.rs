//! Deduplication of equivalent tasks.
//!
//! Each stage keeps one [`TaskRegistry`]. Requests for a calculation that is
//! equivalent to a live task attach to it instead of creating a second one;
//! the task lives as long as some [`TaskHandle`] refers to it.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, error, trace};

use crate::error::{EngineError, Result};
use crate::task::{Calculation, VersionedTask};

/// Monotonic version source shared by all registries of one engine.
#[derive(Debug, Default)]
pub struct VersionCounter(AtomicU64);

impl VersionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn latest(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

struct RegistryInner<C: Calculation> {
    name: &'static str,
    versions: Arc<VersionCounter>,
    tasks: Mutex<Vec<Arc<VersionedTask<C>>>>,
}

impl<C: Calculation> RegistryInner<C> {
    fn lock(&self) -> MutexGuard<'_, Vec<Arc<VersionedTask<C>>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct TaskRegistry<C: Calculation> {
    inner: Arc<RegistryInner<C>>,
}

impl<C: Calculation> Clone for TaskRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Calculation> TaskRegistry<C> {
    pub fn new(name: &'static str, versions: Arc<VersionCounter>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                name,
                versions,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns a handle to a live equivalent task, or to a new task with a
    /// fresh version. Equivalence must hold in both directions.
    pub fn get_or_create(&self, calculation: C) -> Result<TaskHandle<C>> {
        let mut tasks = self.inner.lock();
        tasks.retain(|task| !task.is_released());

        for task in tasks.iter() {
            let forward = calculation.is_equivalent_to(task.calculation());
            let backward = task.calculation().is_equivalent_to(&calculation);
            if forward != backward {
                error!(
                    "{}: `{}` and `{}` (v{}) disagree on equivalence",
                    self.inner.name,
                    calculation.description(),
                    task.description(),
                    task.version()
                );
                return Err(EngineError::EquivalenceViolation {
                    description: calculation.description().to_string(),
                });
            }
            if forward {
                debug!(
                    "{}: attaching to `{}` (v{})",
                    self.inner.name,
                    task.description(),
                    task.version()
                );
                task.acquire();
                return Ok(TaskHandle::new(Arc::clone(task), &self.inner, true));
            }
        }

        let version = self.inner.versions.next();
        trace!(
            "{}: new task `{}` (v{version})",
            self.inner.name,
            calculation.description()
        );
        let task = Arc::new(VersionedTask::new(version, calculation));
        task.acquire();
        tasks.push(Arc::clone(&task));
        Ok(TaskHandle::new(task, &self.inner, false))
    }

    /// Releases every task older than `version`. Returns how many were released.
    pub fn supersede(&self, version: u64) -> usize {
        let mut tasks = self.inner.lock();
        let before = tasks.len();
        tasks.retain(|task| {
            if task.version() < version {
                task.release();
                false
            } else {
                true
            }
        });
        let released = before - tasks.len();
        if released > 0 {
            debug!(
                "{}: {released} task(s) superseded by v{version}",
                self.inner.name
            );
        }
        released
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn versions(&self) -> &Arc<VersionCounter> {
        &self.inner.versions
    }
}

impl<C: Calculation> fmt::Debug for TaskRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("name", &self.inner.name)
            .field("tasks", &self.len())
            .finish()
    }
}

/// Counted reference to a registered task. Dropping the last handle releases
/// the task and removes it from its registry.
pub struct TaskHandle<C: Calculation> {
    task: Arc<VersionedTask<C>>,
    registry: Weak<RegistryInner<C>>,
    attached: bool,
}

impl<C: Calculation> TaskHandle<C> {
    fn new(task: Arc<VersionedTask<C>>, registry: &Arc<RegistryInner<C>>, attached: bool) -> Self {
        Self {
            task,
            registry: Arc::downgrade(registry),
            attached,
        }
    }

    pub fn task(&self) -> &Arc<VersionedTask<C>> {
        &self.task
    }

    /// `true` when this handle joined a task that already existed.
    pub fn is_attached(&self) -> bool {
        self.attached
    }
}

impl<C: Calculation> Deref for TaskHandle<C> {
    type Target = VersionedTask<C>;

    fn deref(&self) -> &Self::Target {
        &self.task
    }
}

impl<C: Calculation> Drop for TaskHandle<C> {
    fn drop(&mut self) {
        match self.registry.upgrade() {
            Some(inner) => {
                let mut tasks = inner.lock();
                if self.task.release_ref() {
                    self.task.release();
                    tasks.retain(|task| !Arc::ptr_eq(task, &self.task));
                }
            }
            None => {
                if self.task.release_ref() {
                    self.task.release();
                }
            }
        }
    }
}

impl<C: Calculation> fmt::Debug for TaskHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task", &self.task)
            .field("attached", &self.attached)
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
