//! Admission-controlled task runner.
//!
//! A single run loop owns every submitted [`LoaderTask`]. Items are admitted
//! in submission order while both caps hold:
//!
//! - at most `max_items` items processing at once, across all groups;
//! - the summed workload of processing items stays within `max_workload`.
//!
//! The admission scan is strict FIFO: it stops at the first pending item
//! that does not fit, so a large item is never overtaken by later small
//! ones. An item larger than the whole workload cap is admitted once nothing
//! else is processing and then runs alone.
//!
//! The loop only wakes for two events, a new submission or a finished item,
//! and re-runs the admission scan after each. When every item of a group is
//! done the group's aggregate result is sent to the submitter. The loop
//! exits once all [`ProcessingScheduler`] handles are dropped and no group
//! is left.

use anyhow::{anyhow, Result};
use futures::FutureExt;
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::SchedulerConfig;
use crate::models::LoaderReturn;
use crate::tasks::{Aggregate, LoaderTask, LoaderTaskItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerLimits {
    pub max_items: usize,
    pub max_workload: u64,
}

impl From<&SchedulerConfig> for SchedulerLimits {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            max_items: config.max_processing_items,
            max_workload: config.max_workload_bytes(),
        }
    }
}

/// Snapshot of the run loop's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub processing: usize,
    pub workload: u64,
    pub pending: usize,
    pub peak_processing: usize,
    pub peak_workload: u64,
    pub completed: u64,
}

struct Submission {
    task: LoaderTask,
    reply: oneshot::Sender<LoaderReturn>,
}

struct Completion {
    group: u64,
    index: usize,
    result: LoaderReturn,
}

enum ItemState {
    Pending(LoaderTaskItem),
    Processing { workload: u64 },
    Done(LoaderReturn),
}

struct Group {
    id: u64,
    items: Vec<ItemState>,
    /// Index of the first item not yet admitted.
    next: usize,
    /// Items not yet `Done`.
    remaining: usize,
    aggregate: Aggregate,
    reply: oneshot::Sender<LoaderReturn>,
}

impl Group {
    fn pending(&self) -> usize {
        self.items.len() - self.next
    }
}

/// Handle to a running scheduler. Cheap to clone; all clones feed the same
/// run loop.
#[derive(Clone)]
pub struct ProcessingScheduler {
    submissions: mpsc::UnboundedSender<Submission>,
    stats: watch::Receiver<SchedulerStats>,
}

impl ProcessingScheduler {
    /// Spawn the run loop on the current tokio runtime.
    pub fn start(limits: SchedulerLimits) -> Self {
        let (submissions, submissions_rx) = mpsc::unbounded_channel();
        let (completions, completions_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats) = watch::channel(SchedulerStats::default());

        let run_loop = RunLoop {
            limits: SchedulerLimits {
                max_items: limits.max_items.max(1),
                max_workload: limits.max_workload,
            },
            groups: VecDeque::new(),
            next_group: 0,
            stats: SchedulerStats::default(),
            completions,
            stats_tx,
        };
        tokio::spawn(run_loop.run(submissions_rx, completions_rx));

        Self { submissions, stats }
    }

    /// Register a task and wait for its aggregate result.
    pub async fn submit(&self, task: LoaderTask) -> Result<LoaderReturn> {
        let (reply, result) = oneshot::channel();
        self.submissions
            .send(Submission { task, reply })
            .map_err(|_| anyhow!("scheduler is not running"))?;
        result
            .await
            .map_err(|_| anyhow!("scheduler dropped the task before it completed"))
    }

    pub fn stats(&self) -> SchedulerStats {
        *self.stats.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerStats> {
        self.stats.clone()
    }
}

struct RunLoop {
    limits: SchedulerLimits,
    groups: VecDeque<Group>,
    next_group: u64,
    stats: SchedulerStats,
    completions: mpsc::UnboundedSender<Completion>,
    stats_tx: watch::Sender<SchedulerStats>,
}

impl RunLoop {
    async fn run(
        mut self,
        mut submissions: mpsc::UnboundedReceiver<Submission>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        let mut accepting = true;
        loop {
            if !accepting && self.groups.is_empty() {
                break;
            }
            tokio::select! {
                submission = submissions.recv(), if accepting => match submission {
                    Some(submission) => self.register(submission),
                    None => accepting = false,
                },
                Some(completion) = completions.recv() => self.complete(completion),
            }
            self.admit();
            self.publish();
        }
        tracing::debug!(completed = self.stats.completed, "scheduler stopped");
    }

    fn register(&mut self, submission: Submission) {
        let Submission { task, reply } = submission;
        if task.items.is_empty() {
            let _ = reply.send(task.aggregate.finish(Vec::new()));
            return;
        }

        let id = self.next_group;
        self.next_group += 1;
        let remaining = task.items.len();
        tracing::debug!(group = id, items = remaining, "task registered");
        self.groups.push_back(Group {
            id,
            items: task.items.into_iter().map(ItemState::Pending).collect(),
            next: 0,
            remaining,
            aggregate: task.aggregate,
            reply,
        });
    }

    fn fits(&self, workload: u64) -> bool {
        if self.stats.processing >= self.limits.max_items {
            return false;
        }
        self.stats.processing == 0
            || self.stats.workload.saturating_add(workload) <= self.limits.max_workload
    }

    /// Admit pending items in group order until one does not fit.
    fn admit(&mut self) {
        for g in 0..self.groups.len() {
            loop {
                let group = &self.groups[g];
                let index = group.next;
                let Some(ItemState::Pending(item)) = group.items.get(index) else {
                    break;
                };
                let workload = item.workload;
                if !self.fits(workload) {
                    return;
                }

                let group = &mut self.groups[g];
                let group_id = group.id;
                group.next += 1;
                let state = std::mem::replace(
                    &mut group.items[index],
                    ItemState::Processing { workload },
                );
                let ItemState::Pending(item) = state else {
                    continue;
                };

                self.stats.processing += 1;
                self.stats.workload += workload;
                self.stats.peak_processing = self.stats.peak_processing.max(self.stats.processing);
                self.stats.peak_workload = self.stats.peak_workload.max(self.stats.workload);
                tracing::debug!(
                    group = group_id,
                    item = %item.label,
                    workload,
                    processing = self.stats.processing,
                    "item admitted"
                );
                self.spawn(group_id, index, item);
            }
        }
    }

    fn spawn(&self, group: u64, index: usize, item: LoaderTaskItem) {
        let completions = self.completions.clone();
        let LoaderTaskItem { label, work, .. } = item;
        tokio::spawn(async move {
            let result = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(result) => result,
                Err(_) => {
                    tracing::error!(item = %label, "item panicked");
                    LoaderReturn::error(format!("{} panicked", label))
                }
            };
            let _ = completions.send(Completion {
                group,
                index,
                result,
            });
        });
    }

    fn complete(&mut self, completion: Completion) {
        let Completion {
            group,
            index,
            result,
        } = completion;
        let Some(position) = self.groups.iter().position(|g| g.id == group) else {
            return;
        };
        let entry = &mut self.groups[position];
        let Some(slot) = entry.items.get_mut(index) else {
            return;
        };
        let ItemState::Processing { workload } = *slot else {
            return;
        };
        *slot = ItemState::Done(result);
        entry.remaining -= 1;
        self.stats.processing -= 1;
        self.stats.workload -= workload;
        self.stats.completed += 1;
        tracing::debug!(group, index, processing = self.stats.processing, "item completed");

        if entry.remaining > 0 {
            return;
        }
        let Some(finished) = self.groups.remove(position) else {
            return;
        };
        let results: Vec<LoaderReturn> = finished
            .items
            .into_iter()
            .filter_map(|s| match s {
                ItemState::Done(result) => Some(result),
                _ => None,
            })
            .collect();
        let aggregate = finished.aggregate.finish(results);
        tracing::debug!(
            group,
            entries = aggregate.entries_added,
            loader_type = %aggregate.loader_type,
            "task resolved"
        );
        let _ = finished.reply.send(aggregate);
    }

    fn publish(&mut self) {
        self.stats.pending = self.groups.iter().map(Group::pending).sum();
        self.stats_tx.send_replace(self.stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MB;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn item(workload: u64, work: impl std::future::Future<Output = LoaderReturn> + Send + 'static) -> LoaderTaskItem {
        LoaderTaskItem::new(workload, format!("w{}", workload), work.boxed())
    }

    fn ok(id: &str) -> LoaderReturn {
        LoaderReturn::indexed(1, id.to_string(), "note".to_string())
    }

    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        max: AtomicUsize,
    }

    impl Gauge {
        async fn hold(&self, millis: u64) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn gauged_task(gauge: &Arc<Gauge>, items: usize, workload: u64) -> LoaderTask {
        let items = (0..items)
            .map(|i| {
                let gauge = gauge.clone();
                item(workload, async move {
                    gauge.hold(20).await;
                    ok(&format!("id{}", i))
                })
            })
            .collect();
        LoaderTask {
            items,
            aggregate: Aggregate::Directory {
                unique_id: "directory:/t".into(),
                carried: Vec::new(),
            },
        }
    }

    #[tokio::test]
    async fn item_cap_is_respected_across_groups() {
        let scheduler = ProcessingScheduler::start(SchedulerLimits {
            max_items: 3,
            max_workload: 1_000,
        });
        let gauge = Arc::new(Gauge::default());

        let (a, b, c) = tokio::join!(
            scheduler.submit(gauged_task(&gauge, 5, 10)),
            scheduler.submit(gauged_task(&gauge, 5, 10)),
            scheduler.submit(gauged_task(&gauge, 5, 10)),
        );
        for result in [a, b, c] {
            assert_eq!(result.unwrap().entries_added, 5);
        }
        assert!(gauge.max.load(Ordering::SeqCst) <= 3);

        let stats = scheduler.stats();
        assert!(stats.peak_processing <= 3);
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.workload, 0);
        assert_eq!(stats.completed, 15);
    }

    #[tokio::test]
    async fn workload_cap_is_respected() {
        let scheduler = ProcessingScheduler::start(SchedulerLimits {
            max_items: 10,
            max_workload: 25,
        });
        let gauge = Arc::new(Gauge::default());
        let result = scheduler.submit(gauged_task(&gauge, 6, 10)).await.unwrap();
        assert_eq!(result.entries_added, 6);
        assert!(gauge.max.load(Ordering::SeqCst) <= 2);
        assert!(scheduler.stats().peak_workload <= 25);
    }

    #[tokio::test]
    async fn oversized_item_runs_alone_and_blocks_later_items() {
        let scheduler = ProcessingScheduler::start(SchedulerLimits {
            max_items: 30,
            max_workload: 80 * MB,
        });
        let events = Arc::new(Mutex::new(Vec::new()));

        let big = {
            let events = events.clone();
            LoaderTask::single(item(100 * MB, async move {
                events.lock().unwrap().push("big-start");
                tokio::time::sleep(Duration::from_millis(50)).await;
                events.lock().unwrap().push("big-end");
                ok("big")
            }))
        };
        let small = {
            let events = events.clone();
            LoaderTask::single(item(10 * MB, async move {
                events.lock().unwrap().push("small-start");
                ok("small")
            }))
        };

        let (big, small) = tokio::time::timeout(
            Duration::from_secs(5),
            async { tokio::join!(scheduler.submit(big), scheduler.submit(small)) },
        )
        .await
        .expect("oversized item must not starve");

        assert_eq!(big.unwrap().unique_id, "big");
        assert_eq!(small.unwrap().unique_id, "small");
        assert_eq!(
            *events.lock().unwrap(),
            vec!["big-start", "big-end", "small-start"]
        );
        assert_eq!(scheduler.stats().peak_workload, 100 * MB);
        assert_eq!(scheduler.stats().peak_processing, 1);
    }

    #[tokio::test]
    async fn admission_is_fifo_across_groups() {
        let scheduler = ProcessingScheduler::start(SchedulerLimits {
            max_items: 1,
            max_workload: 1_000,
        });
        let order = Arc::new(Mutex::new(Vec::new()));
        let task = |names: &[&'static str]| LoaderTask {
            items: names
                .iter()
                .map(|name| {
                    let order = order.clone();
                    let name = *name;
                    item(1, async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        order.lock().unwrap().push(name);
                        ok(name)
                    })
                })
                .collect(),
            aggregate: Aggregate::Directory {
                unique_id: "directory:/x".into(),
                carried: Vec::new(),
            },
        };

        let first = task(&["g1-a", "g1-b"]);
        let second = task(&["g2-a"]);
        let (r1, r2) = tokio::join!(scheduler.submit(first), scheduler.submit(second));
        assert_eq!(r1.unwrap().unique_ids, vec!["g1-a".to_string(), "g1-b".to_string()]);
        assert_eq!(r2.unwrap().unique_ids, vec!["g2-a".to_string()]);
        assert_eq!(*order.lock().unwrap(), vec!["g1-a", "g1-b", "g2-a"]);
    }

    #[tokio::test]
    async fn panicking_item_becomes_error_sentinel() {
        let scheduler = ProcessingScheduler::start(SchedulerLimits {
            max_items: 2,
            max_workload: 100,
        });
        let task = LoaderTask::single(item(1, async {
            if true {
                panic!("loader exploded");
            }
            ok("never")
        }));
        let result = scheduler.submit(task).await.unwrap();
        assert!(result.is_error());

        let after = scheduler
            .submit(LoaderTask::single(item(1, async { ok("fine") })))
            .await
            .unwrap();
        assert_eq!(after.unique_id, "fine");
        assert_eq!(scheduler.stats().processing, 0);
    }

    #[tokio::test]
    async fn large_group_completes_in_linear_time() {
        let scheduler = ProcessingScheduler::start(SchedulerLimits {
            max_items: 30,
            max_workload: u64::MAX,
        });
        let n = 40_000;
        let task = LoaderTask {
            items: (0..n)
                .map(|i| item(1, async move { ok(&format!("f{}", i)) }))
                .collect(),
            aggregate: Aggregate::Directory {
                unique_id: "directory:/big".into(),
                carried: Vec::new(),
            },
        };

        let result = tokio::time::timeout(Duration::from_secs(20), scheduler.submit(task))
            .await
            .expect("large group should resolve promptly")
            .unwrap();
        assert_eq!(result.entries_added, n);
        assert_eq!(result.unique_ids.len(), n);
        assert_eq!(scheduler.stats().completed, n as u64);
        assert_eq!(scheduler.stats().processing, 0);
    }

    #[tokio::test]
    async fn empty_task_resolves_immediately() {
        let scheduler = ProcessingScheduler::start(SchedulerLimits {
            max_items: 1,
            max_workload: 1,
        });
        let result = scheduler
            .submit(LoaderTask {
                items: Vec::new(),
                aggregate: Aggregate::Directory {
                    unique_id: "directory:/empty".into(),
                    carried: vec!["file_kept".into()],
                },
            })
            .await
            .unwrap();
        assert_eq!(result.entries_added, 0);
        assert_eq!(result.unique_ids, vec!["file_kept".to_string()]);
    }

    #[tokio::test]
    async fn run_loop_exits_when_handles_drop() {
        let scheduler = ProcessingScheduler::start(SchedulerLimits {
            max_items: 1,
            max_workload: 1,
        });
        let mut stats = scheduler.subscribe();
        drop(scheduler);
        tokio::time::timeout(Duration::from_secs(5), async {
            while stats.changed().await.is_ok() {}
        })
        .await
        .expect("run loop should stop");
    }
}
