//! ### English
//! Owned worker pool for batch scene advancement.
//!
//! Explicitly constructed and explicitly shut down, never a process global.
//! A fixed set of workers drains a bounded task queue; `run_batch` blocks the
//! caller until every job in the batch has completed, observing completions
//! in submission order.
//!
//! ### 中文
//! 用于批量场景推进的自有 worker 池。
//!
//! 显式构造、显式关闭——绝不是进程级全局对象。固定数量的 worker 消费有界任务
//! 队列；`run_batch` 阻塞调用方直到本批次所有任务完成，并按提交顺序观察完成。

use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded};

/// ### English
/// Default worker count, sized for typical scene batches.
///
/// ### 中文
/// 默认 worker 数量，按典型场景批次规模设定。
pub const DEFAULT_WORKER_COUNT: usize = 6;

/// Queue depth bound; submitters block rather than queue unboundedly.
const TASK_QUEUE_DEPTH: usize = 64;

/// One advance job. Scene access is captured by the closure.
pub type Job = Box<dyn FnOnce() + Send>;

struct Task {
    job: Job,
    batch: Arc<BatchState>,
    index: usize,
}

struct BatchState {
    done: Mutex<Vec<bool>>,
    cond: Condvar,
}

impl BatchState {
    fn mark_done(&self, index: usize) {
        let mut done = self.done.lock().unwrap();
        done[index] = true;
        drop(done);
        self.cond.notify_all();
    }

    fn wait(&self, index: usize) {
        let mut done = self.done.lock().unwrap();
        while !done[index] {
            done = self.cond.wait(done).unwrap();
        }
    }
}

/// ### English
/// Handle to one submitted batch. Lets a caller consume completions in
/// submission order while later jobs are still running.
///
/// ### 中文
/// 一个已提交批次的句柄。允许调用方在后续任务仍在运行时按提交顺序消费完成结果。
pub struct BatchTicket {
    state: Arc<BatchState>,
    len: usize,
}

impl BatchTicket {
    /// Blocks until job `index` has completed.
    pub fn wait(&self, index: usize) {
        self.state.wait(index);
    }

    /// Blocks until every job in the batch has completed.
    pub fn wait_all(&self) {
        for index in 0..self.len {
            self.state.wait(index);
        }
    }
}

/// ### English
/// Fixed-size pool executing advance jobs off the render thread.
///
/// ### 中文
/// 在渲染线程之外执行推进任务的固定大小线程池。
pub struct AdvancePool {
    sender: Option<Sender<Task>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl AdvancePool {
    pub fn new(worker_count: usize) -> Self {
        let count = worker_count.max(1);
        let (sender, receiver): (Sender<Task>, Receiver<Task>) = bounded(TASK_QUEUE_DEPTH);

        let workers = (0..count)
            .map(|index| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("vexel-advance-{index}"))
                    .spawn(move || {
                        // Exits when the channel disconnects at shutdown.
                        while let Ok(task) = receiver.recv() {
                            (task.job)();
                            task.batch.mark_done(task.index);
                        }
                    })
                    .expect("failed to spawn advance worker")
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
        }
    }

    pub fn with_default_workers() -> Self {
        Self::new(DEFAULT_WORKER_COUNT)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// ### English
    /// Submits one batch of jobs and returns a ticket for draining their
    /// completions in submission order. After `shutdown`, jobs run inline on
    /// the caller and the ticket comes back already complete.
    ///
    /// ### 中文
    /// 提交一批任务并返回用于按提交顺序消费完成结果的票据。`shutdown` 之后任务
    /// 在调用方内联执行，返回的票据已全部完成。
    pub fn submit_batch(&self, jobs: Vec<Job>) -> BatchTicket {
        let len = jobs.len();
        let batch = Arc::new(BatchState {
            done: Mutex::new(vec![false; len]),
            cond: Condvar::new(),
        });

        let Some(sender) = &self.sender else {
            for (index, job) in jobs.into_iter().enumerate() {
                job();
                batch.mark_done(index);
            }
            return BatchTicket { state: batch, len };
        };

        for (index, job) in jobs.into_iter().enumerate() {
            let task = Task {
                job,
                batch: batch.clone(),
                index,
            };
            if let Err(send_error) = sender.send(task) {
                // Workers already gone; run inline so the ticket still
                // completes.
                let task = send_error.0;
                (task.job)();
                task.batch.mark_done(task.index);
            }
        }
        BatchTicket { state: batch, len }
    }

    /// Runs one batch and blocks until every job has finished.
    pub fn run_batch(&self, jobs: Vec<Job>) {
        self.submit_batch(jobs).wait_all();
    }

    /// ### English
    /// Deterministic shutdown: close the queue, join every worker. Jobs
    /// already queued still run to completion first.
    ///
    /// ### 中文
    /// 确定性关闭：关闭队列并 join 所有 worker。已入队的任务会先执行完毕。
    pub fn shutdown(&mut self) {
        self.sender = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for AdvancePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn batch_completes_every_job_before_returning() {
        let pool = AdvancePool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        let jobs: Vec<Job> = (0..16)
            .map(|_| {
                let counter = counter.clone();
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }) as Job
            })
            .collect();
        pool.run_batch(jobs);

        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn slow_early_jobs_do_not_stall_completion() {
        let pool = AdvancePool::new(2);
        let order = Arc::new(Mutex::new(Vec::new()));

        let jobs: Vec<Job> = (0..4)
            .map(|index| {
                let order = order.clone();
                Box::new(move || {
                    if index == 0 {
                        thread::sleep(Duration::from_millis(20));
                    }
                    order.lock().unwrap().push(index);
                }) as Job
            })
            .collect();
        pool.run_batch(jobs);

        let mut seen = order.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn ticket_hands_out_early_completions_while_later_jobs_run() {
        let pool = AdvancePool::new(2);
        let flags: Vec<_> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();

        let jobs: Vec<Job> = flags
            .iter()
            .enumerate()
            .map(|(index, flag)| {
                let flag = flag.clone();
                Box::new(move || {
                    if index == 2 {
                        thread::sleep(Duration::from_millis(20));
                    }
                    flag.store(1, Ordering::SeqCst);
                }) as Job
            })
            .collect();

        let ticket = pool.submit_batch(jobs);
        ticket.wait(0);
        assert_eq!(flags[0].load(Ordering::SeqCst), 1);
        ticket.wait_all();
        assert!(flags.iter().all(|f| f.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn shutdown_joins_and_falls_back_to_inline_execution() {
        let mut pool = AdvancePool::new(3);
        assert_eq!(pool.worker_count(), 3);
        pool.shutdown();
        assert_eq!(pool.worker_count(), 0);

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in = ran.clone();
        pool.run_batch(vec![Box::new(move || {
            ran_in.fetch_add(1, Ordering::SeqCst);
        })]);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
