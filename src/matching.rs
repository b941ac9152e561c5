//! Temporal fusion of independent sample streams.
//!
//! One stream leads (by convention the lowest rate one, scene video), the
//! others follow. For every leader sample the follower queues are searched
//! for the nearest wall clock match within a window; follower samples too
//! old to ever match again are discarded. The bounded queue is the only
//! synchronization primitive between producers and the matcher, timestamps
//! are the sequencing key.

use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::Notify;

pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Push rejected, the bounded queue is at depth.
#[derive(Debug, Error)]
#[error("sample queue overflow")]
pub struct Overflow;

#[derive(Debug)]
struct QueueInner<T> {
    samples: VecDeque<(i64, T)>,
    closed: bool,
}

#[derive(Debug)]
struct Queue<T> {
    inner: Mutex<QueueInner<T>>,
    depth: usize,
    drop_oldest: bool,
    not_empty: Notify,
    has_space: Notify,
}
impl<T> Queue<T> {
    fn new(
        depth: usize,
        drop_oldest: bool,
    ) -> Self {
        let inner = QueueInner {
            samples: VecDeque::new(),
            closed: false,
        };
        let inner = Mutex::new(inner);

        Self {
            inner,
            depth,
            drop_oldest,
            not_empty: Notify::new(),
            has_space: Notify::new(),
        }
    }

    fn close(&self) {
        self.inner.lock().closed = true;
        self.not_empty.notify_waiters();
        self.has_space.notify_waiters();
    }
}

/// Producer half. Samples must be pushed in non-decreasing timestamp order,
/// which per-stream monotone delivery guarantees.
#[derive(Debug)]
pub struct Producer<T> {
    queue: Arc<Queue<T>>,
}
impl<T> Producer<T> {
    /// Non-blocking push. A follower queue at depth drops its oldest sample
    /// to make room, a leader queue rejects the push instead.
    pub fn push(
        &self,
        wall_clock_ns: i64,
        sample: T,
    ) -> Result<(), Overflow> {
        {
            let mut inner = self.queue.inner.lock();
            if inner.closed {
                // consumer gone, silently drop
                return Ok(());
            }

            if inner.samples.len() >= self.queue.depth {
                if !self.queue.drop_oldest {
                    return Err(Overflow);
                }
                inner.samples.pop_front();
            }
            inner.samples.push_back((wall_clock_ns, sample));
        }

        self.queue.not_empty.notify_one();
        Ok(())
    }

    /// Waits for queue space instead of rejecting, used for the leader
    /// stream where no sample may be dropped. Returns `false` when the
    /// consumer is gone.
    pub async fn push_wait(
        &self,
        wall_clock_ns: i64,
        sample: T,
    ) -> bool {
        loop {
            let has_space = self.queue.has_space.notified();
            {
                let mut inner = self.queue.inner.lock();
                if inner.closed {
                    return false;
                }
                if inner.samples.len() < self.queue.depth {
                    inner.samples.push_back((wall_clock_ns, sample));
                    drop(inner);
                    self.queue.not_empty.notify_one();
                    return true;
                }
            }
            has_space.await;
        }
    }
}
impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        self.queue.close();
    }
}

/// Matcher-side half.
#[derive(Debug)]
pub struct Consumer<T> {
    queue: Arc<Queue<T>>,
}
impl<T> Consumer<T> {
    /// Pops the oldest sample, waiting for one. `None` once the producer is
    /// gone and the queue drained.
    pub async fn pop(&self) -> Option<(i64, T)> {
        loop {
            let not_empty = self.queue.not_empty.notified();
            {
                let mut inner = self.queue.inner.lock();
                if let Some(sample) = inner.samples.pop_front() {
                    drop(inner);
                    self.queue.has_space.notify_one();
                    return Some(sample);
                }
                if inner.closed {
                    return None;
                }
            }
            not_empty.await;
        }
    }

    /// Waits until the stream has produced a sample at or past the given
    /// timestamp (so the nearest match cannot improve anymore). Returns
    /// immediately once the producer is gone.
    pub async fn wait_covering(
        &self,
        wall_clock_ns: i64,
    ) {
        loop {
            let not_empty = self.queue.not_empty.notified();
            {
                let inner = self.queue.inner.lock();
                let covered = inner
                    .samples
                    .back()
                    .map(|(timestamp, _)| *timestamp >= wall_clock_ns)
                    .unwrap_or(false);
                if covered || inner.closed {
                    return;
                }
            }
            not_empty.await;
        }
    }
}
impl<T: Clone> Consumer<T> {
    /// Selects the sample nearest to the leader timestamp within the
    /// window, ties to the later one. Samples too old for any future
    /// leader are discarded along the way.
    pub fn best_match(
        &self,
        leader_wall_clock_ns: i64,
        window_ns: i64,
    ) -> Option<(i64, T)> {
        let mut inner = self.queue.inner.lock();

        let mut discarded = false;
        while let Some((timestamp, _)) = inner.samples.front() {
            if *timestamp < leader_wall_clock_ns - window_ns {
                inner.samples.pop_front();
                discarded = true;
            } else {
                break;
            }
        }
        if discarded {
            self.queue.has_space.notify_one();
        }

        let mut best: Option<(i64, &T)> = None;
        for (timestamp, sample) in inner.samples.iter() {
            let distance = (timestamp - leader_wall_clock_ns).abs();
            match best {
                Some((best_timestamp, _))
                    if (best_timestamp - leader_wall_clock_ns).abs() < distance =>
                {
                    // ordered by timestamp, it only gets worse from here
                    break;
                }
                _ => best = Some((*timestamp, sample)),
            }
        }

        best.and_then(|(timestamp, sample)| {
            if (timestamp - leader_wall_clock_ns).abs() <= window_ns {
                Some((timestamp, sample.clone()))
            } else {
                None
            }
        })
    }
}
impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        self.queue.close();
    }
}

pub fn queue<T>(
    depth: usize,
    drop_oldest: bool,
) -> (Producer<T>, Consumer<T>) {
    let queue = Arc::new(Queue::new(depth, drop_oldest));
    (
        Producer {
            queue: queue.clone(),
        },
        Consumer { queue },
    )
}

#[derive(Clone, Copy, Debug)]
pub struct MatcherConfig {
    /// Acceptance window around each leader sample, by default one scene
    /// video frame period.
    pub window_ns: i64,
    /// How long to wait for lagging followers before emitting the tuple
    /// with `None`.
    pub follower_wait: Duration,
    pub queue_depth: usize,
}
impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            window_ns: 33_333_333,
            follower_wait: Duration::from_secs(1),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

async fn follower_match<T: Clone>(
    consumer: &Consumer<T>,
    leader_wall_clock_ns: i64,
    config: &MatcherConfig,
) -> Option<(i64, T)> {
    let _ = tokio::time::timeout(
        config.follower_wait,
        consumer.wait_covering(leader_wall_clock_ns),
    )
    .await;

    consumer.best_match(leader_wall_clock_ns, config.window_ns)
}

#[derive(Clone, PartialEq, Debug)]
pub struct Matched2<L, F1> {
    pub leader: (i64, L),
    pub follower: Option<(i64, F1)>,
}

/// One leader, one follower.
#[derive(Debug)]
pub struct Matcher2<L, F1> {
    config: MatcherConfig,
    leader: Consumer<L>,
    follower: Consumer<F1>,
}
impl<L, F1: Clone> Matcher2<L, F1> {
    pub fn new(config: MatcherConfig) -> (Producer<L>, Producer<F1>, Self) {
        let (leader_producer, leader) = queue(config.queue_depth, false);
        let (follower_producer, follower) = queue(config.queue_depth, true);

        (
            leader_producer,
            follower_producer,
            Self {
                config,
                leader,
                follower,
            },
        )
    }

    /// Next fused tuple, `None` once the leader stream ended. Every leader
    /// sample yields exactly one tuple.
    pub async fn next(&mut self) -> Option<Matched2<L, F1>> {
        let (leader_wall_clock_ns, leader) = self.leader.pop().await?;
        let follower = follower_match(&self.follower, leader_wall_clock_ns, &self.config).await;

        Some(Matched2 {
            leader: (leader_wall_clock_ns, leader),
            follower,
        })
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct Matched3<L, F1, F2> {
    pub leader: (i64, L),
    pub follower1: Option<(i64, F1)>,
    pub follower2: Option<(i64, F2)>,
}

/// One leader, two followers.
#[derive(Debug)]
pub struct Matcher3<L, F1, F2> {
    config: MatcherConfig,
    leader: Consumer<L>,
    follower1: Consumer<F1>,
    follower2: Consumer<F2>,
}
impl<L, F1: Clone, F2: Clone> Matcher3<L, F1, F2> {
    pub fn new(config: MatcherConfig) -> (Producer<L>, Producer<F1>, Producer<F2>, Self) {
        let (leader_producer, leader) = queue(config.queue_depth, false);
        let (follower1_producer, follower1) = queue(config.queue_depth, true);
        let (follower2_producer, follower2) = queue(config.queue_depth, true);

        (
            leader_producer,
            follower1_producer,
            follower2_producer,
            Self {
                config,
                leader,
                follower1,
                follower2,
            },
        )
    }

    pub async fn next(&mut self) -> Option<Matched3<L, F1, F2>> {
        let (leader_wall_clock_ns, leader) = self.leader.pop().await?;
        let follower1 = follower_match(&self.follower1, leader_wall_clock_ns, &self.config).await;
        let follower2 = follower_match(&self.follower2, leader_wall_clock_ns, &self.config).await;

        Some(Matched3 {
            leader: (leader_wall_clock_ns, leader),
            follower1,
            follower2,
        })
    }
}
