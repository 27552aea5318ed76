use std::{
    fmt::{self, Debug, Formatter},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::utils::Instant;

/// Cooperative cancellation flag shared between a driver and its workers.
///
/// `cancel` is idempotent; once set the token never resets.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl Debug for CancellationToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "CancellationToken({})", self.is_canceled())
    }
}

/// The uniform operation-cancelled failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Canceled;

#[derive(Clone)]
enum Backend {
    Sequential,
    /// rayon's global work-stealing pool.
    WorkStealing,
    FixedThreads(Arc<rayon::ThreadPool>),
}

/// Wall-clock accounting for one named scope of parallel work.
#[derive(Debug, Clone, Default)]
pub struct TimingReport {
    pub name: String,
    /// Summed per-task wall clock.
    pub task_time: Duration,
    pub tasks: usize,
    pub children: Vec<TimingReport>,
}

impl TimingReport {
    fn render(&self, indent: usize, out: &mut String) {
        use std::fmt::Write;
        let _ = writeln!(
            out,
            "{:indent$}{}: {:?} over {} tasks",
            "",
            self.name,
            self.task_time,
            self.tasks,
            indent = indent * 2
        );
        for c in &self.children {
            c.render(indent + 1, out);
        }
    }
}

impl fmt::Display for TimingReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut s = String::new();
        self.render(0, &mut s);
        f.write_str(&s)
    }
}

#[derive(Default)]
struct TimingNode {
    name: String,
    task_time: Duration,
    tasks: usize,
    children: Vec<Arc<Mutex<TimingNode>>>,
}

impl TimingNode {
    fn snapshot(&self) -> TimingReport {
        TimingReport {
            name: self.name.clone(),
            task_time: self.task_time,
            tasks: self.tasks,
            children: self
                .children
                .iter()
                .map(|c| c.lock().unwrap().snapshot())
                .collect(),
        }
    }
}

/// The engine's only scheduling primitive: map a function over inputs,
/// possibly in parallel, preserving input order in the output.
///
/// Flavors: [`ParallelMap::sequential`], [`ParallelMap::work_stealing`] and
/// [`ParallelMap::fixed_threads`], with two orthogonal decorators:
/// [`cancelable`](ParallelMap::cancelable) checks a [`CancellationToken`]
/// between items and at block boundaries, and [`timed`](ParallelMap::timed)
/// accounts wall clock per task into a hierarchical [`TimingReport`].
#[derive(Clone)]
pub struct ParallelMap {
    backend: Backend,
    token: Option<CancellationToken>,
    timer: Option<Arc<Mutex<TimingNode>>>,
}

impl Default for ParallelMap {
    fn default() -> Self {
        Self::sequential()
    }
}

impl Debug for ParallelMap {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self.backend {
            Backend::Sequential => "sequential",
            Backend::WorkStealing => "work-stealing",
            Backend::FixedThreads(_) => "fixed-threads",
        };
        write!(f, "ParallelMap({name})")
    }
}

impl ParallelMap {
    pub fn sequential() -> Self {
        Self {
            backend: Backend::Sequential,
            token: None,
            timer: None,
        }
    }

    pub fn work_stealing() -> Self {
        Self {
            backend: Backend::WorkStealing,
            token: None,
            timer: None,
        }
    }

    pub fn fixed_threads(n: usize) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .expect("failed to build thread pool");
        Self {
            backend: Backend::FixedThreads(Arc::new(pool)),
            token: None,
            timer: None,
        }
    }

    pub fn cancelable(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// A child scope accounted under `name` in this map's timing report.
    pub fn timed(&self, name: impl Into<String>) -> Self {
        let child = Arc::new(Mutex::new(TimingNode {
            name: name.into(),
            ..TimingNode::default()
        }));
        if let Some(parent) = &self.timer {
            parent.lock().unwrap().children.push(child.clone());
        }
        Self {
            backend: self.backend.clone(),
            token: self.token.clone(),
            timer: Some(child),
        }
    }

    pub fn timing_report(&self) -> Option<TimingReport> {
        self.timer.as_ref().map(|t| t.lock().unwrap().snapshot())
    }

    fn check(&self) -> Result<(), Canceled> {
        match &self.token {
            Some(t) if t.is_canceled() => Err(Canceled),
            _ => Ok(()),
        }
    }

    fn record(&self, elapsed: Duration, tasks: usize) {
        if let Some(t) = &self.timer {
            let mut t = t.lock().unwrap();
            t.task_time += elapsed;
            t.tasks += tasks;
        }
    }

    /// Map `f` over `inputs`. Output order matches input order. Blocks the
    /// caller until every output is produced or cancellation is observed.
    pub fn apply<I, O, F>(&self, inputs: Vec<I>, f: F) -> Result<Vec<O>, Canceled>
    where
        I: Send,
        O: Send,
        F: Fn(I) -> O + Sync + Send,
    {
        self.check()?;
        let start = Instant::now();
        let n = inputs.len();
        let out = match &self.backend {
            Backend::Sequential => {
                let mut out = Vec::with_capacity(n);
                for i in inputs {
                    self.check()?;
                    out.push(f(i));
                }
                out
            }
            Backend::WorkStealing => {
                use rayon::prelude::*;
                inputs.into_par_iter().map(&f).collect()
            }
            Backend::FixedThreads(pool) => {
                use rayon::prelude::*;
                pool.install(|| inputs.into_par_iter().map(&f).collect())
            }
        };
        self.record(start.elapsed(), n);
        self.check()?;
        Ok(out)
    }

    /// Dispatch `inputs` in blocks of `block_size`. Order is preserved
    /// within a block; across blocks it is unspecified. Cancellation is
    /// observed at block boundaries only.
    pub fn process_blocks<I, O, F>(
        &self,
        inputs: Vec<I>,
        block_size: usize,
        f: F,
    ) -> Result<Vec<O>, Canceled>
    where
        I: Send,
        O: Send,
        F: Fn(I) -> O + Sync + Send,
    {
        assert!(block_size > 0, "block size must be positive");
        let mut out = Vec::with_capacity(inputs.len());
        let mut rest = inputs;
        while !rest.is_empty() {
            self.check()?;
            let tail = rest.split_off(rest.len().min(block_size));
            let block = std::mem::replace(&mut rest, tail);
            out.extend(self.apply(block, &f)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn flavors() -> Vec<ParallelMap> {
        vec![
            ParallelMap::sequential(),
            ParallelMap::work_stealing(),
            ParallelMap::fixed_threads(2),
        ]
    }

    #[test]
    fn apply_preserves_order() {
        for pm in flavors() {
            let out = pm.apply((0..100).collect(), |i| i * 2).unwrap();
            assert_eq!(out, (0..100).map(|i| i * 2).collect::<Vec<_>>());
        }
    }

    #[test_case(1)]
    #[test_case(7)]
    #[test_case(1000)]
    fn blocks_cover_all_inputs(block: usize) {
        let pm = ParallelMap::sequential();
        let mut out = pm.process_blocks((0..50).collect(), block, |i| i).unwrap();
        out.sort_unstable();
        assert_eq!(out, (0..50).collect::<Vec<i32>>());
    }

    #[test]
    fn canceled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancel(); // idempotent
        let pm = ParallelMap::sequential().cancelable(token);
        assert_eq!(pm.apply(vec![1, 2, 3], |i| i), Err(Canceled));
    }

    #[test]
    fn cancel_mid_sequence() {
        let token = CancellationToken::new();
        let pm = ParallelMap::sequential().cancelable(token.clone());
        let res = pm.apply((0..10).collect::<Vec<_>>(), |i| {
            if i == 3 {
                token.cancel();
            }
            i
        });
        assert_eq!(res, Err(Canceled));
    }

    #[test]
    fn timing_is_hierarchical() {
        let pm = ParallelMap::sequential().timed("outer");
        let inner = pm.timed("inner");
        inner.apply(vec![1, 2], |i| i).unwrap();
        let report = pm.timing_report().unwrap();
        assert_eq!(report.name, "outer");
        assert_eq!(report.children.len(), 1);
        assert_eq!(report.children[0].tasks, 2);
    }
}
