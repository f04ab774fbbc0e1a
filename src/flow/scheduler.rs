use anyhow::Result;
use futures::future::BoxFuture;
use std::{collections::HashMap, fmt, time::Instant};
use tracing::{error, info, warn};

use super::{dag::TaskGraph, retry::RetryPolicy};

/// A stage body. Called once per attempt.
pub type TaskFn = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Stage {
    policy: RetryPolicy,
    task: TaskFn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSuccess {
    pub name: String,
    pub attempts: u32,
}

#[derive(Debug)]
pub struct StageFailure {
    pub name: String,
    pub attempts: u32,
    pub error: anyhow::Error,
}

/// What happened to every stage of one run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub succeeded: Vec<StageSuccess>,
    pub failed: Option<StageFailure>,
    /// Stages never started because the run was aborted.
    pub skipped: Vec<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }

    /// The failing stage's error, with the stage named in its context.
    pub fn into_result(self) -> Result<()> {
        match self.failed {
            None => Ok(()),
            Some(f) => Err(f.error.context(format!(
                "stage `{}` failed after {} attempt(s); skipped: {:?}",
                f.name, f.attempts, self.skipped
            ))),
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped",
            self.succeeded.len(),
            usize::from(self.failed.is_some()),
            self.skipped.len()
        )
    }
}

/// Runs registered stages one at a time in dependency order.
///
/// The first stage that fails (after its retries) aborts the run; every
/// stage not yet started is reported as skipped.
#[derive(Default)]
pub struct Scheduler {
    graph: TaskGraph,
    stages: HashMap<String, Stage>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stage(&mut self, name: &str, policy: RetryPolicy, task: TaskFn) -> Result<()> {
        self.graph.add_stage(name)?;
        self.stages.insert(name.to_string(), Stage { policy, task });
        Ok(())
    }

    pub fn add_dependency(&mut self, stage: &str, depends_on: &str) -> Result<()> {
        self.graph.add_dependency(stage, depends_on)?;
        Ok(())
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Execute the graph. Errs only when the graph itself is invalid; stage
    /// failures are reported in the returned [`RunReport`].
    pub async fn run(&self) -> Result<RunReport> {
        let order = self.graph.topological_order()?;
        let mut report = RunReport::default();

        let mut remaining = order.into_iter();
        for name in remaining.by_ref() {
            let Some(stage) = self.stages.get(&name) else {
                continue;
            };
            let started = Instant::now();
            info!(stage = %name, "stage starting");
            let (result, attempts) = stage.policy.run(&name, || (stage.task)()).await;
            match result {
                Ok(()) => {
                    info!(
                        stage = %name,
                        attempts,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "stage finished"
                    );
                    report.succeeded.push(StageSuccess { name, attempts });
                }
                Err(error) => {
                    error!(stage = %name, attempts, error = %error, "stage failed, aborting run");
                    report.failed = Some(StageFailure {
                        name,
                        attempts,
                        error,
                    });
                    break;
                }
            }
        }
        report.skipped = remaining.collect();
        if !report.skipped.is_empty() {
            warn!(skipped = ?report.skipped, "stages skipped");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use anyhow::anyhow;
    use futures::FutureExt;
    use std::{
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
            ..RetryPolicy::default()
        }
    }

    fn recording(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> TaskFn {
        let log = log.clone();
        Box::new(move || {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(name.to_string());
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn runs_in_dependency_order() -> Result<()> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut s = Scheduler::new();
        s.add_stage("gold", policy(1), recording(&log, "gold"))?;
        s.add_stage("silver:clients", policy(1), recording(&log, "silver:clients"))?;
        s.add_dependency("gold", "silver:clients")?;

        let report = s.run().await?;
        assert!(report.is_success());
        assert_eq!(*log.lock().unwrap(), vec!["silver:clients", "gold"]);
        assert_eq!(report.to_string(), "2 succeeded, 0 failed, 0 skipped");
        Ok(())
    }

    #[tokio::test]
    async fn failure_skips_the_rest() -> Result<()> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut s = Scheduler::new();
        s.add_stage(
            "silver:clients",
            policy(3),
            Box::new(|| async { Err::<(), _>(anyhow!("no id column")) }.boxed()),
        )?;
        s.add_stage("gold", policy(1), recording(&log, "gold"))?;
        s.add_dependency("gold", "silver:clients")?;

        let report = s.run().await?;
        let failed = report.failed.as_ref().unwrap();
        assert_eq!(failed.name, "silver:clients");
        assert_eq!(failed.attempts, 1, "non-transient errors are not retried");
        assert_eq!(report.skipped, vec!["gold"]);
        assert!(log.lock().unwrap().is_empty());
        assert!(report.into_result().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn transient_failures_are_retried() -> Result<()> {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut s = Scheduler::new();
        s.add_stage(
            "silver:achats",
            policy(3),
            Box::new(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(anyhow::Error::from(StoreError::Unavailable("blip".into())))
                    } else {
                        Ok(())
                    }
                }
                .boxed()
            }),
        )?;
        let report = s.run().await?;
        assert!(report.is_success());
        assert_eq!(report.succeeded[0].attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        Ok(())
    }
}
