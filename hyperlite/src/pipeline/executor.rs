use super::metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
use super::stage::{ExecutionMode, Stage};
use super::task::BoxedTask;
use futures::future::try_join_all;
use hyperlite_shared::{HyperliteError, HyperliteResult};
use std::time::Instant;

pub struct ExecutionPlan<Ctx> {
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx> ExecutionPlan<Ctx> {
    pub fn new(stages: Vec<Stage<BoxedTask<Ctx>>>) -> Self {
        Self { stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Run every stage of `plan` in order against `ctx`.
    pub async fn execute<Ctx>(plan: ExecutionPlan<Ctx>, ctx: Ctx) -> HyperliteResult<PipelineMetrics>
    where
        Ctx: Clone,
    {
        let total_start = Instant::now();
        let mut stage_metrics = Vec::with_capacity(plan.stages.len());

        for (index, stage) in plan.stages.into_iter().enumerate() {
            let execution = stage.execution;
            let stage_start = Instant::now();

            let tasks = match execution {
                ExecutionMode::Parallel => {
                    let futures = stage.tasks.into_iter().map(|task| {
                        let ctx = ctx.clone();
                        async move {
                            let name = task.name().to_string();
                            let started = Instant::now();
                            task.run(ctx).await?;
                            Ok::<_, HyperliteError>(TaskMetrics {
                                name,
                                duration_ms: started.elapsed().as_millis(),
                            })
                        }
                    });
                    try_join_all(futures).await?
                }
                ExecutionMode::Sequential => {
                    let mut tasks = Vec::with_capacity(stage.tasks.len());
                    for task in stage.tasks {
                        let name = task.name().to_string();
                        let started = Instant::now();
                        task.run(ctx.clone()).await?;
                        tasks.push(TaskMetrics {
                            name,
                            duration_ms: started.elapsed().as_millis(),
                        });
                    }
                    tasks
                }
            };

            stage_metrics.push(StageMetrics {
                index,
                execution,
                duration_ms: stage_start.elapsed().as_millis(),
                tasks,
            });
        }

        Ok(PipelineMetrics {
            total_duration_ms: total_start.elapsed().as_millis(),
            stages: stage_metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineTask;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    struct Record(&'static str);

    #[async_trait]
    impl PipelineTask<Log> for Record {
        async fn run(self: Box<Self>, ctx: Log) -> HyperliteResult<()> {
            ctx.lock().await.push(self.0);
            Ok(())
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    struct Fail;

    #[async_trait]
    impl PipelineTask<Log> for Fail {
        async fn run(self: Box<Self>, _ctx: Log) -> HyperliteResult<()> {
            Err(HyperliteError::Internal("boom".into()))
        }

        fn name(&self) -> &str {
            "fail"
        }
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let log: Log = Arc::default();
        let plan: ExecutionPlan<Log> = ExecutionPlan::new(vec![
            Stage::single(Box::new(Record("first"))),
            Stage::parallel(vec![Box::new(Record("a")), Box::new(Record("b"))]),
            Stage::single(Box::new(Record("last"))),
        ]);

        let metrics = PipelineExecutor::execute(plan, Arc::clone(&log)).await.unwrap();
        let log = log.lock().await;
        assert_eq!(log.first(), Some(&"first"));
        assert_eq!(log.last(), Some(&"last"));
        assert_eq!(log.len(), 4);
        assert_eq!(metrics.stages.len(), 3);
        assert!(metrics.task_duration_ms("a").is_some());
    }

    #[tokio::test]
    async fn test_failure_stops_later_stages() {
        let log: Log = Arc::default();
        let plan: ExecutionPlan<Log> = ExecutionPlan::new(vec![
            Stage::single(Box::new(Fail)),
            Stage::single(Box::new(Record("never"))),
        ]);

        assert!(PipelineExecutor::execute(plan, Arc::clone(&log)).await.is_err());
        assert!(log.lock().await.is_empty());
    }
}
