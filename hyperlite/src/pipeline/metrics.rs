use super::ExecutionMode;

#[derive(Debug, Clone)]
pub struct TaskMetrics {
    pub name: String,
    pub duration_ms: u128,
}

#[derive(Debug, Clone)]
pub struct StageMetrics {
    pub index: usize,
    pub execution: ExecutionMode,
    pub duration_ms: u128,
    pub tasks: Vec<TaskMetrics>,
}

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub total_duration_ms: u128,
    pub stages: Vec<StageMetrics>,
}

impl PipelineMetrics {
    pub fn task_duration_ms(&self, name: &str) -> Option<u128> {
        self.stages
            .iter()
            .flat_map(|stage| stage.tasks.iter())
            .find(|task| task.name == name)
            .map(|task| task.duration_ms)
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.stages
            .iter()
            .flat_map(|stage| stage.tasks.iter())
            .map(|task| task.name.as_str())
            .collect()
    }

    pub fn log(&self, sandbox_id: &str) {
        for stage in &self.stages {
            for task in &stage.tasks {
                tracing::debug!(
                    sandbox_id = %sandbox_id,
                    stage = stage.index,
                    task = %task.name,
                    duration_ms = task.duration_ms as u64,
                    "Boot task finished"
                );
            }
        }
        tracing::info!(
            sandbox_id = %sandbox_id,
            total_ms = self.total_duration_ms as u64,
            "Sandbox boot pipeline complete"
        );
    }
}
