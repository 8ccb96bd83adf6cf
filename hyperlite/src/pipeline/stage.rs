#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// All tasks run concurrently; the stage fails on the first error.
    Parallel,
    Sequential,
}

#[derive(Debug, Clone)]
pub struct Stage<T> {
    pub tasks: Vec<T>,
    pub execution: ExecutionMode,
}

impl<T> Stage<T> {
    pub fn parallel(tasks: Vec<T>) -> Self {
        Self {
            tasks,
            execution: ExecutionMode::Parallel,
        }
    }

    pub fn sequential(tasks: Vec<T>) -> Self {
        Self {
            tasks,
            execution: ExecutionMode::Sequential,
        }
    }

    pub fn single(task: T) -> Self {
        Self::sequential(vec![task])
    }
}
