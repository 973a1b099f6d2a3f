use std::sync::Arc;

use crate::jobs::{JobRegistry, JobRunner};

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<JobRunner>,
}

impl AppState {
    pub fn new(runner: Arc<JobRunner>) -> Self {
        Self { runner }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        self.runner.registry()
    }
}
