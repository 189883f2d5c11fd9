use crate::scheduler::job::Job;

/// Ordered job registry. Insertion order is the dispatch scan order.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: Vec<Job>,
    last_id: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next job id.
    pub fn next_id(&mut self) -> String {
        self.last_id += 1;
        self.last_id.to_string()
    }

    /// Make sure ids allocated later never collide with `id`.
    pub fn reserve_id(&mut self, id: &str) {
        if let Ok(n) = id.parse::<u64>() {
            self.last_id = self.last_id.max(n);
        }
    }

    pub fn add_job(&mut self, job: Job) {
        self.reserve_id(&job.id);
        self.jobs.push(job);
    }

    pub fn get_job(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn get_job_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    pub fn remove_job(&mut self, id: &str) -> Option<Job> {
        let index = self.jobs.iter().position(|j| j.id == id)?;
        Some(self.jobs.remove(index))
    }

    /// Remove every job. The id counter keeps running.
    pub fn clear(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.jobs)
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn jobs_mut(&mut self) -> &mut [Job] {
        &mut self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
