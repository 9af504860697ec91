use tracing::{debug, info};

pub type JobCallback<T> = Box<dyn FnOnce(&mut T) + Send>;

pub struct Job<T> {
    pub name: String,
    /// Keeps counting down while the owner is disabled.
    pub always_complete: bool,
    /// Ticks left before the job runs.
    pub delay_frames: u32,
    callback: JobCallback<T>,
}

impl<T> Job<T> {
    pub fn run(self, target: &mut T) {
        info!(job = %self.name, "running job");
        (self.callback)(target);
    }
}

pub struct JobQueue<T> {
    jobs: Vec<Job<T>>,
}

impl<T> Default for JobQueue<T> {
    fn default() -> Self {
        Self { jobs: Vec::new() }
    }
}

impl<T> JobQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `callback` to run after `delay_frames` further ticks. A pending
    /// job with the same name is replaced.
    pub fn post_job(
        &mut self,
        name: impl Into<String>,
        always_complete: bool,
        delay_frames: u32,
        callback: impl FnOnce(&mut T) + Send + 'static,
    ) {
        let name = name.into();
        self.jobs.retain(|job| job.name != name);
        debug!(job = %name, delay_frames, "posted job");
        self.jobs.push(Job {
            name,
            always_complete,
            delay_frames,
            callback: Box::new(callback),
        });
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.jobs.iter().any(|job| job.name == name)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Removes the jobs whose delay has elapsed, in posting order, and counts
    /// the others down by one frame. While the owner is disabled only
    /// always-complete jobs advance.
    pub fn take_due(&mut self, owner_enabled: bool) -> Vec<Job<T>> {
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.jobs)
            .into_iter()
            .partition(|job| job.delay_frames == 0 && (owner_enabled || job.always_complete));
        self.jobs = waiting;
        for job in &mut self.jobs {
            if owner_enabled || job.always_complete {
                job.delay_frames -= 1;
            }
        }
        due
    }
}
