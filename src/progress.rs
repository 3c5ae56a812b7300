use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

const WORKER_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] w{prefix} [{bar:30.cyan/blue}] {pos}/{len} tenants {msg}";

/// One progress line per worker, hidden entirely in quiet mode.
#[derive(Clone)]
pub struct ProgressBoard {
    multi: MultiProgress,
    quiet: bool,
}

impl ProgressBoard {
    pub fn new(quiet: bool) -> Self {
        let multi = if quiet {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };
        Self { multi, quiet }
    }

    pub fn worker(&self, worker: usize, tenants: usize) -> WorkerProgress {
        let bar = if self.quiet {
            ProgressBar::hidden()
        } else {
            let style = ProgressStyle::with_template(WORKER_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-");
            let bar = self.multi.add(ProgressBar::new(tenants as u64));
            bar.set_style(style);
            bar.set_prefix(format!("{:02}", worker));
            bar.enable_steady_tick(Duration::from_millis(200));
            bar
        };
        WorkerProgress {
            bar,
            objects: Arc::new(AtomicU64::new(0)),
            bytes: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Live counters for one worker. Display only; reports are built separately.
#[derive(Clone)]
pub struct WorkerProgress {
    bar: ProgressBar,
    pub objects: Arc<AtomicU64>,
    pub bytes: Arc<AtomicU64>,
}

impl WorkerProgress {
    pub fn start_tenant(&self, tenant: &str) {
        self.bar.set_message(tenant.to_string());
    }

    pub fn add_object(&self, bytes: u64) {
        let objects = self.objects.fetch_add(1, Ordering::SeqCst) + 1;
        let total = self.bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if objects % 100 == 0 {
            self.bar
                .set_message(format!("{} objects, {}", objects, indicatif::HumanBytes(total)));
        }
    }

    pub fn finish_tenant(&self) {
        self.bar.inc(1);
    }

    pub fn finish(&self) {
        self.bar.finish_with_message(format!(
            "done: {} objects, {}",
            self.objects.load(Ordering::SeqCst),
            indicatif::HumanBytes(self.bytes.load(Ordering::SeqCst))
        ));
    }
}
