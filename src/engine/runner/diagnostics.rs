use std::fmt::Write;
use std::time::{Duration, Instant};

use console::style;
use indicatif::HumanBytes;

use crate::engine::{Plan, node_id};

/// How a planned task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Done,
    Failed(String),
    /// Not started because an earlier task failed.
    Skipped,
}

/// Execution record of a single task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub name: String,
    pub start: Instant,
    pub duration: Duration,
    /// Files written, or entries removed by a clean.
    pub files: usize,
    pub bytes: u64,
    /// Files dropped because a transform failed on them.
    pub failures: usize,
    pub status: Status,
}

impl TaskReport {
    pub(crate) fn new(name: &str, start: Instant, status: Status) -> Self {
        Self {
            name: name.to_string(),
            start,
            duration: Duration::ZERO,
            files: 0,
            bytes: 0,
            failures: 0,
            status,
        }
    }
}

/// Build diagnostics and performance metrics.
///
/// Returned by every plan execution, one report per planned task in plan
/// order.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub reports: Vec<TaskReport>,
}

impl Diagnostics {
    pub fn get(&self, task: &str) -> Option<&TaskReport> {
        self.reports.iter().find(|r| r.name == task)
    }

    /// Whether any task failed. Skipped tasks only follow a failure.
    pub fn failed(&self) -> bool {
        self.reports
            .iter()
            .any(|r| matches!(r.status, Status::Failed(_)))
    }

    /// Wall time from the first task start to the last task end.
    pub fn elapsed(&self) -> Duration {
        let start = self.reports.iter().map(|r| r.start).min();
        let end = self.reports.iter().map(|r| r.start + r.duration).max();
        match (start, end) {
            (Some(start), Some(end)) => end.duration_since(start),
            _ => Duration::ZERO,
        }
    }

    /// Log a line per task and a total.
    pub fn summary(&self) {
        for report in &self.reports {
            let name = style(&report.name).cyan();
            match &report.status {
                Status::Done => tracing::info!(
                    "{name} {} {} file(s) {}{}",
                    style(format!("{:.2?}", report.duration)).magenta(),
                    report.files,
                    HumanBytes(report.bytes),
                    match report.failures {
                        0 => String::new(),
                        n => format!(", {} failed", style(n).red()),
                    }
                ),
                Status::Failed(_) => tracing::error!("{name} {}", style("failed").red()),
                Status::Skipped => tracing::warn!("{name} {}", style("skipped").yellow()),
            }
        }

        let total = style(format!("{:.2?}", self.elapsed())).magenta();
        if self.failed() {
            tracing::error!("Finished with errors after {total}");
        } else {
            tracing::info!("Finished after {total}");
        }
    }

    /// Renders the plan as a Mermaid diagram, color-coded by execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Skipped or not run
    pub fn render_mermaid(&self, plan: &Plan) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let ran = self
            .reports
            .iter()
            .filter(|r| r.status != Status::Skipped)
            .map(|r| r.duration.as_secs_f64());
        let (mut min_time, mut max_time) = ran.fold((f64::MAX, f64::MIN), |(lo, hi), t| {
            (lo.min(t), hi.max(t))
        });

        if min_time > max_time {
            min_time = 0.0;
            max_time = 0.0;
        }
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for task in plan.tasks() {
            let id = node_id(task);
            let name = task.replace('"', "\\\"");

            let (label, color) = match self.get(task) {
                Some(report) if report.status != Status::Skipped => {
                    let t = (report.duration.as_secs_f64() - min_time) / (max_time - min_time);
                    let (r, g) = if t < 0.5 {
                        ((255.0 * t * 2.0) as u8, 255)
                    } else {
                        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
                    };
                    let fill = match report.status {
                        Status::Failed(_) => "#FF4D4D".to_string(),
                        _ => format!("#{r:02X}{g:02X}00"),
                    };
                    (format!("{:.2?}", report.duration), fill)
                }
                Some(_) => ("Skipped".to_string(), "#ADD8E6".to_string()),
                None => ("Not run".to_string(), "#ADD8E6".to_string()),
            };

            let _ = writeln!(f, "    {id}[\"{name}\\n{label}\"]");
            let _ = writeln!(f, "    style {id} fill:{color}");
        }

        for (from, to) in plan.edges() {
            let _ = writeln!(f, "    {} --> {}", node_id(from), node_id(to));
        }

        f
    }

    pub fn render_mermaid_to_file(
        &self,
        plan: &Plan,
        path: impl AsRef<std::path::Path>,
    ) -> Result<(), std::io::Error> {
        std::fs::write(path, self.render_mermaid(plan))
    }
}
