//! Stage progress reporting.
//!
//! Long-running stages (fetch, augment, simplify, vectorize, finetune) report
//! how far along they are. Progress goes to **stderr** so stdout stays
//! parseable for scripts.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// `n` of `total` units done (`unit` is e.g. "images", "batches").
    Advance {
        stage: String,
        unit: &'static str,
        n: u64,
        total: u64,
    },
    /// Training loss after a step.
    Loss {
        stage: String,
        epoch: usize,
        epochs: usize,
        loss: f32,
    },
}

/// Reports stage progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "fetch  1,234 / 5,000 images".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Advance {
                stage,
                unit,
                n,
                total,
            } => format!(
                "{}  {} / {} {}\n",
                stage,
                format_number(*n),
                format_number(*total),
                unit
            ),
            ProgressEvent::Loss {
                stage,
                epoch,
                epochs,
                loss,
            } => format!("{}  epoch {}/{}  loss {:.4}\n", stage, epoch, epochs, loss),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Advance {
                stage,
                unit,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "stage": stage,
                "unit": unit,
                "n": n,
                "total": total
            }),
            ProgressEvent::Loss {
                stage,
                epoch,
                epochs,
                loss,
            } => serde_json::json!({
                "event": "loss",
                "stage": stage,
                "epoch": epoch,
                "epochs": epochs,
                "loss": loss
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Emits every `every`-th event plus the last one, so large runs don't
/// flood the terminal.
pub struct Throttled<'a> {
    inner: &'a dyn ProgressReporter,
    stage: String,
    unit: &'static str,
    total: u64,
    every: u64,
}

impl<'a> Throttled<'a> {
    pub fn new(
        inner: &'a dyn ProgressReporter,
        stage: &str,
        unit: &'static str,
        total: u64,
        every: u64,
    ) -> Self {
        Self {
            inner,
            stage: stage.to_string(),
            unit,
            total,
            every: every.max(1),
        }
    }

    pub fn tick(&self, n: u64) {
        if n % self.every == 0 || n == self.total {
            self.inner.report(ProgressEvent::Advance {
                stage: self.stage.clone(),
                unit: self.unit,
                n,
                total: self.total,
            });
        }
    }
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
