// ABOUTME: Append-only JSON-lines run log, one file per failover run
// ABOUTME: Written as the run progresses and read back by `runs list` / `runs show`

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::run::{FailoverRun, RunOptions, RunOutcome, StepResult};
use super::state::FailoverState;
use crate::health::HealthReport;
use crate::sequences::SequenceOutcome;

/// One line of a run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Started {
        run_id: Uuid,
        started_at: DateTime<Utc>,
        primary: String,
        standby: String,
        options: RunOptions,
    },
    Health {
        report: HealthReport,
    },
    Step(StepResult),
    Sequences {
        ledger: Vec<SequenceOutcome>,
    },
    Finished {
        completed_at: DateTime<Utc>,
        outcome: RunOutcome,
        degraded: bool,
        final_state: FailoverState,
        rto_ms: Option<i64>,
        lag_at_freeze: Option<u64>,
        remediation: Vec<String>,
    },
}

impl RunEvent {
    pub fn started(run: &FailoverRun) -> Self {
        Self::Started {
            run_id: run.id(),
            started_at: run.started_at(),
            primary: run.primary().name.clone(),
            standby: run.standby().name.clone(),
            options: run.options(),
        }
    }

    /// `None` until the run has an outcome.
    pub fn finished(run: &FailoverRun) -> Option<Self> {
        Some(Self::Finished {
            completed_at: run.completed_at()?,
            outcome: run.outcome()?,
            degraded: run.is_degraded(),
            final_state: run.state(),
            rto_ms: run.rto().map(|d| d.num_milliseconds()),
            lag_at_freeze: run.lag_at_freeze(),
            remediation: run.remediation().to_vec(),
        })
    }
}

/// One row of `runs list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub primary: String,
    pub standby: String,
    pub dry_run: bool,
    /// `None` when the run never recorded an outcome (e.g. the process died)
    pub outcome: Option<RunOutcome>,
    pub degraded: bool,
    pub path: PathBuf,
}

/// Directory of run logs.
#[derive(Debug, Clone)]
pub struct RunLog {
    dir: PathBuf,
}

impl RunLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.jsonl", run_id))
    }

    /// Append one event to the run's file, creating it if needed.
    pub async fn append(&self, run_id: Uuid, event: &RunEvent) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create run log directory: {}", self.dir.display()))?;

        let path = self.path_for(run_id);
        let mut line = serde_json::to_string(event).context("Failed to serialize run event")?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open run log: {}", path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to write run log: {}", path.display()))?;
        file.flush().await?;
        Ok(())
    }

    /// Read every event of a run. `id` may be a unique prefix of the run id.
    pub async fn read(&self, id: &str) -> Result<Vec<RunEvent>> {
        let path = self.resolve(id).await?;
        read_events(&path).await
    }

    /// Summaries of every run, newest first.
    pub async fn list(&self) -> Result<Vec<RunSummary>> {
        let mut summaries = Vec::new();
        for path in self.files().await? {
            match read_events(&path).await {
                Ok(events) => {
                    if let Some(summary) = summarize(&path, &events) {
                        summaries.push(summary);
                    }
                }
                Err(e) => tracing::warn!("Skipping unreadable run log {}: {:#}", path.display(), e),
            }
        }
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(summaries)
    }

    async fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read run log directory: {}", self.dir.display())
                })
            }
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                files.push(path);
            }
        }
        Ok(files)
    }

    async fn resolve(&self, id: &str) -> Result<PathBuf> {
        let id = id.trim();
        if id.is_empty() {
            bail!("Run id cannot be empty");
        }
        let mut matches = self
            .files()
            .await?
            .into_iter()
            .filter(|p| {
                p.file_stem()
                    .and_then(|s| s.to_str())
                    .map(|s| s.starts_with(id))
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>();
        match matches.len() {
            0 => bail!("No run matching '{}' in {}", id, self.dir.display()),
            1 => Ok(matches.remove(0)),
            n => bail!("Run id '{}' is ambiguous ({} matches); use more characters", id, n),
        }
    }
}

async fn read_events(path: &Path) -> Result<Vec<RunEvent>> {
    let contents = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read run log: {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(n, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}: invalid event on line {}", path.display(), n + 1))
        })
        .collect()
}

fn summarize(path: &Path, events: &[RunEvent]) -> Option<RunSummary> {
    let mut summary = events.iter().find_map(|event| match event {
        RunEvent::Started {
            run_id,
            started_at,
            primary,
            standby,
            options,
        } => Some(RunSummary {
            run_id: *run_id,
            started_at: *started_at,
            primary: primary.clone(),
            standby: standby.clone(),
            dry_run: options.dry_run,
            outcome: None,
            degraded: false,
            path: path.to_path_buf(),
        }),
        _ => None,
    })?;

    for event in events {
        if let RunEvent::Finished {
            outcome, degraded, ..
        } = event
        {
            summary.outcome = Some(*outcome);
            summary.degraded = *degraded;
        }
    }
    Some(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover::run::{Step, StepResult};
    use crate::health::{Node, Role};
    use tempfile::TempDir;

    fn run() -> FailoverRun {
        let node = |name: &str, role| Node {
            name: name.to_string(),
            role,
            host: name.to_string(),
            port: 5432,
        };
        FailoverRun::new(
            node("db-a", Role::Primary),
            node("db-b", Role::Standby),
            RunOptions {
                skip_freeze: false,
                dry_run: true,
                force: false,
            },
        )
    }

    #[tokio::test]
    async fn test_append_and_list() {
        let temp = TempDir::new().unwrap();
        let log = RunLog::new(temp.path().join("runs"));
        let mut run = run();

        log.append(run.id(), &RunEvent::started(&run)).await.unwrap();
        let step = StepResult::success(Step::Preflight, FailoverState::Idle);
        run.record(step.clone()).unwrap();
        log.append(run.id(), &RunEvent::Step(step)).await.unwrap();
        run.finish(RunOutcome::Success, false).unwrap();
        log.append(run.id(), &RunEvent::finished(&run).unwrap())
            .await
            .unwrap();

        let runs = log.list().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, run.id());
        assert_eq!(runs[0].outcome, Some(RunOutcome::Success));
        assert!(runs[0].dry_run);

        let prefix = run.id().to_string()[..8].to_string();
        let events = log.read(&prefix).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[1], RunEvent::Step(_)));
    }

    #[tokio::test]
    async fn test_missing_directory_lists_nothing() {
        let temp = TempDir::new().unwrap();
        let log = RunLog::new(temp.path().join("absent"));
        assert!(log.list().await.unwrap().is_empty());
        assert!(log.read("deadbeef").await.is_err());
    }

    #[tokio::test]
    async fn test_unfinished_run_has_no_outcome() {
        let temp = TempDir::new().unwrap();
        let log = RunLog::new(temp.path());
        let run = run();
        log.append(run.id(), &RunEvent::started(&run)).await.unwrap();

        let runs = log.list().await.unwrap();
        assert_eq!(runs[0].outcome, None);
    }
}
