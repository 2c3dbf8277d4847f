//! Cron job store and dispatcher. Jobs fire on a once / interval /
//! 5-field-cron schedule (IANA timezone aware); each firing produces a
//! durable `CronRun` with bounded output and error text. Dispatch happens
//! inside `run_due_jobs`, driven by an external timer, so the core carries
//! no timer thread of its own.

use crate::orchestration::actions::{AgentSpawner, SpawnRequest};
use crate::orchestration::error::{io_error, json_error, EngineError};
use crate::pipeline::executor::{ExecutionOutcome, PipelineExecutor};
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::{generate_run_id, sanitize_id, validate_identifier_value};
use crate::shared::logging::{log_diagnostic, log_event};
use crate::shared::subprocess::run_shell;
use crate::shared::text::{bounded_error, bounded_output};
use chrono::{Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_CRON_SEARCH_MINUTES: i64 = 60 * 24 * 366 * 5;
const MAX_INTERVAL_SECONDS: u64 = 31_536_000;
const MAX_BACKOFF_SECONDS: u64 = 3_600;
pub const DEFAULT_JOB_TIMEOUT_SECONDS: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Enabled,
    Paused,
    Disabled,
    Deleted,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Paused => "paused",
            Self::Disabled => "disabled",
            Self::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    Once {
        run_at: i64,
    },
    Interval {
        every_seconds: u64,
        #[serde(default)]
        anchor_at: Option<i64>,
    },
    Cron {
        expression: String,
        timezone: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronRun {
    pub run_id: String,
    pub job_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub job_id: String,
    pub project_id: String,
    pub schedule: Schedule,
    /// Raw action discriminator from configuration; parsed into the closed
    /// `JobAction` set at dispatch time so an unknown value becomes a
    /// failed run instead of an unloadable job.
    pub action_type: String,
    #[serde(default)]
    pub action_config: Map<String, Value>,
    pub state: JobState,
    pub next_run_at: Option<i64>,
    #[serde(default)]
    pub last_run_at: Option<i64>,
    #[serde(default)]
    pub last_result: Option<String>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff_seconds: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub project_id: String,
    pub schedule: Schedule,
    pub action_type: String,
    pub action_config: Map<String, Value>,
    pub max_retries: u32,
    pub backoff_seconds: u64,
}

/// The closed set of dispatchable actions.
#[derive(Debug, Clone, PartialEq)]
pub enum JobAction {
    Shell {
        command: String,
        cwd: Option<String>,
        timeout_seconds: Option<u64>,
    },
    AgentSpawn {
        prompt: String,
        provider: Option<String>,
        workflow: Option<String>,
        timeout_seconds: Option<u64>,
    },
    Pipeline {
        pipeline: String,
        inputs: Map<String, Value>,
    },
}

pub fn parse_action(action_type: &str, config: &Map<String, Value>) -> Result<JobAction, String> {
    let text = |key: &str| {
        config
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let seconds = |key: &str| config.get(key).and_then(Value::as_u64);
    match action_type {
        "shell" => {
            let command =
                text("command").ok_or_else(|| "shell action requires `command`".to_string())?;
            Ok(JobAction::Shell {
                command,
                cwd: text("cwd"),
                timeout_seconds: seconds("timeout_seconds"),
            })
        }
        "agent_spawn" => {
            let prompt = text("prompt")
                .ok_or_else(|| "agent_spawn action requires `prompt`".to_string())?;
            Ok(JobAction::AgentSpawn {
                prompt,
                provider: text("provider"),
                workflow: text("workflow"),
                timeout_seconds: seconds("timeout_seconds"),
            })
        }
        "pipeline" => {
            let pipeline = text("pipeline")
                .ok_or_else(|| "pipeline action requires `pipeline`".to_string())?;
            let inputs = match config.get("inputs") {
                Some(Value::Object(map)) => map.clone(),
                Some(_) => return Err("pipeline action `inputs` must be an object".to_string()),
                None => Map::new(),
            };
            Ok(JobAction::Pipeline { pipeline, inputs })
        }
        other => Err(format!("unknown action_type `{other}`")),
    }
}

#[derive(Debug, Clone)]
pub struct JobStore {
    state_root: PathBuf,
}

impl JobStore {
    pub fn new(state_root: impl AsRef<Path>) -> Self {
        Self {
            state_root: state_root.as_ref().to_path_buf(),
        }
    }

    pub fn create(&self, input: NewJob, now: i64) -> Result<CronJob, EngineError> {
        validate_schedule(&input.schedule).map_err(EngineError::Config)?;
        validate_identifier_value("project id", &input.project_id)
            .map_err(EngineError::Config)?;
        let job_id = generate_run_id("job", now).map_err(EngineError::IdGeneration)?;
        let next_run_at =
            compute_next_run_at(&input.schedule, now, None).map_err(EngineError::Config)?;
        let job = CronJob {
            job_id,
            project_id: input.project_id,
            schedule: input.schedule,
            action_type: input.action_type,
            action_config: input.action_config,
            state: JobState::Enabled,
            next_run_at,
            last_run_at: None,
            last_result: None,
            max_retries: input.max_retries,
            backoff_seconds: input.backoff_seconds,
            consecutive_failures: 0,
            created_at: now,
            updated_at: now,
        };
        self.persist_job(&job)?;
        Ok(job)
    }

    pub fn load(&self, job_id: &str) -> Result<CronJob, EngineError> {
        let path = self.job_path(job_id);
        let raw = fs::read_to_string(&path).map_err(|err| io_error(&path, err))?;
        serde_json::from_str(&raw).map_err(|err| json_error(&path, err))
    }

    pub fn list_all(&self) -> Result<Vec<CronJob>, EngineError> {
        let dir = self.jobs_dir();
        let mut jobs = Vec::new();
        if !dir.exists() {
            return Ok(jobs);
        }
        for entry in fs::read_dir(&dir).map_err(|err| io_error(&dir, err))? {
            let path = entry.map_err(|err| io_error(&dir, err))?.path();
            if path.extension().and_then(|v| v.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(&path).map_err(|err| io_error(&path, err))?;
            let job: CronJob =
                serde_json::from_str(&raw).map_err(|err| json_error(&path, err))?;
            jobs.push(job);
        }
        jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(jobs)
    }

    pub fn pause(&self, job_id: &str, now: i64) -> Result<CronJob, EngineError> {
        self.transition_state(job_id, JobState::Paused, now)
    }

    pub fn resume(&self, job_id: &str, now: i64) -> Result<CronJob, EngineError> {
        self.transition_state(job_id, JobState::Enabled, now)
    }

    pub fn delete(&self, job_id: &str, now: i64) -> Result<CronJob, EngineError> {
        self.transition_state(job_id, JobState::Deleted, now)
    }

    /// Forces the job's next firing to `now`; the next `run_due_jobs` tick
    /// picks it up.
    pub fn run_now(&self, job_id: &str, now: i64) -> Result<CronJob, EngineError> {
        let mut job = self.load(job_id)?;
        if job.state != JobState::Enabled {
            return Err(EngineError::Config(format!(
                "job `{job_id}` must be enabled before run_now (state={})",
                job.state.as_str()
            )));
        }
        job.next_run_at = Some(now);
        job.updated_at = now;
        self.persist_job(&job)?;
        Ok(job)
    }

    pub fn list_runs(&self, job_id: &str) -> Result<Vec<CronRun>, EngineError> {
        let dir = self.runs_dir(job_id);
        let mut runs = Vec::new();
        if !dir.exists() {
            return Ok(runs);
        }
        for entry in fs::read_dir(&dir).map_err(|err| io_error(&dir, err))? {
            let path = entry.map_err(|err| io_error(&dir, err))?.path();
            if path.extension().and_then(|v| v.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(&path).map_err(|err| io_error(&path, err))?;
            let run: CronRun =
                serde_json::from_str(&raw).map_err(|err| json_error(&path, err))?;
            runs.push(run);
        }
        runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(runs)
    }

    pub fn has_live_run(&self, job_id: &str) -> Result<bool, EngineError> {
        Ok(self
            .list_runs(job_id)?
            .iter()
            .any(|run| matches!(run.status, RunStatus::Pending | RunStatus::Running)))
    }

    /// Settles runs left `pending`/`running` by an interrupted process.
    /// Ticks run a job's action to completion before returning and never
    /// overlap, so a live-looking run observed at tick start cannot still
    /// be executing; left alone it would block the job forever.
    pub fn settle_interrupted_runs(
        &self,
        job_id: &str,
        now: i64,
    ) -> Result<Vec<CronRun>, EngineError> {
        let mut settled = Vec::new();
        for mut run in self.list_runs(job_id)? {
            if !matches!(run.status, RunStatus::Pending | RunStatus::Running) {
                continue;
            }
            run.status = RunStatus::Failed;
            run.error = Some("interrupted before completion".to_string());
            run.completed_at = Some(now);
            self.persist_run(&run)?;
            settled.push(run);
        }
        Ok(settled)
    }

    pub fn persist_job(&self, job: &CronJob) -> Result<(), EngineError> {
        let path = self.job_path(&job.job_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| io_error(parent, err))?;
        }
        let body = serde_json::to_vec_pretty(job).map_err(|err| json_error(&path, err))?;
        atomic_write_file(&path, &body).map_err(|err| io_error(&path, err))
    }

    pub fn persist_run(&self, run: &CronRun) -> Result<(), EngineError> {
        let path = self.run_path(&run.job_id, &run.run_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| io_error(parent, err))?;
        }
        let body = serde_json::to_vec_pretty(run).map_err(|err| json_error(&path, err))?;
        atomic_write_file(&path, &body).map_err(|err| io_error(&path, err))
    }

    fn transition_state(
        &self,
        job_id: &str,
        to: JobState,
        now: i64,
    ) -> Result<CronJob, EngineError> {
        let mut job = self.load(job_id)?;
        if !valid_transition(job.state, to) {
            return Err(EngineError::Config(format!(
                "invalid job transition `{}` -> `{}`",
                job.state.as_str(),
                to.as_str()
            )));
        }
        job.state = to;
        job.updated_at = now;
        self.persist_job(&job)?;
        Ok(job)
    }

    fn jobs_dir(&self) -> PathBuf {
        self.state_root.join("scheduler/jobs")
    }

    fn job_path(&self, job_id: &str) -> PathBuf {
        self.jobs_dir().join(format!("{}.json", sanitize_id(job_id)))
    }

    fn runs_dir(&self, job_id: &str) -> PathBuf {
        self.state_root.join("scheduler/runs").join(sanitize_id(job_id))
    }

    fn run_path(&self, job_id: &str, run_id: &str) -> PathBuf {
        self.runs_dir(job_id)
            .join(format!("{}.json", sanitize_id(run_id)))
    }
}

fn valid_transition(from: JobState, to: JobState) -> bool {
    match from {
        JobState::Enabled => matches!(to, JobState::Paused | JobState::Disabled | JobState::Deleted),
        JobState::Paused => matches!(to, JobState::Enabled | JobState::Disabled | JobState::Deleted),
        JobState::Disabled => matches!(to, JobState::Enabled | JobState::Deleted),
        JobState::Deleted => false,
    }
}

pub struct JobDispatcher {
    store: JobStore,
    work_dir: PathBuf,
}

impl JobDispatcher {
    pub fn new(store: JobStore, work_dir: impl AsRef<Path>) -> Self {
        Self {
            store,
            work_dir: work_dir.as_ref().to_path_buf(),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// One scheduler tick: fires every enabled job whose `next_run_at` has
    /// passed and records a `CronRun` per firing. Returns the finished runs.
    pub fn run_due_jobs(
        &self,
        executor: &PipelineExecutor,
        spawner: &dyn AgentSpawner,
        now: i64,
    ) -> Result<Vec<CronRun>, EngineError> {
        let state_root = self.store.state_root.clone();
        let mut finished = Vec::new();

        for mut job in self.store.list_all()? {
            // Crash recovery: a run still marked live at tick start is a
            // leftover from an interrupted process, not work in flight.
            for stale in self.store.settle_interrupted_runs(&job.job_id, now)? {
                log_event(
                    &state_root,
                    "scheduler.run.interrupted",
                    &[
                        ("jobId", Value::String(job.job_id.clone())),
                        ("runId", Value::String(stale.run_id.clone())),
                    ],
                );
            }

            if job.state != JobState::Enabled {
                continue;
            }
            let Some(due_at) = job.next_run_at else {
                continue;
            };
            if due_at > now {
                continue;
            }
            // Runs for one job never overlap.
            if self.store.has_live_run(&job.job_id)? {
                continue;
            }

            let run_id = generate_run_id("run", now).map_err(EngineError::IdGeneration)?;
            let mut run = CronRun {
                run_id,
                job_id: job.job_id.clone(),
                status: RunStatus::Pending,
                started_at: None,
                completed_at: None,
                output: None,
                error: None,
                created_at: now,
            };
            self.store.persist_run(&run)?;

            run.status = RunStatus::Running;
            run.started_at = Some(now);
            self.store.persist_run(&run)?;

            let result = self.dispatch(&job, executor, spawner, now)?;
            match result {
                Ok(output) => {
                    run.status = RunStatus::Completed;
                    run.output = Some(bounded_output(&output));
                    job.consecutive_failures = 0;
                    job.last_result = Some("completed".to_string());
                }
                Err(reason) => {
                    run.status = RunStatus::Failed;
                    run.error = Some(bounded_error(&reason));
                    job.consecutive_failures = job.consecutive_failures.saturating_add(1);
                    job.last_result = Some("failed".to_string());
                }
            }
            run.completed_at = Some(now);
            self.store.persist_run(&run)?;

            job.last_run_at = Some(now);
            self.advance_schedule(&mut job, due_at, run.status == RunStatus::Failed, now);
            job.updated_at = now;
            self.store.persist_job(&job)?;

            log_event(
                &state_root,
                match run.status {
                    RunStatus::Completed => "scheduler.run.completed",
                    _ => "scheduler.run.failed",
                },
                &[
                    ("jobId", Value::String(job.job_id.clone())),
                    ("runId", Value::String(run.run_id.clone())),
                ],
            );
            finished.push(run);
        }
        Ok(finished)
    }

    /// Inner error channel is the run-level failure; the outer one is
    /// reserved for persistence problems that must reach the caller.
    fn dispatch(
        &self,
        job: &CronJob,
        executor: &PipelineExecutor,
        spawner: &dyn AgentSpawner,
        now: i64,
    ) -> Result<Result<String, String>, EngineError> {
        let action = match parse_action(&job.action_type, &job.action_config) {
            Ok(action) => action,
            Err(reason) => return Ok(Err(reason)),
        };

        match action {
            JobAction::Shell {
                command,
                cwd,
                timeout_seconds,
            } => {
                let cwd = cwd
                    .map(PathBuf::from)
                    .unwrap_or_else(|| self.work_dir.clone());
                let timeout = Duration::from_secs(
                    timeout_seconds.unwrap_or(DEFAULT_JOB_TIMEOUT_SECONDS),
                );
                Ok(match run_shell(&command, &cwd, timeout) {
                    Ok(output) if output.exit_code == 0 => {
                        Ok(output.stdout.trim_end().to_string())
                    }
                    Ok(output) => Err(format!(
                        "command exited with status {}: {}",
                        output.exit_code,
                        output.stderr.trim()
                    )),
                    Err(err) => Err(err.to_string()),
                })
            }
            JobAction::AgentSpawn {
                prompt,
                provider,
                workflow,
                timeout_seconds,
            } => {
                let request = SpawnRequest {
                    prompt,
                    project_id: job.project_id.clone(),
                    provider,
                    workflow,
                    timeout: Duration::from_secs(
                        timeout_seconds.unwrap_or(DEFAULT_JOB_TIMEOUT_SECONDS),
                    ),
                };
                Ok(spawner.spawn_headless(&request))
            }
            JobAction::Pipeline { pipeline, inputs } => {
                match executor.execute(&pipeline, inputs, &job.project_id, None, now) {
                    Ok(outcome) => {
                        let execution = outcome.execution();
                        let summary = format!(
                            "pipeline execution {} {}",
                            execution.id,
                            execution.status.as_str()
                        );
                        Ok(match outcome {
                            ExecutionOutcome::Failed(_) => Err(summary),
                            _ => Ok(summary),
                        })
                    }
                    // Persistence failures must surface; everything else is
                    // this run's failure.
                    Err(err @ (EngineError::Io { .. } | EngineError::Json { .. })) => Err(err),
                    Err(err) => Ok(Err(err.to_string())),
                }
            }
        }
    }

    /// Advances `next_run_at`: failed runs retry on exponential backoff up
    /// to `max_retries`, then fall back to the regular cadence. An
    /// exhausted schedule disables the job.
    fn advance_schedule(&self, job: &mut CronJob, fired_at: i64, failed: bool, now: i64) {
        if failed && job.backoff_seconds > 0 && job.consecutive_failures <= job.max_retries {
            let shift = job.consecutive_failures.saturating_sub(1).min(16);
            let delay = job
                .backoff_seconds
                .saturating_mul(1_u64 << shift)
                .min(MAX_BACKOFF_SECONDS);
            job.next_run_at = Some(now.saturating_add(delay as i64));
            return;
        }
        if failed {
            job.consecutive_failures = 0;
        }
        match compute_next_run_at(&job.schedule, now, Some(fired_at)) {
            Ok(Some(next)) => job.next_run_at = Some(next),
            Ok(None) => {
                job.next_run_at = None;
                job.state = JobState::Disabled;
            }
            Err(reason) => {
                log_diagnostic(
                    &self.store.state_root,
                    "scheduler",
                    &format!("job `{}` schedule no longer computes: {reason}", job.job_id),
                );
                job.next_run_at = None;
                job.state = JobState::Disabled;
            }
        }
    }
}

pub fn validate_schedule(schedule: &Schedule) -> Result<(), String> {
    match schedule {
        Schedule::Once { .. } => Ok(()),
        Schedule::Interval { every_seconds, .. } => {
            if *every_seconds == 0 {
                return Err("interval.every_seconds must be >= 1".to_string());
            }
            if *every_seconds > MAX_INTERVAL_SECONDS {
                return Err(format!(
                    "interval.every_seconds must be <= {MAX_INTERVAL_SECONDS}"
                ));
            }
            Ok(())
        }
        Schedule::Cron {
            expression,
            timezone,
        } => {
            parse_cron_expression(expression)?;
            timezone
                .parse::<Tz>()
                .map(|_| ())
                .map_err(|_| format!("invalid timezone `{timezone}`; expected IANA timezone id"))
        }
    }
}

pub fn compute_next_run_at(
    schedule: &Schedule,
    now: i64,
    last_run_at: Option<i64>,
) -> Result<Option<i64>, String> {
    match schedule {
        Schedule::Once { run_at } => Ok(if last_run_at.is_some() {
            None
        } else {
            Some(*run_at)
        }),
        Schedule::Interval {
            every_seconds,
            anchor_at,
        } => {
            if *every_seconds == 0 {
                return Err("interval.every_seconds must be >= 1".to_string());
            }
            let base = last_run_at.or(*anchor_at).unwrap_or(now);
            Ok(Some(base.saturating_add(*every_seconds as i64)))
        }
        Schedule::Cron {
            expression,
            timezone,
        } => {
            let tz = timezone
                .parse::<Tz>()
                .map_err(|_| format!("invalid timezone `{timezone}`; expected IANA timezone id"))?;
            let cron = parse_cron_expression(expression)?;
            // Cron fires on minute boundaries; start at the minute after the
            // reference point.
            let mut candidate = ((last_run_at.unwrap_or(now) / 60) + 1) * 60;
            for _ in 0..MAX_CRON_SEARCH_MINUTES {
                if cron.matches(candidate, &tz) {
                    return Ok(Some(candidate));
                }
                candidate = candidate.saturating_add(60);
            }
            Err(format!(
                "unable to compute next run for cron expression `{expression}`"
            ))
        }
    }
}

#[derive(Debug, Clone)]
struct FieldSpec {
    any: bool,
    allowed: BTreeSet<u32>,
}

impl FieldSpec {
    fn admits(&self, value: u32) -> bool {
        self.any || self.allowed.contains(&value)
    }
}

/// Classic 5-field cron: minute, hour, day-of-month, month, day-of-week.
/// Supports `*`, lists, ranges, steps, and month/weekday name aliases.
#[derive(Debug, Clone)]
pub struct CronExpression {
    minute: FieldSpec,
    hour: FieldSpec,
    day_of_month: FieldSpec,
    month: FieldSpec,
    day_of_week: FieldSpec,
}

const MONTH_NAMES: &[(&str, u32)] = &[
    ("jan", 1),
    ("feb", 2),
    ("mar", 3),
    ("apr", 4),
    ("may", 5),
    ("jun", 6),
    ("jul", 7),
    ("aug", 8),
    ("sep", 9),
    ("oct", 10),
    ("nov", 11),
    ("dec", 12),
];

const WEEKDAY_NAMES: &[(&str, u32)] = &[
    ("sun", 0),
    ("mon", 1),
    ("tue", 2),
    ("wed", 3),
    ("thu", 4),
    ("fri", 5),
    ("sat", 6),
];

impl CronExpression {
    fn matches(&self, unix_ts: i64, timezone: &Tz) -> bool {
        let Some(utc) = Utc.timestamp_opt(unix_ts, 0).single() else {
            return false;
        };
        let local = utc.with_timezone(timezone);
        if !self.minute.admits(local.minute())
            || !self.hour.admits(local.hour())
            || !self.month.admits(local.month())
        {
            return false;
        }

        let dom = self.day_of_month.admits(local.day());
        let dow = self
            .day_of_week
            .admits(local.weekday().num_days_from_sunday());
        // Vixie-cron day semantics: when both day fields are restricted,
        // either one matching is enough.
        if self.day_of_month.any || self.day_of_week.any {
            dom && dow
        } else {
            dom || dow
        }
    }
}

pub fn parse_cron_expression(raw: &str) -> Result<CronExpression, String> {
    let fields: Vec<&str> = raw.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(
            "cron expression must use 5 fields: minute hour day_of_month month day_of_week"
                .to_string(),
        );
    }
    Ok(CronExpression {
        minute: parse_field(fields[0], 0, 59, &[])?,
        hour: parse_field(fields[1], 0, 23, &[])?,
        day_of_month: parse_field(fields[2], 1, 31, &[])?,
        month: parse_field(fields[3], 1, 12, MONTH_NAMES)?,
        day_of_week: parse_field(fields[4], 0, 7, WEEKDAY_NAMES)?,
    })
}

fn parse_field(
    raw: &str,
    min: u32,
    max: u32,
    names: &[(&str, u32)],
) -> Result<FieldSpec, String> {
    if raw == "*" {
        return Ok(FieldSpec {
            any: true,
            allowed: BTreeSet::new(),
        });
    }

    let mut allowed = BTreeSet::new();
    for segment in raw.split(',') {
        let (range_raw, step) = match segment.split_once('/') {
            Some((range, step_raw)) => {
                let step = step_raw
                    .parse::<u32>()
                    .map_err(|_| format!("invalid cron step `{step_raw}`"))?;
                if step == 0 {
                    return Err("cron step must be >= 1".to_string());
                }
                (range, step)
            }
            None => (segment, 1),
        };

        let (start, end) = if range_raw == "*" {
            (min, max)
        } else if let Some((start_raw, end_raw)) = range_raw.split_once('-') {
            (
                parse_atom(start_raw, min, max, names)?,
                parse_atom(end_raw, min, max, names)?,
            )
        } else {
            let value = parse_atom(range_raw, min, max, names)?;
            (value, value)
        };
        if start > end {
            return Err(format!("invalid cron range `{segment}`"));
        }

        let mut value = start;
        while value <= end {
            // cron allows both 0 and 7 for Sunday
            allowed.insert(if max == 7 && value == 7 { 0 } else { value });
            match value.checked_add(step) {
                Some(next) => value = next,
                None => break,
            }
        }
    }
    if allowed.is_empty() {
        return Err(format!("invalid cron field `{raw}`"));
    }
    Ok(FieldSpec {
        any: false,
        allowed,
    })
}

fn parse_atom(raw: &str, min: u32, max: u32, names: &[(&str, u32)]) -> Result<u32, String> {
    let lower = raw.to_ascii_lowercase();
    let value = names
        .iter()
        .find(|(name, _)| *name == lower)
        .map(|(_, value)| *value)
        .map_or_else(
            || {
                lower
                    .parse::<u32>()
                    .map_err(|_| format!("invalid cron value `{raw}`"))
            },
            Ok,
        )?;
    if value < min || value > max {
        return Err(format!("cron value `{raw}` is out of bounds ({min}..={max})"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cron_parse_rejects_malformed_fields() {
        assert!(parse_cron_expression("0 12 * *").is_err());
        assert!(parse_cron_expression("61 * * * *").is_err());
        assert!(parse_cron_expression("*/0 * * * *").is_err());
        assert!(parse_cron_expression("0 12 * * mon-fri").is_ok());
    }

    #[test]
    fn cron_next_run_in_utc() {
        let schedule = Schedule::Cron {
            expression: "0 12 * * *".to_string(),
            timezone: "UTC".to_string(),
        };
        // From the epoch, noon UTC on 1970-01-01 is 43200.
        let next = compute_next_run_at(&schedule, 0, None).expect("compute");
        assert_eq!(next, Some(43_200));
    }

    #[test]
    fn interval_advances_from_last_run() {
        let schedule = Schedule::Interval {
            every_seconds: 300,
            anchor_at: None,
        };
        assert_eq!(
            compute_next_run_at(&schedule, 1_000, Some(900)).expect("compute"),
            Some(1_200)
        );
        assert_eq!(
            compute_next_run_at(&schedule, 1_000, None).expect("compute"),
            Some(1_300)
        );
    }

    #[test]
    fn once_schedule_exhausts_after_firing() {
        let schedule = Schedule::Once { run_at: 500 };
        assert_eq!(
            compute_next_run_at(&schedule, 400, None).expect("compute"),
            Some(500)
        );
        assert_eq!(
            compute_next_run_at(&schedule, 600, Some(500)).expect("compute"),
            None
        );
    }

    #[test]
    fn unknown_action_type_fails_parse() {
        let err = parse_action("ftp_upload", &Map::new()).expect_err("must fail");
        assert!(err.contains("unknown action_type"));
    }

    #[test]
    fn deleted_jobs_accept_no_transitions() {
        assert!(!valid_transition(JobState::Deleted, JobState::Enabled));
        assert!(valid_transition(JobState::Enabled, JobState::Paused));
        assert!(valid_transition(JobState::Paused, JobState::Enabled));
    }
}
