//! Field-level encoding of persisted records.
//!
//! Records are flat string maps. Structured fields are JSON, id sets are
//! comma-delimited, timestamps are epoch seconds with six decimals. Empty
//! or unset fields are omitted entirely so presence always mirrors the
//! in-memory `Option`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::error::{FlowError, Result};
use crate::job::{ErrorEntry, JobId, JobRecord};
use crate::workflow::WorkflowId;

pub type Fields = BTreeMap<String, String>;

pub const WORKFLOW_ID: &str = "workflow_id";
pub const TYPE: &str = "type";
pub const ARGS: &str = "args";
pub const BEFORE: &str = "before";
pub const AFTER: &str = "after";
pub const ENQUEUED_AT: &str = "enqueued_at";
pub const STARTED_AT: &str = "started_at";
pub const FINISHED_AT: &str = "finished_at";
pub const ERROR_AT: &str = "error_at";
pub const FAILED_AT: &str = "failed_at";
pub const ERRORS: &str = "errors";
pub const JOB_IDS: &str = "job_ids";

/// Persisted shape of a workflow: its type and the ids of its jobs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowHeader {
    pub id: WorkflowId,
    pub workflow_type: String,
    pub job_ids: Vec<JobId>,
}

pub fn encode_timestamp(ts: &DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}

pub fn decode_timestamp(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
}

/// Decimal epoch seconds, exact to the microsecond.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    let micros = ts.timestamp_micros();
    let sign = if micros < 0 { "-" } else { "" };
    let abs = micros.unsigned_abs();
    format!("{sign}{}.{:06}", abs / 1_000_000, abs % 1_000_000)
}

/// Inverse of [`format_timestamp`]; also accepts integers and any other
/// decimal precision.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    let is_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if whole.is_empty() || !is_digits(whole) || !is_digits(frac) {
        return raw.parse::<f64>().ok().and_then(decode_timestamp);
    }
    let secs: i64 = whole.parse().ok()?;
    let mut micros_str: String = frac.chars().take(6).collect();
    while micros_str.len() < 6 {
        micros_str.push('0');
    }
    let frac_micros: i64 = micros_str.parse().ok()?;
    let total = secs.checked_mul(1_000_000)?.checked_add(frac_micros)?;
    DateTime::from_timestamp_micros(if negative { -total } else { total })
}

pub fn encode_ids<'a>(ids: impl IntoIterator<Item = &'a JobId>) -> String {
    ids.into_iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

pub fn decode_ids(key: &str, raw: &str) -> Result<Vec<JobId>> {
    raw.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            part.parse::<JobId>()
                .map_err(|err| FlowError::corrupt(key, format!("bad job id `{part}`: {err}")))
        })
        .collect()
}

fn put_timestamp(fields: &mut Fields, name: &str, value: &Option<DateTime<Utc>>) {
    if let Some(ts) = value {
        fields.insert(name.to_string(), format_timestamp(ts));
    }
}

fn take_timestamp(key: &str, fields: &Fields, name: &str) -> Result<Option<DateTime<Utc>>> {
    let Some(raw) = fields.get(name) else {
        return Ok(None);
    };
    parse_timestamp(raw)
        .map(Some)
        .ok_or_else(|| FlowError::corrupt(key, format!("`{name}` is not an epoch timestamp: {raw}")))
}

fn required<'a>(key: &str, fields: &'a Fields, name: &str) -> Result<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| FlowError::corrupt(key, format!("missing `{name}`")))
}

pub fn encode_job(job: &JobRecord) -> Result<Fields> {
    let mut fields = Fields::new();
    fields.insert(WORKFLOW_ID.into(), job.workflow_id.to_string());
    fields.insert(TYPE.into(), job.job_type.clone());
    if !job.args.is_empty() {
        fields.insert(ARGS.into(), serde_json::to_string(&job.args).map_err(FlowError::store)?);
    }
    if !job.before.is_empty() {
        fields.insert(BEFORE.into(), encode_ids(&job.before));
    }
    if !job.after.is_empty() {
        fields.insert(AFTER.into(), encode_ids(&job.after));
    }
    put_timestamp(&mut fields, ENQUEUED_AT, &job.enqueued_at);
    put_timestamp(&mut fields, STARTED_AT, &job.started_at);
    put_timestamp(&mut fields, FINISHED_AT, &job.finished_at);
    put_timestamp(&mut fields, ERROR_AT, &job.error_at);
    put_timestamp(&mut fields, FAILED_AT, &job.failed_at);
    if !job.errors.is_empty() {
        fields.insert(ERRORS.into(), serde_json::to_string(&job.errors).map_err(FlowError::store)?);
    }
    Ok(fields)
}

pub fn decode_job(key: &str, id: JobId, fields: &Fields) -> Result<JobRecord> {
    let workflow_id = required(key, fields, WORKFLOW_ID)?
        .parse::<WorkflowId>()
        .map_err(|err| FlowError::corrupt(key, err))?;
    let job_type = required(key, fields, TYPE)?.to_string();

    let args = match fields.get(ARGS) {
        Some(raw) => serde_json::from_str(raw).map_err(|err| FlowError::corrupt(key, err))?,
        None => Vec::new(),
    };
    let errors: Vec<ErrorEntry> = match fields.get(ERRORS) {
        Some(raw) => serde_json::from_str(raw).map_err(|err| FlowError::corrupt(key, err))?,
        None => Vec::new(),
    };
    let before: BTreeSet<JobId> = match fields.get(BEFORE) {
        Some(raw) => decode_ids(key, raw)?.into_iter().collect(),
        None => BTreeSet::new(),
    };
    let after: BTreeSet<JobId> = match fields.get(AFTER) {
        Some(raw) => decode_ids(key, raw)?.into_iter().collect(),
        None => BTreeSet::new(),
    };

    Ok(JobRecord {
        id,
        workflow_id,
        job_type,
        args,
        before,
        after,
        enqueued_at: take_timestamp(key, fields, ENQUEUED_AT)?,
        started_at: take_timestamp(key, fields, STARTED_AT)?,
        finished_at: take_timestamp(key, fields, FINISHED_AT)?,
        error_at: take_timestamp(key, fields, ERROR_AT)?,
        failed_at: take_timestamp(key, fields, FAILED_AT)?,
        errors,
    })
}

pub fn encode_workflow(header: &WorkflowHeader) -> Fields {
    let mut fields = Fields::new();
    fields.insert(TYPE.into(), header.workflow_type.clone());
    fields.insert(JOB_IDS.into(), encode_ids(&header.job_ids));
    fields
}

pub fn decode_workflow(key: &str, id: WorkflowId, fields: &Fields) -> Result<WorkflowHeader> {
    let workflow_type = required(key, fields, TYPE)?.to_string();
    let job_ids = match fields.get(JOB_IDS) {
        Some(raw) => decode_ids(key, raw)?,
        None => Vec::new(),
    };
    Ok(WorkflowHeader {
        id,
        workflow_type,
        job_ids,
    })
}
