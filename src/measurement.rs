//! Measurement log.
//!
//! One CSV row per control-loop iteration: iteration number, load index of the color and
//! depth frames that were consumed, and the body pose in row-major order. The file is
//! opened, appended and closed for every record, so a process that dies between records
//! leaves a log that is consistent up to the last complete row.
//!
//! The sink MUST NOT:
//! - Rewrite or delete a row once written
//! - Hold the file open across iterations
//! - Abort the caller on I/O failure (failures are reported and absorbed)

use anyhow::{anyhow, Context, Result};
use nalgebra::Matrix4;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Fixed header row. The last four pose entries (the homogeneous bottom row) fall under
/// the `e1..e4` columns, matching logs written by earlier recording tools.
pub const MEASUREMENT_HEADER: &str = "iteration,rgb_load_index,depth_load_index,r11,r12,r13,p1,r21,r22,r23,p2,r31,r32,r33,p3,e1,e2,e3,e4";

const POSE_FIELDS: usize = 16;
const ERROR_FIELDS: usize = 4;

/// Everything logged for one iteration. Written once, never mutated.
#[derive(Clone, Debug, PartialEq)]
pub struct IterationRecord {
    pub iteration: u64,
    pub rgb_load_index: Option<u64>,
    pub depth_load_index: Option<u64>,
    pub pose: Matrix4<f32>,
    /// Optional error metrics. Only written when at least one is set.
    pub errors: [Option<f32>; ERROR_FIELDS],
}

impl IterationRecord {
    pub fn new(iteration: u64, pose: Matrix4<f32>) -> Self {
        Self {
            iteration,
            rgb_load_index: None,
            depth_load_index: None,
            pose,
            errors: [None; ERROR_FIELDS],
        }
    }

    fn to_fields(&self) -> Vec<String> {
        let mut fields = Vec::with_capacity(3 + POSE_FIELDS + ERROR_FIELDS);
        fields.push(self.iteration.to_string());
        fields.push(optional_field(self.rgb_load_index));
        fields.push(optional_field(self.depth_load_index));
        for row in 0..4 {
            for col in 0..4 {
                fields.push(self.pose[(row, col)].to_string());
            }
        }
        if self.errors.iter().any(Option::is_some) {
            fields.extend(self.errors.iter().map(|e| optional_field(*e)));
        }
        fields
    }

    fn from_fields(record: &csv::StringRecord) -> Result<Self> {
        // Older tools end every row with a trailing comma.
        let fields: Vec<&str> = record.iter().map(str::trim).collect();
        let fields = match fields.split_last() {
            Some((last, rest)) if last.is_empty() && rest.len() >= 3 + POSE_FIELDS => rest,
            _ => &fields[..],
        };
        if fields.len() < 3 + POSE_FIELDS {
            return Err(anyhow!(
                "measurement row has {} fields, need at least {}",
                fields.len(),
                3 + POSE_FIELDS
            ));
        }

        let iteration = fields[0]
            .parse::<u64>()
            .with_context(|| format!("invalid iteration '{}'", fields[0]))?;
        let rgb_load_index = parse_optional::<u64>(fields[1])?;
        let depth_load_index = parse_optional::<u64>(fields[2])?;
        let mut pose = Matrix4::<f32>::zeros();
        for (i, raw) in fields[3..3 + POSE_FIELDS].iter().enumerate() {
            pose[(i / 4, i % 4)] = raw
                .parse::<f32>()
                .with_context(|| format!("invalid pose entry '{}'", raw))?;
        }
        let mut errors = [None; ERROR_FIELDS];
        for (slot, raw) in errors.iter_mut().zip(fields[3 + POSE_FIELDS..].iter()) {
            *slot = parse_optional::<f32>(raw)?;
        }

        Ok(Self {
            iteration,
            rgb_load_index,
            depth_load_index,
            pose,
            errors,
        })
    }
}

fn optional_field<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn parse_optional<T>(raw: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<T>()
        .map(Some)
        .with_context(|| format!("invalid field '{}'", raw))
}

/// Append-only CSV sink for iteration records.
#[derive(Debug)]
pub struct MeasurementSink {
    path: PathBuf,
    degraded: Option<String>,
}

impl MeasurementSink {
    /// Create (or truncate) the log and write the header row.
    ///
    /// Never fails outright: an unwritable destination yields a degraded sink whose
    /// `record` calls are rejected. Check `status()` for the reason.
    pub fn create(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let degraded = match write_header(&path) {
            Ok(()) => None,
            Err(err) => {
                log::error!(
                    "measurement sink: unable to create {}: {:#}",
                    path.display(),
                    err
                );
                Some(format!("{:#}", err))
            }
        };
        Self { path, degraded }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    /// `Ok` when the header was written; the creation error otherwise.
    pub fn status(&self) -> Result<()> {
        match &self.degraded {
            None => Ok(()),
            Some(reason) => Err(anyhow!(
                "measurement sink {} is degraded: {}",
                self.path.display(),
                reason
            )),
        }
    }

    /// Append one row. Opens, writes, flushes and closes the file.
    pub fn record(&self, record: &IterationRecord) -> Result<()> {
        self.status()?;

        let mut row = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_writer(Vec::new());
        row.write_record(record.to_fields())?;
        let line = row
            .into_inner()
            .map_err(|e| anyhow!("serialize measurement row: {}", e))?;

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("measurement sink: unable to open {}", self.path.display()))?;
        // Single write per row.
        file.write_all(&line)
            .with_context(|| format!("measurement sink: append to {}", self.path.display()))?;
        file.flush()?;
        Ok(())
    }
}

fn write_header(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    writeln!(file, "{}", MEASUREMENT_HEADER)?;
    file.flush()?;
    Ok(())
}

/// Parse a measurement log back into records. The header row is skipped.
pub fn read_measurements(path: &Path) -> Result<Vec<IterationRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("open measurement log {}", path.display()))?;
    let mut records = Vec::new();
    for (line, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("read row {} of {}", line + 1, path.display()))?;
        records.push(
            IterationRecord::from_fields(&row)
                .with_context(|| format!("row {} of {}", line + 1, path.display()))?,
        );
    }
    Ok(records)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
