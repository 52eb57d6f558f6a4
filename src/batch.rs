use std::path::{Component, Path};
use std::thread;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use rayon::prelude::*;
use serde::Serialize;
use uuid::Uuid;

use crate::archive;
use crate::audit::{AuditEntry, AuditSink};
use crate::config::AppConfig;
use crate::error::BatchError;
use crate::qr::{self, ClaimedPaths, Outcome};
use crate::record::{clean_number, CanonicalRecord, RawRow, COL_FAMILY_CARD, COL_IDENTITY};
use crate::table;
use crate::validate;

/// Aggregated counts for one full run. `generated + skipped + invalid +
/// errors.len()` always equals the number of dispatched rows; blocked rows
/// are reported through `errors`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub generated: usize,
    pub skipped: usize,
    pub invalid: usize,
    pub errors: Vec<String>,
    pub zip_filename: String,
}

impl BatchSummary {
    fn absorb(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Created { .. } => self.generated += 1,
            Outcome::Skipped { .. } => self.skipped += 1,
            Outcome::Invalid { .. } => self.invalid += 1,
            Outcome::Blocked { reason } => self.errors.push(reason.clone()),
            Outcome::Error { message } => self.errors.push(message.clone()),
        }
    }
}

/// Runs one full batch: validate, parse, fan one unit of work per row
/// across a bounded pool, aggregate, then archive the output tree.
/// Batch-level failures abort the run before any row is dispatched;
/// row-level issues only ever show up in the summary and the audit trail.
pub fn run_generate(
    config: &AppConfig,
    input: &Path,
    output_root: &Path,
    signature: Option<&str>,
) -> Result<BatchSummary, BatchError> {
    reject_parent_refs(input)?;
    reject_parent_refs(output_root)?;

    let kind = validate::validate_input(input, config)?;
    validate::verify_signature(input, signature, config)?;

    // parse from a sandboxed copy so the upload area is never read again
    // past validation
    let sandbox = tempfile::Builder::new()
        .prefix("generate_sandbox_")
        .tempdir()?;
    let sandbox_input = sandbox.path().join(sandbox_file_name(input));
    std::fs::copy(input, &sandbox_input)?;

    let table = table::read_table(&sandbox_input, kind)?;
    table.require_columns()?;
    info!("Parsed {} rows from {}", table.rows.len(), input.display());

    std::fs::create_dir_all(output_root)?;
    let output_root = output_root.canonicalize()?;

    let workers = config.effective_workers();
    let run_id = Uuid::new_v4().to_string();
    info!(
        "Run {}: dispatching {} rows across {} workers",
        run_id,
        table.rows.len(),
        workers
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| BatchError::Pool(e.to_string()))?;

    let sink = AuditSink::spawn(config.audit_log_path.clone(), (workers * 2).max(16));
    let claimed = ClaimedPaths::default();

    let progress = ProgressBar::new(table.rows.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta} @ {per_sec}) {msg}")
            .expect("progress bar template is valid")
            .progress_chars("=> "),
    );

    let outcomes: Vec<Outcome> = pool.install(|| {
        table
            .rows
            .par_iter()
            .map(|row| {
                let (outcome, entry) = process_row(config, &run_id, row, &output_root, &claimed);
                sink.record(entry);
                progress.set_message(format!("row {}: {}", row.index, outcome.action()));
                progress.inc(1);
                outcome
            })
            .collect()
    });
    progress.finish_with_message("rows complete");

    let mut summary = BatchSummary::default();
    for outcome in &outcomes {
        summary.absorb(outcome);
    }

    // every worker has reported by now; the tree is immutable from here on
    summary.zip_filename = archive::archive_output_root(&output_root)?;

    sink.record(AuditEntry::finished(&run_id, &summary));
    let written = sink.finish();
    info!("Run {}: audit trail recorded {} entries", run_id, written);

    Ok(summary)
}

/// One unit of work: normalize, then render. Returns the outcome together
/// with its audit record; the caller owns both effects.
fn process_row(
    config: &AppConfig,
    run_id: &str,
    row: &RawRow,
    output_root: &Path,
    claimed: &ClaimedPaths,
) -> (Outcome, AuditEntry) {
    if config.task_delay_seconds > 0.0 && config.task_delay_seconds.is_finite() {
        thread::sleep(Duration::from_secs_f64(config.task_delay_seconds));
    }

    let identity_digits = clean_number(row.get(COL_IDENTITY).unwrap_or(""));
    let family_card_digits = clean_number(row.get(COL_FAMILY_CARD).unwrap_or(""));

    // audit messages stay free of identifier digits; the file names that
    // carry them only ever appear in the summary and the diagnostic log
    let (outcome, audit_message) = match CanonicalRecord::from_row(row, config) {
        Ok(record) => {
            let outcome = qr::write_qr(&record, output_root, claimed);
            let message = match &outcome {
                Outcome::Created { .. } => "created".to_string(),
                Outcome::Skipped { .. } => "exists".to_string(),
                Outcome::Blocked { .. } => "directory_traversal_detected".to_string(),
                Outcome::Invalid { reason } => reason.clone(),
                Outcome::Error { message } => message.clone(),
            };
            (outcome, message)
        }
        Err(rejection) => (
            Outcome::Invalid {
                reason: rejection.reason,
            },
            rejection.token.to_string(),
        ),
    };

    let entry = AuditEntry::for_row(
        run_id,
        row.index,
        &identity_digits,
        &family_card_digits,
        outcome.action(),
        audit_message,
    );
    (outcome, entry)
}

/// Interface contract with the caller: supplied paths carry no parent
/// references at all.
fn reject_parent_refs(path: &Path) -> Result<(), BatchError> {
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(BatchError::UnsafePath(path.to_path_buf()));
    }
    Ok(())
}

fn sandbox_file_name(input: &Path) -> String {
    match input.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("input.{ext}"),
        None => "input".to_string(),
    }
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{}.{:03}s", seconds, elapsed.subsec_millis())
    }
}
