//! # CLI Command Implementations

use crate::api::{self, AppState, json_to_value};
use crate::config::Blueprint;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagewalk_core::{
    FieldId, FieldMap, FinalizedRecord, MemorySink, RecordSink, RedbRecordStore, SequencerError,
    StepId, StepState,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// FILE INPUT
// =============================================================================

/// Maximum size of a scripted answers file (1 MB).
const MAX_ANSWERS_FILE_SIZE: u64 = 1024 * 1024;

/// Resolve `path` to an existing regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, SequencerError> {
    let canonical = path.canonicalize().map_err(|e| {
        SequencerError::Io(format!("Invalid file path '{}': {}", path.display(), e))
    })?;
    if !canonical.is_file() {
        return Err(SequencerError::Io(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }
    Ok(canonical)
}

fn validate_file_size(path: &Path, max_size: u64) -> Result<(), SequencerError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| SequencerError::Io(format!("Cannot read file metadata: {}", e)))?;
    if metadata.len() > max_size {
        return Err(SequencerError::LimitExceeded(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// The sequence file at `path`, or the bundled survey.
pub fn load_blueprint(path: Option<&Path>) -> Result<Blueprint, SequencerError> {
    match path {
        Some(path) => Blueprint::load(&validate_file_path(path)?),
        None => Blueprint::bundled(),
    }
}

// =============================================================================
// SERVER COMMAND
// =============================================================================

pub async fn cmd_server(
    blueprint: Blueprint,
    db_path: &Path,
    in_memory: bool,
    host: &str,
    port: u16,
) -> Result<(), SequencerError> {
    println!("Stagewalk Server Starting...");
    println!();
    println!("Configuration:");
    println!("  Host:       {}", host);
    println!("  Port:       {}", port);
    println!("  Sequence:   {}", blueprint.name());
    println!("  Treatments: {}", blueprint.treatments().join(", "));
    if in_memory {
        println!("  Records:    in memory");
    } else {
        println!("  Records:    {:?}", db_path);
    }
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let state = if in_memory {
        AppState::new(blueprint)
    } else {
        AppState::with_store(blueprint, RedbRecordStore::open(db_path)?)
    };
    let addr = format!("{}:{}", host, port);
    api::run_server(&addr, state).await
}

// =============================================================================
// CHECK COMMAND
// =============================================================================

/// How a step fares under one treatment before any answer is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedStep {
    Shown,
    /// Shown unless a skip condition holds at the time.
    Conditional,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreatmentReport {
    pub treatment: String,
    pub steps: Vec<(StepId, PlannedStep)>,
}

/// The plan of every step under `treatment`.
pub fn plan_for(
    blueprint: &Blueprint,
    treatment: &str,
) -> Result<TreatmentReport, SequencerError> {
    let definition = blueprint.definition(treatment)?;
    let mut steps = Vec::with_capacity(definition.step_count());
    for stage in definition.stages() {
        for slot in &stage.steps {
            let conditional = stage.skip_if.is_some()
                || definition
                    .descriptor(&slot.id)
                    .is_some_and(|d| d.skip_if.is_some());
            let planned = if definition.is_statically_skipped(&slot.id) {
                PlannedStep::Skipped
            } else if conditional {
                PlannedStep::Conditional
            } else {
                PlannedStep::Shown
            };
            steps.push((slot.id.clone(), planned));
        }
    }
    Ok(TreatmentReport {
        treatment: treatment.to_string(),
        steps,
    })
}

pub fn cmd_check(
    blueprint: &Blueprint,
    treatment: Option<&str>,
    json_mode: bool,
    verbose: bool,
) -> Result<(), SequencerError> {
    let treatments = match treatment {
        Some(t) => vec![t.to_string()],
        None => blueprint.treatments(),
    };
    let reports = treatments
        .iter()
        .map(|t| plan_for(blueprint, t))
        .collect::<Result<Vec<_>, _>>()?;

    if json_mode {
        let output = serde_json::json!({
            "sequence": blueprint.name(),
            "steps": blueprint.store().len(),
            "treatments": reports,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
        return Ok(());
    }

    println!("Sequence '{}' is valid", blueprint.name());
    println!("=========================");
    println!("Steps:             {}", blueprint.store().len());
    println!("Default treatment: {}", blueprint.default_treatment());
    for report in &reports {
        let shown = report
            .steps
            .iter()
            .filter(|(_, p)| *p != PlannedStep::Skipped)
            .count();
        println!();
        println!(
            "Treatment {} ({} of {} steps)",
            report.treatment,
            shown,
            report.steps.len()
        );
        for (id, planned) in &report.steps {
            match planned {
                PlannedStep::Shown if verbose => println!("  {}", id),
                PlannedStep::Shown => {}
                PlannedStep::Conditional => println!("  {} (conditional)", id),
                PlannedStep::Skipped => println!("  {} (skipped)", id),
            }
        }
    }
    Ok(())
}

// =============================================================================
// WALK COMMAND
// =============================================================================

/// Scripted answers: step id to field id to JSON value.
pub type Answers = BTreeMap<String, BTreeMap<String, Value>>;

/// Outcome of a scripted session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkReport {
    pub treatment: String,
    pub history: Vec<StepId>,
    pub skipped: Vec<StepId>,
    pub records: Vec<FinalizedRecord>,
}

/// Run one session to its end, answering each step from `answers`.
///
/// Steps without an entry are advanced with no values. The walk stops at
/// the first step that fails validation.
pub fn walk_session(
    blueprint: &Blueprint,
    treatment: &str,
    answers: &Answers,
) -> Result<WalkReport, SequencerError> {
    let sink = Arc::new(MemorySink::new());
    let sink_handle: Arc<dyn RecordSink> = Arc::clone(&sink) as Arc<dyn RecordSink>;
    let mut seq = blueprint.sequencer("cli-walk", treatment, sink_handle)?;
    seq.start()?;

    while !seq.is_game_over() {
        if seq.is_awaiting() {
            return Err(SequencerError::InvalidDefinition(
                "a hook is waiting for asynchronous work; scripted walks cannot resolve it"
                    .to_string(),
            ));
        }
        let view = seq.current_step().ok_or(SequencerError::NotStarted)?;
        if let Some(given) = answers.get(view.step.as_str()) {
            let mut values = FieldMap::new();
            for (field, raw) in given {
                let spec = view.fields.iter().find(|f| f.id.as_str() == field);
                let value = json_to_value(spec, raw).map_err(|msg| {
                    SequencerError::Serialization(format!("{}.{}: {}", view.step, field, msg))
                })?;
                values.insert(FieldId::new(field.as_str()), value);
            }
            seq.set_values(values)?;
        }
        seq.advance()?;
    }

    let skipped = seq
        .definition()
        .step_ids()
        .into_iter()
        .filter(|id| seq.state_of(id) == Some(StepState::Skipped))
        .cloned()
        .collect();
    Ok(WalkReport {
        treatment: treatment.to_string(),
        history: seq.history().to_vec(),
        skipped,
        records: sink.records(),
    })
}

pub fn cmd_walk(
    blueprint: &Blueprint,
    treatment: Option<&str>,
    answers_path: &Path,
    json_mode: bool,
) -> Result<(), SequencerError> {
    let path = validate_file_path(answers_path)?;
    validate_file_size(&path, MAX_ANSWERS_FILE_SIZE)?;
    let data = std::fs::read(&path)
        .map_err(|e| SequencerError::Io(format!("Read answers: {}", e)))?;
    let answers: Answers = serde_json::from_slice(&data)
        .map_err(|e| SequencerError::Serialization(format!("Parse answers: {}", e)))?;

    let treatment = treatment.unwrap_or_else(|| blueprint.default_treatment());
    let report = walk_session(blueprint, treatment, &answers)?;

    if json_mode {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).unwrap_or_default()
        );
        return Ok(());
    }

    println!("Walk complete under treatment {}", report.treatment);
    println!("Visited ({}):", report.history.len());
    for id in &report.history {
        println!("  {}", id);
    }
    println!("Skipped ({}):", report.skipped.len());
    for id in &report.skipped {
        println!("  {}", id);
    }
    println!("Records: {}", report.records.len());
    Ok(())
}

// =============================================================================
// RECORDS COMMAND
// =============================================================================

pub fn cmd_records(
    db_path: &Path,
    session: Option<&str>,
    json_mode: bool,
) -> Result<(), SequencerError> {
    let store = RedbRecordStore::open(db_path)?;
    let records = match session {
        Some(s) => store.records_for(s)?,
        None => store.records()?,
    };

    if json_mode {
        println!(
            "{}",
            serde_json::to_string_pretty(&records).unwrap_or_default()
        );
        return Ok(());
    }

    println!("Records in {:?}: {}", db_path, records.len());
    for record in &records {
        let fields = record
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "  {} [{}] {} r{}: {}",
            record.session, record.treatment, record.step, record.revision, fields
        );
    }
    Ok(())
}
