//! # Sequence Files
//!
//! Loads a survey definition from TOML and turns it into the core's
//! [`StepStore`] plus one [`SequenceDefinition`] per treatment.
//!
//! ```toml
//! [sequence]
//! name = "warm-glow"
//! default_treatment = "A"
//!
//! [defaults]
//! allow_back = true
//!
//! [[treatments]]
//! skip = ["betterplace"]
//! when = ["TWTP"]
//!
//! [[stages]]
//! id = "consent"
//! [[stages.steps]]
//! id = "consent"
//! widget = "Consent"
//! done_button = false
//! ```
//!
//! Every parse or build failure is reported as a configuration error
//! (`SequencerError::InvalidDefinition` and friends) before any session
//! starts.

use crate::hooks::builtin_hooks;
use serde::{Deserialize, Serialize};
use stagewalk_core::{
    Condition, ContentRef, DoneButton, FieldKind, FieldSpec, HookRegistry, RecordSink,
    RendererRegistry, SequenceBuilder, SequenceDefinition, Sequencer, SequencerError,
    SessionSnapshot, StepDescriptor, StepStore, TreatmentMatch, TreatmentPlan, TreatmentRule,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

/// The survey shipped with the binary.
pub const BUNDLED_SEQUENCE: &str = include_str!("../sequences/warm-glow.toml");

/// Maximum size of a sequence file (1 MB).
pub const MAX_SEQUENCE_FILE_SIZE: u64 = 1024 * 1024;

/// Widgets the browser client knows how to draw.
///
/// The server never draws anything itself; every known widget is backed by
/// a passive renderer that holds submitted values.
pub const KNOWN_WIDGETS: &[&str] = &[
    "ChoiceManager",
    "ChoiceTableGroup",
    "Consent",
    "ContentBox",
    "CustomInput",
    "EndScreen",
    "dC",
    "eC",
    "gWG",
];

// =============================================================================
// FILE FORMAT
// =============================================================================

/// Top-level layout of a sequence file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceFile {
    pub sequence: SequenceMeta,
    #[serde(default)]
    pub defaults: StepDefaults,
    /// Named label sets that scale fields can refer to.
    #[serde(default)]
    pub scales: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub treatments: Vec<TreatmentConfig>,
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceMeta {
    pub name: String,
    pub default_treatment: String,
    /// Treatments sessions may run under. Empty means any.
    #[serde(default)]
    pub known_treatments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepDefaults {
    pub allow_back: bool,
    pub back_across_stages: bool,
    pub required: bool,
    pub done_button: DoneButtonConfig,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            allow_back: true,
            back_across_stages: true,
            required: false,
            done_button: DoneButtonConfig::Enabled(true),
        }
    }
}

/// `true`/`false`, or a delay in milliseconds given as an integer or a
/// numeric string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DoneButtonConfig {
    Enabled(bool),
    Delayed { delay: DelayValue },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DelayValue {
    Millis(i64),
    Text(String),
}

impl DoneButtonConfig {
    pub fn to_done_button(&self) -> Result<DoneButton, SequencerError> {
        match self {
            DoneButtonConfig::Enabled(true) => Ok(DoneButton::Immediate),
            DoneButtonConfig::Enabled(false) => Ok(DoneButton::Hidden),
            DoneButtonConfig::Delayed { delay } => {
                let millis = match delay {
                    DelayValue::Millis(ms) => *ms,
                    DelayValue::Text(s) => s.trim().parse().map_err(|_| {
                        SequencerError::InvalidDefinition(format!(
                            "done button delay '{}' is not a number",
                            s
                        ))
                    })?,
                };
                Ok(DoneButton::from_delay(millis))
            }
        }
    }
}

/// A static skip rule. Exactly one of `when` and `unless` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreatmentConfig {
    pub skip: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unless: Option<Vec<String>>,
}

impl TreatmentConfig {
    fn to_rule(&self) -> Result<TreatmentRule, SequencerError> {
        let matches = match (&self.when, &self.unless) {
            (Some(when), None) => TreatmentMatch::When(when.iter().cloned().collect()),
            (None, Some(unless)) => TreatmentMatch::Unless(unless.iter().cloned().collect()),
            _ => {
                return Err(SequencerError::InvalidDefinition(format!(
                    "treatment rule skipping {:?} needs exactly one of 'when' and 'unless'",
                    self.skip
                )));
            }
        };
        Ok(TreatmentRule {
            skip: self.skip.clone(),
            matches,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if: Option<ConditionConfig>,
    /// A stage without steps holds one default step named after the stage.
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    pub id: String,
    pub name: Option<String>,
    pub widget: Option<String>,
    pub frame: Option<String>,
    pub options: Option<String>,
    pub allow_back: Option<bool>,
    pub back_across_stages: Option<bool>,
    pub done_button: Option<DoneButtonConfig>,
    pub required: Option<bool>,
    pub terminal: bool,
    pub enter_once: bool,
    pub hooks: Option<String>,
    pub skip_if: Option<ConditionConfig>,
    pub fields: Vec<FieldConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKindName {
    Choice,
    Numeric,
    Scale,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConfig {
    pub id: String,
    pub kind: FieldKindName,
    #[serde(default)]
    pub choices: Vec<String>,
    #[serde(default)]
    pub correct: Option<usize>,
    #[serde(default)]
    pub min: Option<i64>,
    #[serde(default)]
    pub max: Option<i64>,
    /// Inline scale labels.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Name of a label set under `[scales]`.
    #[serde(default)]
    pub scale: Option<String>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub required: Option<bool>,
}

impl FieldConfig {
    fn to_spec(
        &self,
        scales: &BTreeMap<String, Vec<String>>,
    ) -> Result<FieldSpec, SequencerError> {
        let kind = match self.kind {
            FieldKindName::Choice => FieldKind::Choice {
                choices: self.choices.clone(),
                correct: self.correct,
            },
            FieldKindName::Numeric => FieldKind::Numeric {
                min: self.min,
                max: self.max,
            },
            FieldKindName::Scale => {
                let labels = match &self.scale {
                    Some(name) => scales.get(name).cloned().ok_or_else(|| {
                        SequencerError::InvalidDefinition(format!(
                            "field {} refers to unknown scale '{}'",
                            self.id, name
                        ))
                    })?,
                    None => self.labels.clone(),
                };
                FieldKind::Scale { labels }
            }
            FieldKindName::Text => FieldKind::Text {
                max_length: self.max_length,
            },
        };
        let spec = FieldSpec::new(self.id.as_str(), kind);
        Ok(match self.required {
            Some(required) => spec.required(required),
            None => spec,
        })
    }
}

/// A skip condition. Exactly one form per table:
///
/// - `{ step, field, equals }`
/// - `{ step, field, not_equals }`
/// - `{ step, field, answered = true }`
/// - `{ treatment }`
/// - `{ any = [..] }`, `{ all = [..] }`, `{ not = {..} }`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionConfig {
    pub step: Option<String>,
    pub field: Option<String>,
    pub equals: Option<String>,
    pub not_equals: Option<String>,
    pub answered: Option<bool>,
    pub treatment: Option<String>,
    pub any: Option<Vec<ConditionConfig>>,
    pub all: Option<Vec<ConditionConfig>>,
    pub not: Option<Box<ConditionConfig>>,
}

impl ConditionConfig {
    pub fn to_condition(&self) -> Result<Condition, SequencerError> {
        let forms = [
            self.equals.is_some(),
            self.not_equals.is_some(),
            self.answered.is_some(),
            self.treatment.is_some(),
            self.any.is_some(),
            self.all.is_some(),
            self.not.is_some(),
        ];
        if forms.iter().filter(|f| **f).count() != 1 {
            return Err(SequencerError::InvalidDefinition(format!(
                "condition must have exactly one form: {:?}",
                self
            )));
        }

        if let Some(value) = &self.equals {
            let (step, field) = self.target()?;
            return Ok(Condition::Equals {
                step: step.into(),
                field: field.into(),
                value: value.clone(),
            });
        }
        if let Some(value) = &self.not_equals {
            let (step, field) = self.target()?;
            return Ok(Condition::NotEquals {
                step: step.into(),
                field: field.into(),
                value: value.clone(),
            });
        }
        if let Some(answered) = self.answered {
            let (step, field) = self.target()?;
            let condition = Condition::Answered {
                step: step.into(),
                field: field.into(),
            };
            return Ok(if answered {
                condition
            } else {
                Condition::Not(Box::new(condition))
            });
        }
        if let Some(treatment) = &self.treatment {
            return Ok(Condition::Treatment(treatment.clone()));
        }
        if let Some(any) = &self.any {
            return Ok(Condition::Any(
                any.iter()
                    .map(ConditionConfig::to_condition)
                    .collect::<Result<_, _>>()?,
            ));
        }
        if let Some(all) = &self.all {
            return Ok(Condition::All(
                all.iter()
                    .map(ConditionConfig::to_condition)
                    .collect::<Result<_, _>>()?,
            ));
        }
        match &self.not {
            Some(inner) => Ok(Condition::Not(Box::new(inner.to_condition()?))),
            None => Err(SequencerError::InvalidDefinition(
                "empty condition".to_string(),
            )),
        }
    }

    fn target(&self) -> Result<(&str, &str), SequencerError> {
        match (&self.step, &self.field) {
            (Some(step), Some(field)) => Ok((step, field)),
            _ => Err(SequencerError::InvalidDefinition(format!(
                "condition needs both 'step' and 'field': {:?}",
                self
            ))),
        }
    }
}

/// Parse a sequence file from TOML text.
pub fn parse_sequence(text: &str) -> Result<SequenceFile, SequencerError> {
    toml::from_str(text)
        .map_err(|e| SequencerError::InvalidDefinition(format!("sequence file: {}", e)))
}

// =============================================================================
// BLUEPRINT
// =============================================================================

/// A validated sequence file, ready to produce sessions.
///
/// Step descriptors are resolved once; each session gets its own
/// definition (skip flags depend on the treatment) and its own renderers.
#[derive(Debug, Clone)]
pub struct Blueprint {
    file: SequenceFile,
    store: StepStore,
    plan: TreatmentPlan,
}

impl Blueprint {
    /// The bundled warm-glow survey with the built-in hooks.
    pub fn bundled() -> Result<Self, SequencerError> {
        Self::from_toml(BUNDLED_SEQUENCE, &builtin_hooks()?)
    }

    /// Read and validate a sequence file with the built-in hooks.
    pub fn load(path: &Path) -> Result<Self, SequencerError> {
        let metadata = std::fs::metadata(path)
            .map_err(|e| SequencerError::Io(format!("Cannot read {}: {}", path.display(), e)))?;
        if metadata.len() > MAX_SEQUENCE_FILE_SIZE {
            return Err(SequencerError::LimitExceeded(format!(
                "sequence file is {} bytes (maximum {})",
                metadata.len(),
                MAX_SEQUENCE_FILE_SIZE
            )));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| SequencerError::Io(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&text, &builtin_hooks()?)
    }

    pub fn from_toml(text: &str, hooks: &HookRegistry) -> Result<Self, SequencerError> {
        Self::from_file(parse_sequence(text)?, hooks)
    }

    /// Resolve every step, hook, and rule in `file`.
    ///
    /// Each treatment listed in the file is built once so that unknown
    /// ids in skip rules are caught here rather than at session start.
    pub fn from_file(file: SequenceFile, hooks: &HookRegistry) -> Result<Self, SequencerError> {
        let mut store = StepStore::new();
        for stage in &file.stages {
            if stage.steps.is_empty() {
                let implicit = StepConfig {
                    id: stage.id.clone(),
                    ..StepConfig::default()
                };
                store.register(build_step(&implicit, &file, hooks)?)?;
            }
            for step in &stage.steps {
                store.register(build_step(step, &file, hooks)?)?;
            }
        }

        let mut plan = TreatmentPlan::new();
        for rule in &file.treatments {
            plan.push(rule.to_rule()?);
        }

        let blueprint = Self { file, store, plan };
        for treatment in blueprint.treatments() {
            let definition = blueprint.definition(&treatment)?;
            blueprint.renderers().check(&definition)?;
        }
        tracing::debug!(
            sequence = %blueprint.file.sequence.name,
            steps = blueprint.store.len(),
            "sequence file loaded"
        );
        Ok(blueprint)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.file.sequence.name
    }

    #[must_use]
    pub fn default_treatment(&self) -> &str {
        &self.file.sequence.default_treatment
    }

    /// Treatments worth reporting: the declared ones plus every tag a skip
    /// rule mentions, plus the default.
    #[must_use]
    pub fn treatments(&self) -> Vec<String> {
        let mut all: BTreeSet<String> =
            self.file.sequence.known_treatments.iter().cloned().collect();
        all.insert(self.file.sequence.default_treatment.clone());
        for rule in self.plan.rules() {
            match &rule.matches {
                TreatmentMatch::When(set) | TreatmentMatch::Unless(set) => {
                    all.extend(set.iter().cloned());
                }
            }
        }
        all.into_iter().collect()
    }

    #[must_use]
    pub fn file(&self) -> &SequenceFile {
        &self.file
    }

    #[must_use]
    pub fn store(&self) -> &StepStore {
        &self.store
    }

    #[must_use]
    pub fn plan(&self) -> &TreatmentPlan {
        &self.plan
    }

    /// The sequence as seen by a session under `treatment`.
    pub fn definition(&self, treatment: &str) -> Result<SequenceDefinition, SequencerError> {
        let known = &self.file.sequence.known_treatments;
        if !known.is_empty() && !known.iter().any(|t| t == treatment) {
            return Err(SequencerError::InvalidDefinition(format!(
                "unknown treatment '{}' (known: {})",
                treatment,
                known.join(", ")
            )));
        }

        let mut builder = SequenceBuilder::new();
        for stage in &self.file.stages {
            builder = builder.stage(stage.id.as_str());
            for step in &stage.steps {
                builder = builder.step(step.id.as_str());
            }
            if let Some(condition) = &stage.skip_if {
                builder = builder.stage_skip_if(condition.to_condition()?);
            }
        }
        builder
            .treatment_plan(self.plan.clone())
            .build(&self.store, treatment)
    }

    /// A fresh set of passive renderers for one session.
    #[must_use]
    pub fn renderers(&self) -> RendererRegistry {
        RendererRegistry::passive(KNOWN_WIDGETS)
    }

    /// A new, not yet started session.
    pub fn sequencer(
        &self,
        session: &str,
        treatment: &str,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Sequencer, SequencerError> {
        Sequencer::new(session, self.definition(treatment)?, self.renderers(), sink)
    }

    /// Rebuild a session from a snapshot.
    pub fn restore(
        &self,
        snapshot: SessionSnapshot,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Sequencer, SequencerError> {
        let definition = self.definition(&snapshot.treatment)?;
        Sequencer::restore(definition, snapshot, self.renderers(), sink)
    }
}

fn build_step(
    step: &StepConfig,
    file: &SequenceFile,
    hooks: &HookRegistry,
) -> Result<StepDescriptor, SequencerError> {
    let defaults = &file.defaults;
    let done_button = step
        .done_button
        .as_ref()
        .unwrap_or(&defaults.done_button)
        .to_done_button()?;

    let mut descriptor = StepDescriptor::new(step.id.as_str())
        .allow_back(step.allow_back.unwrap_or(defaults.allow_back))
        .back_across_stages(step.back_across_stages.unwrap_or(defaults.back_across_stages))
        .required_by_default(step.required.unwrap_or(defaults.required))
        .done_button(done_button)
        .content(ContentRef {
            widget: step.widget.clone(),
            frame: step.frame.clone(),
            options: step.options.clone().unwrap_or_default(),
        })
        .enter_once(step.enter_once);

    if let Some(name) = &step.name {
        descriptor = descriptor.named(name.as_str());
    }
    if step.terminal {
        descriptor = descriptor.terminal();
    }
    for field in &step.fields {
        descriptor = descriptor.field(field.to_spec(&file.scales)?);
    }
    if let Some(condition) = &step.skip_if {
        descriptor = descriptor.skip_if(condition.to_condition()?);
    }
    if let Some(name) = &step.hooks {
        let resolved = hooks.resolve(&descriptor.id, name)?;
        descriptor = descriptor.hooks(resolved);
    }
    Ok(descriptor)
}

// =============================================================================
// TESTS
// =============================================================================
