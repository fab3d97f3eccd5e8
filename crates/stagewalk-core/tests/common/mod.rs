//! Shared fixtures: a condensed donation survey with the same gating shape
//! as the bundled one.

#![allow(dead_code)]

use stagewalk_core::{
    Condition, ContentRef, DoneButton, FieldKind, FieldSpec, FieldValue, SequenceBuilder,
    SequenceDefinition, Sequencer, StepDescriptor, StepId, StepStore, TreatmentPlan,
};

pub const GATE_STEP: &str = "inPrincipleWTP";
pub const GATE_FIELD: &str = "inPrincipleWTP-1";

const SEVEN_POINTS: &[&str] = &[
    "(1) Definitely not willing to pay",
    "(2)",
    "(3)",
    "(4)",
    "(5)",
    "(6)",
    "(7) Definitely willing to pay",
];

fn declined() -> Condition {
    Condition::equals(GATE_STEP, GATE_FIELD, "No")
}

pub fn survey_store() -> StepStore {
    let mut store = StepStore::new();
    let steps = vec![
        StepDescriptor::new("consent")
            .content(ContentRef::widget("Consent"))
            .done_button(DoneButton::Hidden)
            .allow_back(false),
        StepDescriptor::new("instructions").allow_back(false),
        StepDescriptor::new("demographics")
            .content(ContentRef::widget("ChoiceManager"))
            .required_by_default(true)
            .field(FieldSpec::choice("gender", &["Male", "Female", "Other"]))
            .field(FieldSpec::numeric("age", Some(18), Some(100))),
        StepDescriptor::new("trust")
            .content(ContentRef::widget("ChoiceManager"))
            .required_by_default(true)
            .field(FieldSpec::scale("trust-1", SEVEN_POINTS)),
        StepDescriptor::new("treatment")
            .content(ContentRef::widget("ChoiceManager"))
            .allow_back(false)
            .done_button(DoneButton::from_delay(0))
            .field(FieldSpec::choice("treatment-1", &["Yes", "No"]).with_correct(1)),
        StepDescriptor::new(GATE_STEP)
            .content(ContentRef::widget("ChoiceManager"))
            .allow_back(false)
            .required_by_default(true)
            .field(FieldSpec::choice(GATE_FIELD, &["Yes", "No"])),
        StepDescriptor::new("theoreticalWTP")
            .content(ContentRef::widget("ChoiceManager"))
            .required_by_default(true)
            .field(FieldSpec::numeric("theoreticalWTP-1", Some(1), None))
            .skip_if(declined()),
        StepDescriptor::new("betterplace")
            .allow_back(false)
            .skip_if(declined()),
        StepDescriptor::new("end")
            .content(ContentRef::widget("EndScreen"))
            .terminal(),
    ];
    for step in steps {
        store.register(step).expect("register");
    }
    store
}

pub fn survey(treatment: &str) -> SequenceDefinition {
    SequenceBuilder::new()
        .stage("consent")
        .stage("instructions")
        .stage("demographics")
        .stage("trust")
        .stage("treatment")
        .stage(GATE_STEP)
        .stage("theoreticalWTP")
        .stage("betterplace")
        .stage("end")
        .treatment_plan(
            TreatmentPlan::new()
                .skip_when(&["TWTP"], &["betterplace"])
                .skip_unless(&["TWTP"], &["theoreticalWTP"]),
        )
        .build(&survey_store(), treatment)
        .expect("build")
}

pub fn started(treatment: &str) -> Sequencer {
    let mut seq = Sequencer::passive("participant-1", survey(treatment)).expect("sequencer");
    seq.start().expect("start");
    seq
}

/// A value that satisfies `spec`.
pub fn valid_answer(spec: &FieldSpec) -> FieldValue {
    match &spec.kind {
        FieldKind::Choice { choices, .. } => FieldValue::Choice(choices[0].clone()),
        FieldKind::Numeric { min, max } => FieldValue::Integer(min.or(*max).unwrap_or(1)),
        FieldKind::Scale { labels } => FieldValue::Choice(labels[0].clone()),
        FieldKind::Text { .. } => FieldValue::Text("ok".into()),
    }
}

/// Fill every field of the active step, answering the gate with `gate`.
pub fn answer_active(seq: &mut Sequencer, gate: &str) {
    let view = seq.current_step().expect("active step");
    for spec in &view.fields {
        let value = if spec.id.as_str() == GATE_FIELD {
            FieldValue::Choice(gate.into())
        } else {
            valid_answer(spec)
        };
        seq.set_value(spec.id.clone(), value).expect("set value");
    }
}

/// Answer and advance until the session ends.
pub fn walk_to_end(seq: &mut Sequencer, gate: &str) {
    while !seq.is_game_over() {
        answer_active(seq, gate);
        seq.advance().expect("advance");
    }
}

pub fn ids(list: &[&str]) -> Vec<StepId> {
    list.iter().map(|s| StepId::new(*s)).collect()
}
