//! Tests for sequence file loading, treatment plans, and scripted walks.

// Allow unwrap and panic in tests - these are standard for test code
#![allow(clippy::unwrap_used, clippy::panic)]

use serde_json::json;
use stagewalk::cli::{Answers, PlannedStep, plan_for, walk_session};
use stagewalk::config::{Blueprint, parse_sequence};
use stagewalk::hooks::builtin_hooks;
use stagewalk::api::json_to_value;
use stagewalk_core::{
    DoneButton, FieldId, FieldKind, FieldMap, HookRegistry, NullSink, Sequencer, SequencerError,
    StepId,
};
use std::io::Write;
use std::sync::Arc;

const MINI: &str = r#"
[sequence]
name = "mini"
default_treatment = "A"

[[stages]]
id = "intro"

[[stages]]
id = "ask"
[[stages.steps]]
id = "ask"
widget = "ChoiceManager"
required = true
fields = [{ id = "q", kind = "choice", choices = ["Yes", "No"] }]

[[stages]]
id = "bonus"
skip_if = { treatment = "B" }

[[stages]]
id = "followUp"
[[stages.steps]]
id = "followUp"
skip_if = { step = "ask", field = "q", equals = "No" }

[[stages]]
id = "end"
[[stages.steps]]
id = "end"
terminal = true
"#;

fn mini() -> Blueprint {
    Blueprint::from_toml(MINI, &builtin_hooks().unwrap()).unwrap()
}

fn step(id: &str) -> StepId {
    StepId::new(id)
}

fn answers(value: serde_json::Value) -> Answers {
    serde_json::from_value(value).unwrap()
}

// =============================================================================
// BUNDLED SURVEY
// =============================================================================

#[test]
fn test_bundled_sequence_loads() {
    let blueprint = Blueprint::bundled().unwrap();

    assert_eq!(blueprint.name(), "warm-glow");
    assert_eq!(blueprint.default_treatment(), "A");
    assert_eq!(blueprint.store().len(), 19);
    assert_eq!(blueprint.treatments(), vec!["A", "B", "TWTP"]);
}

#[test]
fn test_bundled_treatment_skips() {
    let blueprint = Blueprint::bundled().unwrap();

    let twtp = blueprint.definition("TWTP").unwrap();
    assert!(twtp.is_statically_skipped(&step("betterplace")));
    assert!(!twtp.is_statically_skipped(&step("theoreticalWTP")));

    for treatment in ["A", "B"] {
        let definition = blueprint.definition(treatment).unwrap();
        assert!(definition.is_statically_skipped(&step("theoreticalWTP")));
        assert!(!definition.is_statically_skipped(&step("betterplace")));
    }
}

#[test]
fn test_bundled_step_settings() {
    let blueprint = Blueprint::bundled().unwrap();
    let definition = blueprint.definition("A").unwrap();

    let consent = definition.descriptor(&step("consent")).unwrap();
    assert_eq!(consent.done_button, DoneButton::Hidden);
    assert!(!consent.navigation.allow_back);

    let treatment = definition.descriptor(&step("treatment")).unwrap();
    assert_eq!(treatment.done_button, DoneButton::Immediate);
    assert!(!treatment.required_by_default);

    let end = definition.descriptor(&step("end")).unwrap();
    assert!(end.terminal);
    assert!(end.enter_once);

    let demographics = definition.descriptor(&step("demographics")).unwrap();
    assert_eq!(demographics.fields.len(), 5);

    let trust = definition.descriptor(&step("trust")).unwrap();
    match &trust.fields[0].kind {
        FieldKind::Scale { labels } => assert_eq!(labels.len(), 7),
        other => panic!("expected scale, got {:?}", other),
    }
}

#[test]
fn test_unknown_treatment_rejected() {
    let blueprint = Blueprint::bundled().unwrap();
    assert!(matches!(
        blueprint.definition("Z"),
        Err(SequencerError::InvalidDefinition(_))
    ));
}

#[test]
fn test_bundled_plan_for_default_treatment() {
    let blueprint = Blueprint::bundled().unwrap();
    let report = plan_for(&blueprint, "A").unwrap();

    let planned = |id: &str| {
        report
            .steps
            .iter()
            .find(|(s, _)| s.as_str() == id)
            .map(|(_, p)| *p)
            .unwrap()
    };
    assert_eq!(report.steps.len(), 19);
    assert_eq!(planned("consent"), PlannedStep::Shown);
    assert_eq!(planned("theoreticalWTP"), PlannedStep::Skipped);
    assert_eq!(planned("betterplace"), PlannedStep::Conditional);
}

#[test]
fn test_bundled_walk_unwilling() {
    let blueprint = Blueprint::bundled().unwrap();
    let script = answers(json!({
        "demographics": {
            "gender": "Male", "age": 51, "education": "High-School",
            "employment": "Employed", "income": "120"
        },
        "dilemmaConcernMatrix": { "dC-1": 1, "dC-2": 2, "dC-3": 3, "dC-4": 4 },
        "trust": { "trust-1": 2 },
        "subjectiveNorm": { "subjectiveNorm-1": 4 },
        "perceivedBehavioralControl": {
            "perceivedBehavioralControl-1": 1, "perceivedBehavioralControl-2": 7
        },
        "awarenessOfNeedForPaying": {
            "awarenessOfNeedForPaying-1": 1, "awarenessOfNeedForPaying-2": 1
        },
        "awarenessOfResponsibilityForPaying": { "awarenessOfResponsibilityForPaying-1": 2 },
        "environmentalConcernMatrix": {
            "eC-1": 1, "eC-2": 1, "eC-3": 1, "eC-4": 1, "eC-5": 1,
            "eC-6": 1, "eC-7": 1, "eC-8": 1, "eC-9": 1
        },
        "generalWarmGlowMatrix": { "gWG-1": 1, "gWG-2": 1, "gWG-3": 1 },
        "subjectiveObligationToPay": { "subjectiveObligationToPay-1": 1 },
        "treatment": { "treatment-1": "Yes" },
        "inPrincipleWTP": { "inPrincipleWTP-1": "No" }
    }));

    let report = walk_session(&blueprint, "A", &script).unwrap();

    assert_eq!(report.skipped, vec![step("theoreticalWTP"), step("betterplace")]);
    assert_eq!(report.history.len(), 17);
    assert_eq!(report.records.len(), 17);

    let treatment = report
        .records
        .iter()
        .find(|r| r.step.as_str() == "treatment")
        .unwrap();
    assert_eq!(treatment.correct.get(&FieldId::new("treatment-1")), Some(&false));
    assert_eq!(treatment.correct.get(&FieldId::new("treatment-2")), Some(&false));

    let end = report.records.last().unwrap();
    assert_eq!(end.step.as_str(), "end");
    assert!(end.auto_finished);
}

#[test]
fn test_bundled_walk_stops_on_invalid_answer() {
    let blueprint = Blueprint::bundled().unwrap();
    let script = answers(json!({
        "demographics": { "gender": "Male", "age": 9 }
    }));

    let err = walk_session(&blueprint, "B", &script).unwrap_err();
    match err {
        SequencerError::Validation { step, failures } => {
            assert_eq!(step.as_str(), "demographics");
            assert!(failures.contains(&FieldId::new("age")));
            assert!(failures.contains(&FieldId::new("income")));
        }
        other => panic!("expected validation error, got {:?}", other),
    }
}

fn willing_answers() -> Answers {
    answers(json!({
        "demographics": {
            "gender": "Other", "age": 40, "education": "College",
            "employment": "Retired", "income": "30"
        },
        "dilemmaConcernMatrix": { "dC-1": 3, "dC-2": 3, "dC-3": 3, "dC-4": 3 },
        "trust": { "trust-1": 6 },
        "subjectiveNorm": { "subjectiveNorm-1": 5 },
        "perceivedBehavioralControl": {
            "perceivedBehavioralControl-1": 4, "perceivedBehavioralControl-2": 4
        },
        "awarenessOfNeedForPaying": {
            "awarenessOfNeedForPaying-1": 4, "awarenessOfNeedForPaying-2": 4
        },
        "awarenessOfResponsibilityForPaying": { "awarenessOfResponsibilityForPaying-1": 4 },
        "environmentalConcernMatrix": {
            "eC-1": 4, "eC-2": 4, "eC-3": 4, "eC-4": 4, "eC-5": 4,
            "eC-6": 4, "eC-7": 4, "eC-8": 4, "eC-9": 4
        },
        "generalWarmGlowMatrix": { "gWG-1": 4, "gWG-2": 4, "gWG-3": 4 },
        "subjectiveObligationToPay": { "subjectiveObligationToPay-1": 4 },
        "treatment": { "treatment-1": "No", "treatment-2": "Insufficient" },
        "inPrincipleWTP": { "inPrincipleWTP-1": "Yes" },
        "theoreticalWTP": { "theoreticalWTP-1": 30 }
    }))
}

/// Answer and advance a bundled session until `stop` is the active step.
fn walk_to(blueprint: &Blueprint, treatment: &str, stop: &str) -> Sequencer {
    let script = willing_answers();
    let mut seq = blueprint
        .sequencer("back-matrix", treatment, Arc::new(NullSink))
        .unwrap();
    seq.start().unwrap();

    loop {
        let view = seq.current_step().unwrap();
        if view.step.as_str() == stop {
            return seq;
        }
        if let Some(given) = script.get(view.step.as_str()) {
            let mut values = FieldMap::new();
            for (field, raw) in given {
                let spec = view.fields.iter().find(|f| f.id.as_str() == field);
                values.insert(FieldId::new(field.as_str()), json_to_value(spec, raw).unwrap());
            }
            seq.set_values(values).unwrap();
        }
        seq.advance().unwrap();
    }
}

#[test]
fn test_bundled_back_matrix() {
    let blueprint = Blueprint::bundled().unwrap();

    let cases = [
        ("A", "instructions", None),
        ("A", "questionInformation-1", Some("instructions")),
        ("A", "demographics", Some("questionInformation-1")),
        ("A", "subjectiveObligationToPay", Some("generalWarmGlowMatrix")),
        ("A", "treatment", None),
        ("A", "inPrincipleWTP", None),
        ("A", "betterplace", None),
        ("TWTP", "theoreticalWTP", Some("inPrincipleWTP")),
    ];

    for (treatment, at, expected) in cases {
        let mut seq = walk_to(&blueprint, treatment, at);
        assert_eq!(
            seq.can_go_back(),
            expected.is_some(),
            "{treatment}/{at} back availability"
        );
        match expected {
            Some(target) => {
                let view = seq.go_back().unwrap().unwrap();
                assert_eq!(view.step.as_str(), target, "{treatment}/{at} back target");
            }
            None => assert!(matches!(
                seq.go_back(),
                Err(SequencerError::BackNotAllowed(_))
            )),
        }
    }
}

// =============================================================================
// SMALL SEQUENCES
// =============================================================================

#[test]
fn test_stage_without_steps_holds_one_step() {
    let blueprint = mini();
    let definition = blueprint.definition("A").unwrap();

    assert_eq!(definition.step_count(), 5);
    assert!(definition.descriptor(&step("intro")).is_some());
    assert!(definition.descriptor(&step("bonus")).is_some());
}

#[test]
fn test_stage_condition_on_treatment() {
    let blueprint = mini();
    let script = answers(json!({ "ask": { "q": "Yes" } }));

    let a = walk_session(&blueprint, "A", &script).unwrap();
    assert!(a.history.contains(&step("bonus")));
    assert!(a.skipped.is_empty());

    let b = walk_session(&blueprint, "B", &script).unwrap();
    assert_eq!(b.skipped, vec![step("bonus")]);

    let plan = plan_for(&blueprint, "A").unwrap();
    assert!(plan.steps.contains(&(step("bonus"), PlannedStep::Conditional)));
    assert!(plan.steps.contains(&(step("followUp"), PlannedStep::Conditional)));
    assert!(plan.steps.contains(&(step("intro"), PlannedStep::Shown)));
}

#[test]
fn test_answer_condition_skips_follow_up() {
    let blueprint = mini();
    let script = answers(json!({ "ask": { "q": "No" } }));

    let report = walk_session(&blueprint, "A", &script).unwrap();
    assert_eq!(report.skipped, vec![step("followUp")]);
    assert_eq!(
        report.history,
        vec![step("intro"), step("ask"), step("bonus"), step("end")]
    );
}

#[test]
fn test_without_known_treatments_any_treatment_runs() {
    let blueprint = mini();
    assert!(blueprint.definition("anything").is_ok());
    assert_eq!(blueprint.treatments(), vec!["A"]);
}

#[test]
fn test_unknown_widget_rejected() {
    let text = MINI.replace("ChoiceManager", "Slider");
    let err = Blueprint::from_toml(&text, &builtin_hooks().unwrap()).unwrap_err();
    assert!(matches!(err, SequencerError::UnknownRenderer { .. }));
}

#[test]
fn test_unknown_hook_rejected() {
    let text = MINI.replace("terminal = true", "terminal = true\nhooks = \"announce-end\"");
    assert!(Blueprint::from_toml(&text, &builtin_hooks().unwrap()).is_ok());

    let err = Blueprint::from_toml(&text, &HookRegistry::new()).unwrap_err();
    assert!(matches!(err, SequencerError::UnknownHook { .. }));
}

#[test]
fn test_unknown_scale_rejected() {
    let text = r#"
[sequence]
name = "scales"
default_treatment = "A"

[[stages]]
id = "rate"
[[stages.steps]]
id = "rate"
fields = [{ id = "r", kind = "scale", scale = "missing" }]
"#;
    let err = Blueprint::from_toml(text, &builtin_hooks().unwrap()).unwrap_err();
    assert!(matches!(err, SequencerError::InvalidDefinition(_)));
}

#[test]
fn test_skip_rule_for_unknown_step_rejected() {
    let text = MINI.replace(
        "[[stages]]\nid = \"intro\"",
        "[[treatments]]\nskip = [\"ghost\"]\nwhen = [\"B\"]\n\n[[stages]]\nid = \"intro\"",
    );
    assert!(Blueprint::from_toml(&text, &builtin_hooks().unwrap()).is_err());
}

#[test]
fn test_delay_forms() {
    let text = MINI.replace(
        "terminal = true",
        "terminal = true\ndone_button = { delay = 1500 }",
    );
    let blueprint = Blueprint::from_toml(&text, &builtin_hooks().unwrap()).unwrap();
    let definition = blueprint.definition("A").unwrap();
    assert_eq!(
        definition.descriptor(&step("end")).unwrap().done_button,
        DoneButton::Delayed { millis: 1500 }
    );
}

#[test]
fn test_invalid_toml_rejected() {
    assert!(matches!(
        parse_sequence("[sequence\nname ="),
        Err(SequencerError::InvalidDefinition(_))
    ));
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(MINI.as_bytes()).unwrap();

    let blueprint = Blueprint::load(file.path()).unwrap();
    assert_eq!(blueprint.name(), "mini");
}
