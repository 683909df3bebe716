//! Pipeline assembly and cycle tests
//!
//! Builds execution graphs from declarative definitions and drives whole
//! cycles through them, including the structural validation paths.

use execflow::plugin::mock::{CountingFilter, FieldEquals, RecordingOutput};
use execflow::{
    batch_from_payloads, build_execution_graph, BuildError, Dataset, PipelineDef, PluginRegistry,
    StageDef, StageInput, StageKind,
};
use serde_json::json;
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn filter_stage(id: &str, plugin: &str, inputs: Vec<StageInput>) -> StageDef {
    StageDef {
        id: id.to_string(),
        kind: StageKind::Filter {
            plugin: plugin.to_string(),
        },
        inputs,
    }
}

fn split_stage(id: &str, condition: &str, inputs: Vec<StageInput>) -> StageDef {
    StageDef {
        id: id.to_string(),
        kind: StageKind::Split {
            condition: condition.to_string(),
        },
        inputs,
    }
}

fn output_stage(id: &str, plugin: &str, inputs: Vec<StageInput>) -> StageDef {
    StageDef {
        id: id.to_string(),
        kind: StageKind::Output {
            plugin: plugin.to_string(),
        },
        inputs,
    }
}

fn stage(id: &str) -> StageInput {
    StageInput::Stage(id.to_string())
}

#[test]
fn two_output_pipeline_drives_both_sinks_each_cycle() {
    init_tracing();
    let filter = Arc::new(CountingFilter::new());
    let sink_a = Arc::new(RecordingOutput::new());
    let sink_b = Arc::new(RecordingOutput::new());
    let mut plugins = PluginRegistry::new();
    plugins.register_filter("noop", filter.clone());
    plugins.register_output("a", sink_a.clone());
    plugins.register_output("b", sink_b.clone());

    let def = PipelineDef {
        id: "two_sinks".to_string(),
        stages: vec![
            filter_stage("keep", "noop", vec![StageInput::Batch]),
            output_stage("out_a", "a", vec![stage("keep")]),
            output_stage("out_b", "b", vec![stage("keep")]),
        ],
    };
    let graph = build_execution_graph(&def, &plugins).expect("build");

    let batch = batch_from_payloads(vec![json!({"n": 1}), json!({"n": 2})]);
    graph.cycle(&batch, false, false).expect("cycle 1");
    assert_eq!(sink_a.receive_calls(), 1);
    assert_eq!(sink_b.receive_calls(), 1);
    assert_eq!(filter.process_calls(), 1);
    assert_eq!(
        sink_a.received()[0],
        vec![json!({"n": 1}), json!({"n": 2})]
    );

    let batch = batch_from_payloads(vec![json!({"n": 3})]);
    graph.cycle(&batch, false, false).expect("cycle 2");
    assert_eq!(sink_a.receive_calls(), 2);
    assert_eq!(sink_b.receive_calls(), 2);
    assert_eq!(filter.process_calls(), 2);
    assert_eq!(sink_b.received()[1], vec![json!({"n": 3})]);
}

#[test]
fn split_routes_both_branches_to_their_outputs() {
    init_tracing();
    let condition = Arc::new(FieldEquals::new("level", json!("error")));
    let errors = Arc::new(RecordingOutput::new());
    let rest = Arc::new(RecordingOutput::new());
    let mut plugins = PluginRegistry::new();
    plugins.register_condition("is_error", condition);
    plugins.register_output("errors", errors.clone());
    plugins.register_output("rest", rest.clone());

    let def = PipelineDef {
        id: "branching".to_string(),
        stages: vec![
            split_stage("by_level", "is_error", vec![StageInput::Batch]),
            output_stage("err_out", "errors", vec![stage("by_level")]),
            output_stage(
                "rest_out",
                "rest",
                vec![StageInput::Complement("by_level".to_string())],
            ),
        ],
    };
    let graph = build_execution_graph(&def, &plugins).expect("build");

    let batch = batch_from_payloads(vec![
        json!({"level": "error", "n": 1}),
        json!({"level": "info", "n": 2}),
    ]);
    graph.cycle(&batch, false, false).expect("cycle");
    assert_eq!(errors.received()[0], vec![json!({"level": "error", "n": 1})]);
    assert_eq!(rest.received()[0], vec![json!({"level": "info", "n": 2})]);
}

#[test]
fn sole_output_clears_upstreams_inline() {
    let filter = Arc::new(CountingFilter::new());
    let sink = Arc::new(RecordingOutput::new());
    let mut plugins = PluginRegistry::new();
    plugins.register_filter("noop", filter.clone());
    plugins.register_output("sink", sink.clone());

    let def = PipelineDef {
        id: "single".to_string(),
        stages: vec![
            filter_stage("keep", "noop", vec![StageInput::Batch]),
            output_stage("out", "sink", vec![stage("keep")]),
        ],
    };
    let graph = build_execution_graph(&def, &plugins).expect("build");
    let batch = batch_from_payloads(vec![json!({"n": 1})]);

    // the sole output clears its upstream inside compute, so two pulls run
    // the filter twice even without a driver-issued clear
    graph.terminal().compute(&batch, false, false).expect("pull 1");
    graph.terminal().compute(&batch, false, false).expect("pull 2");
    assert_eq!(filter.process_calls(), 2);
    assert_eq!(sink.receive_calls(), 2);
}

#[test]
fn dangling_and_forward_references_are_rejected() {
    let mut plugins = PluginRegistry::new();
    plugins.register_output("sink", Arc::new(RecordingOutput::new()));
    plugins.register_filter("noop", Arc::new(CountingFilter::new()));

    let def = PipelineDef {
        id: "dangling".to_string(),
        stages: vec![output_stage("out", "sink", vec![stage("missing")])],
    };
    assert!(matches!(
        build_execution_graph(&def, &plugins),
        Err(BuildError::DanglingReference { .. })
    ));

    // declaration order is binding: later stages cannot be referenced
    let def = PipelineDef {
        id: "forward".to_string(),
        stages: vec![
            output_stage("out", "sink", vec![stage("late")]),
            filter_stage("late", "noop", vec![StageInput::Batch]),
        ],
    };
    assert!(matches!(
        build_execution_graph(&def, &plugins),
        Err(BuildError::DanglingReference { .. })
    ));
}

#[test]
fn duplicate_stage_ids_are_rejected() {
    let mut plugins = PluginRegistry::new();
    plugins.register_filter("noop", Arc::new(CountingFilter::new()));
    plugins.register_output("sink", Arc::new(RecordingOutput::new()));

    let def = PipelineDef {
        id: "dup".to_string(),
        stages: vec![
            filter_stage("x", "noop", vec![StageInput::Batch]),
            filter_stage("x", "noop", vec![StageInput::Batch]),
            output_stage("out", "sink", vec![stage("x")]),
        ],
    };
    assert!(matches!(
        build_execution_graph(&def, &plugins),
        Err(BuildError::DuplicateStage(id)) if id == "x"
    ));
}

#[test]
fn complement_of_a_non_split_is_rejected() {
    let mut plugins = PluginRegistry::new();
    plugins.register_filter("noop", Arc::new(CountingFilter::new()));
    plugins.register_output("sink", Arc::new(RecordingOutput::new()));

    let def = PipelineDef {
        id: "notasplit".to_string(),
        stages: vec![
            filter_stage("keep", "noop", vec![StageInput::Batch]),
            output_stage(
                "out",
                "sink",
                vec![StageInput::Complement("keep".to_string())],
            ),
        ],
    };
    assert!(matches!(
        build_execution_graph(&def, &plugins),
        Err(BuildError::NotASplit { .. })
    ));
}

#[test]
fn pipelines_without_outputs_are_rejected() {
    let mut plugins = PluginRegistry::new();
    plugins.register_filter("noop", Arc::new(CountingFilter::new()));

    let def = PipelineDef {
        id: "no_out".to_string(),
        stages: vec![filter_stage("keep", "noop", vec![StageInput::Batch])],
    };
    assert!(matches!(
        build_execution_graph(&def, &plugins),
        Err(BuildError::NoOutputs)
    ));
}

#[test]
fn unknown_plugin_names_are_rejected() {
    let plugins = PluginRegistry::new();
    let def = PipelineDef {
        id: "unknown".to_string(),
        stages: vec![output_stage("out", "nope", vec![StageInput::Batch])],
    };
    assert!(matches!(
        build_execution_graph(&def, &plugins),
        Err(BuildError::UnknownPlugin { kind: "output", .. })
    ));
}

#[test]
fn outputs_cannot_feed_other_stages() {
    let mut plugins = PluginRegistry::new();
    plugins.register_output("sink", Arc::new(RecordingOutput::new()));

    let def = PipelineDef {
        id: "out_upstream".to_string(),
        stages: vec![
            output_stage("first", "sink", vec![StageInput::Batch]),
            output_stage("second", "sink", vec![stage("first")]),
        ],
    };
    assert!(matches!(
        build_execution_graph(&def, &plugins),
        Err(BuildError::OutputUpstream { .. })
    ));
}

#[test]
fn definitions_deserialize_and_build() {
    let filter = Arc::new(CountingFilter::new());
    let sink = Arc::new(RecordingOutput::new());
    let mut plugins = PluginRegistry::new();
    plugins.register_filter("noop", filter.clone());
    plugins.register_output("sink", sink.clone());

    let def: PipelineDef = serde_json::from_value(json!({
        "id": "declared",
        "stages": [
            {"id": "keep", "kind": {"filter": {"plugin": "noop"}}, "inputs": ["batch"]},
            {"id": "out", "kind": {"output": {"plugin": "sink"}}, "inputs": [{"stage": "keep"}]}
        ]
    }))
    .expect("deserialize definition");

    let graph = build_execution_graph(&def, &plugins).expect("build");
    let batch = batch_from_payloads(vec![json!({"n": 7})]);
    graph.cycle(&batch, false, false).expect("cycle");
    assert_eq!(sink.received()[0], vec![json!({"n": 7})]);
}
