//! Compiled unit behavior tests
//!
//! Exercises the stage composers directly: memoization, clear propagation,
//! split/complement sharing, terminal merging, flush dispatch and
//! cancellation handling.

use execflow::plugin::mock::{CountingFilter, FailingFilter, FieldEquals, RecordingOutput};
use execflow::{
    batch_from_payloads, filter_dataset, output_dataset, root_datasets, split_dataset,
    terminal_dataset, CompileError, Complement, Dataset, DatasetRef, Event,
};
use serde_json::{json, Value};
use std::rc::Rc;
use std::sync::Arc;

fn payloads(events: &execflow::EventsRef) -> Vec<Value> {
    events.borrow().iter().map(|e| e.payload().clone()).collect()
}

#[test]
fn repeated_compute_returns_memoized_buffer() {
    let filter = Arc::new(CountingFilter::new());
    let unit = filter_dataset(root_datasets(), filter.clone(), "memo").expect("compose filter");
    let batch = batch_from_payloads(vec![json!({"n": 1}), json!({"n": 2})]);

    let first = unit.compute(&batch, false, false).expect("compute");
    let second = unit.compute(&batch, false, false).expect("compute");
    let third = unit.compute(&batch, false, false).expect("compute");

    assert!(Rc::ptr_eq(&first, &second));
    assert!(Rc::ptr_eq(&second, &third));
    assert_eq!(filter.process_calls(), 1);
    assert_eq!(payloads(&first), vec![json!({"n": 1}), json!({"n": 2})]);
}

#[test]
fn clear_propagates_upstream_and_reruns_work() {
    let upstream = Arc::new(CountingFilter::new());
    let downstream = Arc::new(CountingFilter::new());
    let first = filter_dataset(root_datasets(), upstream.clone(), "up").expect("compose");
    let second = filter_dataset(vec![first], downstream.clone(), "down").expect("compose");
    let batch = batch_from_payloads(vec![json!({"n": 1})]);

    second.compute(&batch, false, false).expect("compute");
    assert_eq!(upstream.process_calls(), 1);
    assert_eq!(downstream.process_calls(), 1);

    second.clear();
    second.compute(&batch, false, false).expect("compute");
    assert_eq!(upstream.process_calls(), 2);
    assert_eq!(downstream.process_calls(), 2);
}

#[test]
fn split_partitions_without_loss_or_overlap() {
    let condition = Arc::new(FieldEquals::new("level", json!("error")));
    let split = split_dataset(root_datasets(), condition.clone(), "split").expect("compose");
    let batch = batch_from_payloads(vec![
        json!({"level": "error", "n": 1}),
        json!({"level": "info", "n": 2}),
        json!({"level": "error", "n": 3}),
    ]);

    let positive = split.compute(&batch, false, false).expect("compute");
    assert_eq!(
        payloads(&positive),
        vec![json!({"level": "error", "n": 1}), json!({"level": "error", "n": 3})]
    );
    assert_eq!(payloads(split.right()), vec![json!({"level": "info", "n": 2})]);
    // each buffered event was judged exactly once
    assert_eq!(condition.calls(), 3);
}

#[test]
fn complement_rides_the_splits_single_evaluation() {
    let upstream = Arc::new(CountingFilter::new());
    let condition = Arc::new(FieldEquals::new("keep", json!(true)));
    let filtered = filter_dataset(root_datasets(), upstream.clone(), "pre").expect("compose");
    let split = split_dataset(vec![filtered], condition.clone(), "branch").expect("compose");
    let complement = Complement::from(split.clone());
    let batch = batch_from_payloads(vec![json!({"keep": true}), json!({"keep": false})]);

    // pull only the negative branch
    let negative = complement.compute(&batch, false, false).expect("compute");
    assert_eq!(payloads(&negative), vec![json!({"keep": false})]);
    assert_eq!(upstream.process_calls(), 1);

    // pulling the positive branch afterwards must not re-buffer anything
    let positive = split.compute(&batch, false, false).expect("compute");
    assert_eq!(payloads(&positive), vec![json!({"keep": true})]);
    assert_eq!(upstream.process_calls(), 1);
    assert_eq!(condition.calls(), 2);

    // the complement memoizes independently of the split
    let again = complement.compute(&batch, false, false).expect("compute");
    assert!(Rc::ptr_eq(&negative, &again));
}

#[test]
fn terminal_merge_requires_parents() {
    assert!(matches!(
        terminal_dataset(Vec::new()),
        Err(CompileError::EmptyTerminal)
    ));
}

#[test]
fn terminal_merge_of_one_is_the_parent_itself() {
    let filter = Arc::new(CountingFilter::new());
    let parent = filter_dataset(root_datasets(), filter, "solo").expect("compose");
    let terminal = terminal_dataset(vec![parent.clone()]).expect("merge");
    assert!(Rc::ptr_eq(&parent, &terminal));
}

#[test]
fn terminal_merge_drives_every_output_once_and_clears() {
    let filter = Arc::new(CountingFilter::new());
    let sink_a = Arc::new(RecordingOutput::new());
    let sink_b = Arc::new(RecordingOutput::new());
    let shared = filter_dataset(root_datasets(), filter.clone(), "shared").expect("compose");
    let out_a = output_dataset(vec![shared.clone()], sink_a.clone(), "a", false).expect("compose");
    let out_b = output_dataset(vec![shared], sink_b.clone(), "b", false).expect("compose");
    let terminal = terminal_dataset(vec![out_a, out_b]).expect("merge");
    let batch = batch_from_payloads(vec![json!({"n": 1})]);

    terminal.compute(&batch, false, false).expect("cycle 1");
    assert_eq!(sink_a.receive_calls(), 1);
    assert_eq!(sink_b.receive_calls(), 1);
    // fan-out over the shared upstream still evaluates it once
    assert_eq!(filter.process_calls(), 1);

    // the merge cleared its parents, so the next cycle starts fresh
    terminal.compute(&batch, false, false).expect("cycle 2");
    assert_eq!(sink_a.receive_calls(), 2);
    assert_eq!(sink_b.receive_calls(), 2);
    assert_eq!(filter.process_calls(), 2);
}

#[test]
fn filter_without_flush_support_is_never_flushed() {
    let filter = Arc::new(CountingFilter::new());
    let unit = filter_dataset(root_datasets(), filter.clone(), "noflush").expect("compose");
    let batch = batch_from_payloads(vec![json!({"n": 1})]);

    unit.compute(&batch, true, true).expect("compute");
    assert_eq!(filter.flush_calls(), 0);
}

#[test]
fn shutdown_only_filter_flushes_once_at_the_end() {
    let filter = Arc::new(CountingFilter::with_flush(false));
    let unit = filter_dataset(root_datasets(), filter.clone(), "final-only").expect("compose");
    let batch = batch_from_payloads(vec![json!({"n": 1})]);

    unit.compute(&batch, true, false).expect("flush without shutdown");
    assert_eq!(filter.flush_calls(), 0);

    unit.clear();
    unit.compute(&batch, false, true).expect("shutdown without flush");
    assert_eq!(filter.flush_calls(), 0);

    unit.clear();
    unit.compute(&batch, true, true).expect("terminal flush");
    assert_eq!(filter.flush_calls(), 1);
    assert!(filter.flushes()[0].final_flush);
}

#[test]
fn periodic_filter_flushes_on_every_request() {
    let filter = Arc::new(CountingFilter::with_flush(true));
    let unit = filter_dataset(root_datasets(), filter.clone(), "periodic").expect("compose");
    let batch = batch_from_payloads(vec![json!({"n": 1})]);

    unit.compute(&batch, true, false).expect("mid-stream flush");
    unit.clear();
    unit.compute(&batch, true, true).expect("terminal flush");
    unit.clear();
    unit.compute(&batch, false, true).expect("no flush requested");

    let flushes = filter.flushes();
    assert_eq!(flushes.len(), 2);
    assert!(!flushes[0].final_flush);
    assert!(flushes[1].final_flush);
}

#[test]
fn root_fed_output_receives_the_batch_handle() {
    let sink = Arc::new(RecordingOutput::new());
    let unit = output_dataset(root_datasets(), sink.clone(), "direct", true).expect("compose");
    let batch = batch_from_payloads(vec![json!({"n": 1}), json!({"n": 2})]);

    let result = unit.compute(&batch, false, false).expect("compute");
    assert!(result.borrow().is_empty());
    assert_eq!(sink.receive_calls(), 1);
    assert!(sink.last_buffer_was(&batch));
}

#[test]
fn cancelled_events_are_dropped_when_buffering() {
    let filter = Arc::new(CountingFilter::new());
    let unit = filter_dataset(root_datasets(), filter.clone(), "drop").expect("compose");
    let cancelled = Event::new(json!({"n": 1}));
    cancelled.cancel();
    let batch = execflow::events(vec![cancelled, Event::new(json!({"n": 2}))]);

    unit.compute(&batch, false, false).expect("compute");
    assert_eq!(filter.seen(), vec![vec![json!({"n": 2})]]);
}

#[test]
fn capability_failures_propagate_unchanged() {
    let filter = Arc::new(FailingFilter::new("broken"));
    let unit = filter_dataset(root_datasets(), filter, "fail").expect("compose");
    let batch = batch_from_payloads(vec![json!({"n": 1})]);

    let err = unit.compute(&batch, false, false).expect_err("must fail");
    assert_eq!(err.plugin(), "broken");
}

#[test]
fn generated_source_describes_synthesized_units() {
    let filter = Arc::new(CountingFilter::new());
    let _unit: DatasetRef =
        filter_dataset(root_datasets(), filter, "diagnostics").expect("compose");

    let source = execflow::generated_source();
    assert!(!source.is_empty());
    let joined = source.join("\n");
    assert!(joined.contains("FilterDataset"));
    assert!(joined.contains("compute {"));
    assert!(joined.contains("clear {"));
}
