//! Unit tests for `AsyncFutureMerger`.

use std::sync::{Arc, Mutex};

use v8_remote_debug::dispatch::AsyncFutureMerger;
use v8_remote_debug::AppError;

type Captured<T> = Arc<Mutex<Vec<T>>>;

fn recording_merger() -> (AsyncFutureMerger<u32>, Captured<Vec<u32>>, Captured<Option<AppError>>) {
    let results: Captured<Vec<u32>> = Arc::default();
    let finishes: Captured<Option<AppError>> = Arc::default();
    let results_sink = Arc::clone(&results);
    let finish_sink = Arc::clone(&finishes);
    let merger = AsyncFutureMerger::new(
        move |values| results_sink.lock().unwrap().push(values),
        move |error| finish_sink.lock().unwrap().push(error),
    );
    (merger, results, finishes)
}

#[test]
fn nothing_fires_while_the_creator_holds_its_slot() {
    let (merger, results, finishes) = recording_merger();
    merger.add_sub_operation();
    merger.sub_operation_done(1);
    merger.sub_operation_done_sync(None);

    assert!(results.lock().unwrap().is_empty());
    assert!(finishes.lock().unwrap().is_empty());
}

#[test]
fn results_are_delivered_once_when_all_report() {
    let (merger, results, finishes) = recording_merger();
    merger.add_sub_operation();
    merger.add_sub_operation();

    merger.sub_operation_done(10);
    merger.sub_operation_done_sync(None);
    merger.sub_operation_done(20);
    merger.sub_operation_done_sync(None);
    merger.sub_operation_done(0);
    merger.sub_operation_done_sync(None);

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1, "the aggregate fires exactly once");
    assert_eq!(results[0], vec![10, 20, 0]);
    assert_eq!(finishes.lock().unwrap().as_slice(), &[None]);
}

#[test]
fn failed_sub_operation_skips_results_but_finishes() {
    let (merger, results, finishes) = recording_merger();
    merger.add_sub_operation();

    merger.sub_operation_done_sync(Some(AppError::RemoteCommand("lookup failed".into())));
    merger.sub_operation_done(0);
    merger.sub_operation_done_sync(None);

    assert!(results.lock().unwrap().is_empty(), "a failure withholds the results");
    assert_eq!(
        finishes.lock().unwrap().as_slice(),
        &[Some(AppError::RemoteCommand("lookup failed".into()))]
    );
}

#[test]
fn only_the_first_failure_is_reported() {
    let (merger, _, finishes) = recording_merger();
    merger.add_sub_operation();
    merger.add_sub_operation();

    merger.sub_operation_done_sync(Some(AppError::Transport("first".into())));
    merger.sub_operation_done_sync(Some(AppError::Transport("second".into())));
    merger.sub_operation_done_sync(None);

    assert_eq!(
        finishes.lock().unwrap().as_slice(),
        &[Some(AppError::Transport("first".into()))]
    );
}

#[test]
fn extra_reports_are_ignored() {
    let (merger, results, finishes) = recording_merger();
    merger.sub_operation_done(1);
    merger.sub_operation_done_sync(None);
    merger.sub_operation_done(2);
    merger.sub_operation_done_sync(None);

    assert_eq!(results.lock().unwrap().as_slice(), &[vec![1]]);
    assert_eq!(finishes.lock().unwrap().len(), 1);
}
