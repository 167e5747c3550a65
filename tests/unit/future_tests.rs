//! Unit tests for `AsyncFuture` and `AsyncFutureRef`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use v8_remote_debug::dispatch::{AsyncFuture, AsyncFutureRef, Completer};
use v8_remote_debug::AppError;

#[test]
fn done_future_delivers_immediately() {
    let future = AsyncFuture::done(Ok(7_u32));
    assert!(future.is_done());
    assert_eq!(future.get_sync(), Ok(7));
}

#[test]
fn first_caller_starts_the_operation() {
    let slot: AsyncFutureRef<u32> = AsyncFutureRef::new();
    let starts = Arc::new(AtomicUsize::new(0));
    let parked: Arc<Mutex<Option<Completer<u32>>>> = Arc::new(Mutex::new(None));

    let start = |starts: &Arc<AtomicUsize>, parked: &Arc<Mutex<Option<Completer<u32>>>>| {
        let starts = Arc::clone(starts);
        let parked = Arc::clone(parked);
        move |completer: Completer<u32>| {
            starts.fetch_add(1, Ordering::SeqCst);
            *parked.lock().unwrap() = Some(completer);
            Ok(())
        }
    };

    let (first, started_first) = slot.initialize_run(start(&starts, &parked));
    let (second, started_second) = slot.initialize_run(start(&starts, &parked));

    assert!(started_first, "the first caller wins the slot");
    assert!(!started_second, "the second caller joins the running cell");
    assert!(Arc::ptr_eq(&first, &second), "both callers share one cell");
    assert_eq!(starts.load(Ordering::SeqCst), 1, "the operation runs once");
    assert!(!first.is_done());

    parked.lock().unwrap().take().unwrap().complete(Ok(42));
    assert_eq!(second.get_sync(), Ok(42));
}

#[test]
fn callbacks_registered_before_completion_all_fire() {
    let slot: AsyncFutureRef<String> = AsyncFutureRef::default();
    let parked: Arc<Mutex<Option<Completer<String>>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&parked);
    let (future, _) = slot.initialize_run(move |completer| {
        *sink.lock().unwrap() = Some(completer);
        Ok(())
    });

    let seen = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..3 {
        let seen = Arc::clone(&seen);
        future.get_async(move |result| seen.lock().unwrap().push(result.clone()));
    }
    assert!(seen.lock().unwrap().is_empty(), "nothing fires before completion");

    parked.lock().unwrap().take().unwrap().complete(Ok("done".into()));
    assert_eq!(seen.lock().unwrap().len(), 3);
    assert!(seen.lock().unwrap().iter().all(|result| result.as_deref() == Ok("done")));
}

#[test]
fn start_failure_becomes_the_cached_result() {
    let slot: AsyncFutureRef<u32> = AsyncFutureRef::new();
    let (future, started) =
        slot.initialize_run(|_completer| Err(AppError::Transport("Connection closed".into())));

    assert!(started);
    assert!(future.is_done());
    assert_eq!(
        future.get_sync(),
        Err(AppError::Transport("Connection closed".into()))
    );
    let (again, started_again) = slot.initialize_run(|completer| {
        completer.complete(Ok(1));
        Ok(())
    });
    assert!(!started_again, "a failed cell still occupies the slot");
    assert!(again.get_sync().is_err());
}

#[test]
fn trivial_initialization_only_fills_an_empty_slot() {
    let slot: AsyncFutureRef<u32> = AsyncFutureRef::new();
    assert!(slot.get().is_none());
    assert!(slot.initialize_trivial(Ok(5)));
    assert!(!slot.initialize_trivial(Ok(6)), "the slot is already taken");
    assert_eq!(slot.get().expect("cell present").get_sync(), Ok(5));
}

#[test]
fn reinitialize_replaces_the_cell() {
    let slot: AsyncFutureRef<u32> = AsyncFutureRef::new();
    assert!(slot.initialize_trivial(Ok(1)));

    let fresh = slot.reinitialize_run(|completer| {
        completer.complete(Ok(2));
        Ok(())
    });

    assert_eq!(fresh.get_sync(), Ok(2));
    let current = slot.get().expect("cell present");
    assert!(Arc::ptr_eq(&current, &fresh));
}

#[tokio::test]
async fn async_get_waits_for_completion() {
    let slot: AsyncFutureRef<u32> = AsyncFutureRef::new();
    let parked: Arc<Mutex<Option<Completer<u32>>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&parked);
    let (future, _) = slot.initialize_run(move |completer| {
        *sink.lock().unwrap() = Some(completer);
        Ok(())
    });

    let completer = parked.lock().unwrap().take().unwrap();
    tokio::spawn(async move {
        tokio::task::yield_now().await;
        completer.complete(Ok(9));
    });

    assert_eq!(future.get().await, Ok(9));
}
