//! Unit tests for `BaseCommandProcessor` sequence allocation and response
//! correlation, driven through an in-memory handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use v8_remote_debug::dispatch::{BaseCommandProcessor, ProcessorHandler, ResponseCallback, Routed};
use v8_remote_debug::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
struct FakeCommand {
    seq: u64,
    name: &'static str,
}

enum FakeIncoming {
    Reply { seq: u64, body: &'static str },
    Failure { seq: u64, message: &'static str },
    Event(&'static str),
}

#[derive(Default)]
struct FakeHandler {
    sent: Mutex<Vec<FakeCommand>>,
    events: Mutex<Vec<&'static str>>,
    reject_sends: AtomicBool,
}

impl ProcessorHandler for FakeHandler {
    type Outgoing = FakeCommand;
    type Incoming = FakeIncoming;
    type Response = &'static str;

    fn set_seq(&self, message: &mut FakeCommand, seq: u64) {
        message.seq = seq;
    }

    fn command_name(&self, message: &FakeCommand) -> String {
        message.name.to_owned()
    }

    fn send(&self, message: FakeCommand) -> Result<()> {
        if self.reject_sends.load(Ordering::SeqCst) {
            return Err(AppError::State("Connection not attached".into()));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn route(&self, incoming: FakeIncoming) -> Routed<&'static str, FakeIncoming> {
        match incoming {
            FakeIncoming::Reply { seq, body } => Routed::Response {
                seq,
                outcome: Ok(body),
            },
            FakeIncoming::Failure { seq, message } => Routed::Response {
                seq,
                outcome: Err(AppError::RemoteCommand(message.into())),
            },
            event @ FakeIncoming::Event(_) => Routed::NonSeq(event),
        }
    }

    fn accept_non_seq(&self, incoming: FakeIncoming) {
        if let FakeIncoming::Event(name) = incoming {
            self.events.lock().unwrap().push(name);
        }
    }
}

type Outcomes = Arc<Mutex<Vec<(u64, Result<&'static str>)>>>;

fn recorder(outcomes: &Outcomes, tag: u64) -> Option<ResponseCallback<&'static str>> {
    let outcomes = Arc::clone(outcomes);
    Some(Box::new(move |outcome| outcomes.lock().unwrap().push((tag, outcome))))
}

fn command(name: &'static str) -> FakeCommand {
    FakeCommand { seq: 0, name }
}

// ── Sequencing ──────────────────────────────────────────────────────────────

#[test]
fn sequence_numbers_start_at_one_and_increase() {
    let processor = BaseCommandProcessor::new(FakeHandler::default());

    let first = processor.send(command("version"), None).expect("send");
    let second = processor.send(command("backtrace"), None).expect("send");

    assert_eq!((first, second), (1, 2));
    let sent = processor.handler().sent.lock().unwrap().clone();
    assert_eq!(
        sent,
        vec![
            FakeCommand { seq: 1, name: "version" },
            FakeCommand { seq: 2, name: "backtrace" },
        ],
        "each command carries the allocated seq"
    );
    assert_eq!(processor.pending_count(), 2);
}

// ── Correlation ─────────────────────────────────────────────────────────────

#[test]
fn responses_reach_their_own_callbacks() {
    let processor = BaseCommandProcessor::new(FakeHandler::default());
    let outcomes = Outcomes::default();
    let a = processor.send(command("a"), recorder(&outcomes, 1)).expect("send");
    let b = processor.send(command("b"), recorder(&outcomes, 2)).expect("send");

    processor.process_incoming(FakeIncoming::Reply { seq: b, body: "for b" });
    processor.process_incoming(FakeIncoming::Failure { seq: a, message: "No frames" });

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0], (2, Ok("for b")));
    assert_eq!(
        outcomes[1],
        (1, Err(AppError::RemoteCommand("No frames".into()))),
        "a remote failure reaches only the request that caused it"
    );
    assert_eq!(processor.pending_count(), 0);
}

#[test]
fn unmatched_response_is_dropped() {
    let processor = BaseCommandProcessor::new(FakeHandler::default());
    let outcomes = Outcomes::default();
    processor.send(command("a"), recorder(&outcomes, 1)).expect("send");

    processor.process_incoming(FakeIncoming::Reply { seq: 99, body: "stray" });

    assert!(outcomes.lock().unwrap().is_empty());
    assert_eq!(processor.pending_count(), 1, "the real request is still pending");
}

#[test]
fn non_seq_messages_go_to_the_handler() {
    let processor = BaseCommandProcessor::new(FakeHandler::default());

    processor.process_incoming(FakeIncoming::Event("break"));
    processor.process_incoming(FakeIncoming::Event("afterCompile"));

    assert_eq!(
        processor.handler().events.lock().unwrap().as_slice(),
        &["break", "afterCompile"]
    );
}

#[tokio::test]
async fn call_resolves_with_the_response() {
    let processor = BaseCommandProcessor::new(FakeHandler::default());

    let answer = async {
        while processor.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        processor.process_incoming(FakeIncoming::Reply { seq: 1, body: "3.14" });
    };
    let (response, ()) = tokio::join!(processor.call(command("version")), answer);

    assert_eq!(response, Ok("3.14"));
}

// ── Failure paths ───────────────────────────────────────────────────────────

#[test]
fn end_of_stream_fails_pending_requests_in_order() {
    let processor = BaseCommandProcessor::new(FakeHandler::default());
    let outcomes = Outcomes::default();
    for tag in 1..=3 {
        processor.send(command("lookup"), recorder(&outcomes, tag)).expect("send");
    }

    processor.process_eos();

    let closed: Result<&str> = Err(AppError::Transport("Connection closed".into()));
    assert_eq!(
        outcomes.lock().unwrap().as_slice(),
        &[(1, closed.clone()), (2, closed.clone()), (3, closed)]
    );
    assert_eq!(processor.pending_count(), 0);
}

#[test]
fn sends_after_end_of_stream_fail_immediately() {
    let processor = BaseCommandProcessor::new(FakeHandler::default());
    processor.process_eos();
    let outcomes = Outcomes::default();

    let err = processor
        .send(command("version"), recorder(&outcomes, 1))
        .expect_err("closed table must reject");

    assert_eq!(err, AppError::Transport("Connection closed".into()));
    assert_eq!(outcomes.lock().unwrap().as_slice(), &[(1, Err(err))]);
    assert!(processor.handler().sent.lock().unwrap().is_empty(), "nothing reaches the wire");
}

#[test]
fn send_failure_reports_to_caller_and_callback() {
    let handler = FakeHandler::default();
    handler.reject_sends.store(true, Ordering::SeqCst);
    let processor = BaseCommandProcessor::new(handler);
    let outcomes = Outcomes::default();

    let err = processor
        .send(command("version"), recorder(&outcomes, 1))
        .expect_err("handler rejects");

    assert!(matches!(err, AppError::State(_)), "unexpected error: {err}");
    assert_eq!(outcomes.lock().unwrap().len(), 1);
    assert_eq!(processor.pending_count(), 0, "the entry is removed again");
}
