//! End-to-end tests of the operation lane against the scripted backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use llama_runtime::MockEngine;
use llama_session::{
    ContextSnapshot, EventChannel, OperationQueue, PredictionEvent, SessionError, SessionParams,
    SetupEvent, SetupProgress,
};

fn params() -> SessionParams {
    SessionParams::llama("/models/mock.bin").with_thread_count(1)
}

fn setup(queue: &OperationQueue, engine: &MockEngine, params: SessionParams) -> Vec<SetupEvent> {
    let (events, rx) = EventChannel::unbounded();
    queue
        .submit_setup(Arc::new(engine.clone()), params, events)
        .unwrap();
    rx.iter().collect()
}

fn ready_queue(engine: &MockEngine, params: SessionParams) -> OperationQueue {
    let queue = OperationQueue::spawn("pipeline-test").unwrap();
    let events = setup(&queue, engine, params);
    assert!(matches!(events.last(), Some(SetupEvent::Ready(_))));
    queue
}

fn snapshot(queue: &OperationQueue) -> ContextSnapshot {
    queue.current_context().unwrap().expect("context loaded")
}

fn tokens(events: &[PredictionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            PredictionEvent::Token(t) => Some(t.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_prediction_streams_tokens_in_order() {
    let engine = MockEngine::new();
    let queue = ready_queue(&engine, params());

    let events: Vec<_> = queue.predict("Hi").unwrap().collect();

    assert!(matches!(events.first(), Some(PredictionEvent::Started)));
    assert!(matches!(events.last(), Some(PredictionEvent::Completed)));
    assert_eq!(tokens(&events), vec!["Hello", ",", " world", "!"]);
    assert_eq!(events.len(), 6);

    let state = snapshot(&queue).run_state;
    assert_eq!(state.generated_tokens.len(), 4);
    assert_eq!(state.pending_input_tokens.len(), 3);
    assert_eq!(state.tokens_consumed_from_input, 3);
    assert_eq!(state.tokens_processed, 7);
    assert!(state.unevaluated_tokens.is_empty());
    assert!(!state.is_antiprompt_active);
}

#[test]
fn test_setup_reports_progress_then_ready() {
    let engine = MockEngine::new();
    let queue = OperationQueue::spawn("pipeline-test").unwrap();
    let events = setup(&queue, &engine, params().with_context_size(64));

    assert_eq!(events.len(), 2);
    assert!(matches!(
        events[0],
        SetupEvent::Progress(SetupProgress::LoadingModel)
    ));
    match &events[1] {
        SetupEvent::Ready(info) => {
            assert_eq!(info.model_path, "/models/mock.bin");
            assert_eq!(info.context_size, 64);
        }
        other => panic!("expected Ready, got {other:?}"),
    }
    assert_eq!(engine.loads(), 1);
}

fn ready_id(events: &[SetupEvent]) -> uuid::Uuid {
    match events.last() {
        Some(SetupEvent::Ready(info)) => info.id,
        other => panic!("expected Ready, got {other:?}"),
    }
}

#[test]
fn test_concurrent_setups_build_distinct_contexts() {
    let engine = MockEngine::new();
    let lanes = [
        OperationQueue::spawn("pipeline-a").unwrap(),
        OperationQueue::spawn("pipeline-b").unwrap(),
    ];

    let ids: Vec<_> = std::thread::scope(|scope| {
        let workers: Vec<_> = lanes
            .iter()
            .map(|queue| {
                let engine = &engine;
                scope.spawn(move || ready_id(&setup(queue, engine, params())))
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_ne!(ids[0], ids[1]);
    assert_eq!(engine.loads(), 2);
    assert_eq!(engine.monitors().len(), 2);
    for (queue, id) in lanes.iter().zip(&ids) {
        assert_eq!(snapshot(queue).info.id, *id);
        let (text, terminal) = queue.predict("Hi").unwrap().wait();
        assert_eq!(text, "Hello, world!");
        assert!(matches!(terminal, Some(PredictionEvent::Completed)));
    }
}

#[test]
fn test_setup_on_a_loaded_lane_is_rejected() {
    let engine = MockEngine::new();
    let queue = OperationQueue::spawn("pipeline-test").unwrap();
    let first = ready_id(&setup(&queue, &engine, params()));

    let events = setup(&queue, &engine, params());
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        SetupEvent::Failed(SessionError::ContextAlreadyLoaded)
    ));
    assert_eq!(engine.loads(), 1);
    assert_eq!(snapshot(&queue).info.id, first);

    queue.release_context().unwrap();
    let second = ready_id(&setup(&queue, &engine, params()));
    assert_ne!(first, second);
    assert_eq!(snapshot(&queue).info.id, second);
}

#[test]
fn test_failed_setup_fails_later_predictions() {
    let engine = MockEngine::new().failing_load("bad magic");
    let queue = OperationQueue::spawn("pipeline-test").unwrap();

    let events = setup(&queue, &engine, params());
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[1],
        SetupEvent::Failed(SessionError::FailedToLoadModel(_))
    ));

    let events: Vec<_> = queue.predict("Hi").unwrap().collect();
    assert_eq!(events.len(), 1);
    match &events[0] {
        PredictionEvent::Failed(err) => assert!(err.to_string().contains("bad magic")),
        other => panic!("expected Failed, got {other:?}"),
    }
    assert!(queue.current_context().unwrap().is_none());
}

#[test]
fn test_invalid_params_fail_before_loading() {
    let engine = MockEngine::new();
    let queue = OperationQueue::spawn("pipeline-test").unwrap();

    let events = setup(&queue, &engine, params().with_model_path(""));
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        SetupEvent::Failed(SessionError::InvalidParams(_))
    ));
    assert_eq!(engine.loads(), 0);
}

#[test]
fn test_lora_adapter_is_applied_during_setup() {
    let engine = MockEngine::new();
    let queue = OperationQueue::spawn("pipeline-test").unwrap();

    let events = setup(
        &queue,
        &engine,
        params().with_lora_adapter("/adapters/style.bin", None),
    );
    assert_eq!(events.len(), 3);
    assert!(matches!(
        events[1],
        SetupEvent::Progress(SetupProgress::ApplyingLoraAdapter)
    ));
    assert!(matches!(events[2], SetupEvent::Ready(_)));
}

#[test]
fn test_lora_failure_fails_setup() {
    let engine = MockEngine::new().failing_lora();
    let queue = OperationQueue::spawn("pipeline-test").unwrap();

    let events = setup(
        &queue,
        &engine,
        params().with_lora_adapter("/adapters/style.bin", Some("/models/f16.bin".into())),
    );
    assert!(matches!(
        events.last(),
        Some(SetupEvent::Failed(SessionError::FailedToApplyLoraAdapter(_)))
    ));
    assert!(queue.current_context().unwrap().is_none());
}

#[test]
fn test_predict_without_context_fails() {
    let queue = OperationQueue::spawn("pipeline-test").unwrap();
    let (_, terminal) = queue.predict("Hi").unwrap().wait();
    assert!(matches!(
        terminal,
        Some(PredictionEvent::Failed(SessionError::GenerationFailed(_)))
    ));
}

#[test]
fn test_token_limit_stops_generation() {
    let engine = MockEngine::new().ending_with_eos(false);
    let queue = ready_queue(&engine, params().with_token_limit(5));

    let events: Vec<_> = queue.predict("Hi").unwrap().collect();
    assert_eq!(tokens(&events).len(), 5);
    assert!(matches!(events.last(), Some(PredictionEvent::Completed)));

    let state = snapshot(&queue).run_state;
    assert_eq!(state.tokens_remaining, 0);
    assert_eq!(state.generated_tokens.len(), 5);
    // The last sampled token waits for the next prediction.
    assert_eq!(state.unevaluated_tokens.len(), 1);
}

#[test]
fn test_zero_token_limit_emits_no_tokens() {
    let engine = MockEngine::new();
    let queue = ready_queue(&engine, params().with_token_limit(0));

    let events: Vec<_> = queue.predict("Hi").unwrap().collect();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[1], PredictionEvent::Completed));
}

#[test]
fn test_antiprompt_stops_generation() {
    let engine = MockEngine::new()
        .with_reply_text("Hello User:")
        .ending_with_eos(false);
    let queue = ready_queue(
        &engine,
        params().with_token_limit(10).with_antiprompt("User:"),
    );

    let (text, terminal) = queue.predict("Hi").unwrap().wait();
    assert_eq!(text, "Hello User:");
    assert!(matches!(terminal, Some(PredictionEvent::Completed)));
    assert!(snapshot(&queue).run_state.is_antiprompt_active);
}

#[test]
fn test_prompt_longer_than_context_is_rejected() {
    let engine = MockEngine::new();
    let queue = ready_queue(&engine, params().with_context_size(16));

    // Rejected by the tokenizer.
    let events: Vec<_> = queue.predict("x".repeat(40)).unwrap().collect();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        PredictionEvent::Failed(SessionError::PromptTooLong(_))
    ));

    // Fits the tokenizer but not the window headroom.
    let events: Vec<_> = queue.predict("x".repeat(13)).unwrap().collect();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        PredictionEvent::Failed(SessionError::PromptTooLong(_))
    ));

    let state = snapshot(&queue).run_state;
    assert!(state.is_fresh());
    assert_eq!(engine.evaluated_tokens(), 0);
}

#[test]
fn test_generation_failure_keeps_partial_state() {
    let engine = MockEngine::new().failing_evaluate_after(2);
    let queue = ready_queue(&engine, params());

    let events: Vec<_> = queue.predict("Hi").unwrap().collect();
    assert!(matches!(events[0], PredictionEvent::Started));
    assert_eq!(tokens(&events), vec!["Hello", ","]);
    assert!(matches!(
        events.last(),
        Some(PredictionEvent::Failed(SessionError::GenerationFailed(_)))
    ));

    let state = snapshot(&queue).run_state;
    assert_eq!(state.generated_tokens.len(), 2);
    assert_eq!(state.tokens_processed, 4);
    assert_eq!(state.unevaluated_tokens.len(), 1);
}

#[test]
fn test_run_state_carries_over_between_predictions() {
    let engine = MockEngine::new().ending_with_eos(false);
    let queue = ready_queue(&engine, params().with_token_limit(2));

    let (first, _) = queue.predict("Hi").unwrap().wait();
    assert_eq!(first, "Hello,");
    let state = snapshot(&queue).run_state;
    assert_eq!(state.tokens_processed, 4);
    assert_eq!(state.unevaluated_tokens.len(), 1);

    let (second, terminal) = queue.predict("Yo").unwrap().wait();
    assert_eq!(second, " world!");
    assert!(matches!(terminal, Some(PredictionEvent::Completed)));

    let state = snapshot(&queue).run_state;
    // No BOS on the second turn; the first turn's input was compacted away.
    assert_eq!(state.pending_input_tokens.len(), 2);
    assert_eq!(state.tokens_consumed_from_input, 2);
    assert_eq!(state.tokens_processed, 8);
    assert_eq!(state.generated_tokens.len(), 2);
    assert_eq!(engine.evaluated_tokens(), 8);
}

#[test]
fn test_context_swap_keeps_generation_going() {
    let engine = MockEngine::new().ending_with_eos(false);
    let queue = ready_queue(
        &engine,
        params()
            .with_context_size(16)
            .with_tokens_to_keep(2)
            .with_token_limit(30),
    );

    let events: Vec<_> = queue.predict("abcd").unwrap().collect();
    assert_eq!(tokens(&events).len(), 30);
    assert!(matches!(events.last(), Some(PredictionEvent::Completed)));

    let state = snapshot(&queue).run_state;
    assert!(state.tokens_processed + state.unevaluated_tokens.len() <= 16);
    assert!(engine.evaluated_tokens() > 16);
}

#[test]
fn test_long_follow_up_prompt_survives_context_swap() {
    let engine = MockEngine::new().ending_with_eos(false);
    let queue = ready_queue(
        &engine,
        params()
            .with_context_size(32)
            .with_batch_size(32)
            .with_token_limit(20),
    );

    let (_, terminal) = queue.predict("Hi").unwrap().wait();
    assert!(matches!(terminal, Some(PredictionEvent::Completed)));

    let events: Vec<_> = queue.predict("x".repeat(28)).unwrap().collect();
    assert!(matches!(events.last(), Some(PredictionEvent::Completed)));
    assert_eq!(tokens(&events).len(), 20);

    let state = snapshot(&queue).run_state;
    assert!(state.tokens_processed + state.unevaluated_tokens.len() <= 32);
}

#[test]
fn test_context_observer_sees_state_before_terminal_event() {
    let engine = MockEngine::new();
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    let queue = ready_queue(&engine, params()).with_context_observer(Arc::new(
        move |snapshot: &ContextSnapshot| {
            sink.lock().unwrap().push(snapshot.run_state.tokens_processed);
        },
    ));

    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = order.clone();
    let observed = updates.clone();
    queue
        .submit_predict(
            "Hi",
            EventChannel::from_fn(move |event: PredictionEvent| {
                if matches!(event, PredictionEvent::Completed) {
                    seen.lock().unwrap().push(observed.lock().unwrap().len());
                }
            }),
        )
        .unwrap();
    queue.current_context().unwrap();

    assert_eq!(*updates.lock().unwrap(), vec![7]);
    assert_eq!(*order.lock().unwrap(), vec![1]);
}

#[test]
fn test_cancel_before_start_emits_only_cancelled() {
    let engine = MockEngine::new()
        .ending_with_eos(false)
        .with_step_delay(Duration::from_millis(10));
    let queue = ready_queue(&engine, params().with_token_limit(8));

    let running = queue.predict("Hi").unwrap();
    let queued = queue.predict("Yo").unwrap();
    queued.cancel();

    let (_, terminal) = running.wait();
    assert!(matches!(terminal, Some(PredictionEvent::Completed)));
    let events: Vec<_> = queued.collect();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], PredictionEvent::Cancelled));
}

#[test]
fn test_cancel_during_generation() {
    let engine = MockEngine::new()
        .ending_with_eos(false)
        .with_step_delay(Duration::from_millis(2));
    let queue = ready_queue(&engine, params().with_token_limit(-1));

    let mut stream = queue.predict("Hi").unwrap();
    let mut seen = 0;
    let mut terminal = None;
    while let Some(event) = stream.next() {
        match event {
            PredictionEvent::Token(_) => {
                seen += 1;
                if seen == 3 {
                    stream.cancel();
                }
            }
            PredictionEvent::Started => {}
            other => terminal = Some(other),
        }
    }
    assert!(matches!(terminal, Some(PredictionEvent::Cancelled)));
    assert!(seen >= 3);
    assert!(seen < 20);

    let state = snapshot(&queue).run_state;
    assert_eq!(state.generated_tokens.len(), seen);
}

#[test]
fn test_concurrent_submitters_are_serialized() {
    let engine = MockEngine::new()
        .ending_with_eos(false)
        .with_step_delay(Duration::from_millis(1));
    let queue = ready_queue(&engine, params().with_token_limit(3));
    let log = Arc::new(Mutex::new(Vec::new()));

    std::thread::scope(|scope| {
        for caller in 0..4 {
            let queue = &queue;
            let log = log.clone();
            scope.spawn(move || {
                let events = EventChannel::from_fn(move |event: PredictionEvent| {
                    log.lock().unwrap().push((caller, event));
                });
                queue.submit_predict(format!("p{caller}"), events).unwrap();
            });
        }
    });
    // Queued behind all four predictions.
    queue.current_context().unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 4 * 5);
    for run in log.chunks(5) {
        let caller = run[0].0;
        assert!(run.iter().all(|(c, _)| *c == caller));
        assert!(matches!(run[0].1, PredictionEvent::Started));
        assert!(matches!(run[4].1, PredictionEvent::Completed));
    }
    assert_eq!(engine.max_overlap(), 1);
}

#[test]
fn test_release_context_drops_it() {
    let engine = MockEngine::new();
    let queue = ready_queue(&engine, params());
    queue.release_context().unwrap();
    assert!(queue.current_context().unwrap().is_none());
}

#[tokio::test]
async fn test_events_reach_async_consumers() {
    let engine = MockEngine::new();
    let queue = ready_queue(&engine, params());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    queue
        .submit_predict("Hi", EventChannel::from_tokio(tx))
        .unwrap();

    let mut text = String::new();
    while let Some(event) = rx.recv().await {
        match event {
            PredictionEvent::Token(piece) => text.push_str(&piece),
            PredictionEvent::Completed => break,
            PredictionEvent::Started => {}
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(text, "Hello, world!");
}
