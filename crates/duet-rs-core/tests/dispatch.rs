//! Dispatch and consensus integration tests.

use duet_rs_config::DispatchConfig;
use duet_rs_core::{DispatchEngine, DispatchFailure};
use duet_rs_protocol::{
    AdapterFailure, ContextMessage, ConversationContext, DispatchMode, ImageRef, ModelAdapter,
    Role,
};
use duet_rs_test_utils::{PanickingAdapter, ScriptedAdapter};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config(adapter_timeout_ms: u64, turn_deadline_ms: u64) -> DispatchConfig {
    DispatchConfig {
        adapter_timeout_ms,
        turn_deadline_ms,
        priority: vec!["gemini".to_string(), "huggingface".to_string()],
        ..DispatchConfig::default()
    }
}

fn engine(adapters: &[Arc<dyn ModelAdapter>], config: &DispatchConfig) -> DispatchEngine {
    DispatchEngine::new(adapters.to_vec(), config)
}

fn text_turn(text: &str) -> Arc<ConversationContext> {
    Arc::new(ConversationContext::new(vec![ContextMessage {
        role: Role::User,
        text: text.to_string(),
        images: Vec::new(),
    }]))
}

fn image_turn() -> Arc<ConversationContext> {
    Arc::new(ConversationContext::new(vec![ContextMessage {
        role: Role::User,
        text: "what is this?".to_string(),
        images: vec![ImageRef::file("photo.png")],
    }]))
}

#[tokio::test(start_paused = true)]
async fn auto_mode_prefers_confidence_over_speed() {
    let fast = Arc::new(
        ScriptedAdapter::new("gemini")
            .with_confidence(0.7)
            .with_delay(Duration::from_millis(500))
            .reply("fast answer"),
    );
    let slow = Arc::new(
        ScriptedAdapter::new("huggingface")
            .with_confidence(0.9)
            .with_delay(Duration::from_millis(2000))
            .reply("slow answer"),
    );
    let engine = engine(&[fast.clone(), slow.clone()], &config(30_000, 45_000));

    let outcome = engine
        .dispatch(text_turn("hi"), &DispatchMode::Auto, CancellationToken::new())
        .await
        .expect("dispatch");

    assert_eq!(outcome.winner.adapter_id, "huggingface");
    assert_eq!(outcome.winner.response.text, "slow answer");
    assert_eq!(outcome.runners_up.len(), 1);
    assert_eq!(outcome.runners_up[0].adapter_id, "gemini");
    assert!(!outcome.deadline_hit);
    assert_eq!(fast.calls(), 1);
    assert_eq!(slow.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn equal_scores_go_to_the_priority_adapter() {
    let gemini = Arc::new(
        ScriptedAdapter::new("gemini")
            .with_confidence(0.8)
            .with_delay(Duration::from_millis(300)),
    );
    let huggingface = Arc::new(
        ScriptedAdapter::new("huggingface")
            .with_confidence(0.8)
            .with_delay(Duration::from_millis(300)),
    );
    // Registration order is reversed; the priority list still decides.
    let engine = engine(&[huggingface, gemini], &config(30_000, 45_000));
    assert_eq!(engine.adapter_ids(), vec!["gemini", "huggingface"]);

    let outcome = engine
        .dispatch(text_turn("hi"), &DispatchMode::Auto, CancellationToken::new())
        .await
        .expect("dispatch");
    assert_eq!(outcome.winner.adapter_id, "gemini");
}

#[tokio::test]
async fn partial_failure_still_produces_a_reply() {
    let gemini = Arc::new(
        ScriptedAdapter::new("gemini").fail(AdapterFailure::NetworkError("reset".to_string())),
    );
    let huggingface = Arc::new(ScriptedAdapter::new("huggingface").reply("hello"));
    let engine = engine(&[gemini, huggingface], &config(30_000, 45_000));

    let outcome = engine
        .dispatch(text_turn("hi"), &DispatchMode::Auto, CancellationToken::new())
        .await
        .expect("dispatch");
    assert_eq!(outcome.winner.adapter_id, "huggingface");
    assert_eq!(
        outcome.failures,
        vec![(
            "gemini".to_string(),
            AdapterFailure::NetworkError("reset".to_string())
        )]
    );
}

#[tokio::test]
async fn all_failures_name_every_adapter() {
    let gemini = Arc::new(ScriptedAdapter::new("gemini").fail(AdapterFailure::Timeout));
    let huggingface = Arc::new(
        ScriptedAdapter::new("huggingface").fail(AdapterFailure::Unauthorized("bad key".into())),
    );
    let engine = engine(&[gemini, huggingface], &config(30_000, 45_000));

    let err = engine
        .dispatch(text_turn("hi"), &DispatchMode::Auto, CancellationToken::new())
        .await
        .unwrap_err();
    let DispatchFailure::AllAdaptersFailed(failures) = &err else {
        panic!("unexpected failure: {err:?}");
    };
    assert_eq!(failures.len(), 2);
    let message = err.to_string();
    assert!(message.contains("gemini: timed out"), "{message}");
    assert!(message.contains("huggingface: unauthorized: bad key"), "{message}");
}

#[tokio::test(start_paused = true)]
async fn deadline_returns_best_reply_so_far_and_cancels_the_rest() {
    let quick = Arc::new(
        ScriptedAdapter::new("gemini")
            .with_delay(Duration::from_secs(1))
            .reply("made it"),
    );
    let stuck = Arc::new(ScriptedAdapter::new("huggingface").hanging());
    let engine = engine(&[quick, stuck.clone()], &config(30_000, 5_000));

    let outcome = engine
        .dispatch(text_turn("hi"), &DispatchMode::Auto, CancellationToken::new())
        .await
        .expect("dispatch");
    assert!(outcome.deadline_hit);
    assert_eq!(outcome.winner.response.text, "made it");
    assert_eq!(stuck.calls(), 1);
    assert!(stuck.all_tokens_cancelled());
}

#[tokio::test(start_paused = true)]
async fn deadline_without_replies_is_a_timeout() {
    let gemini = Arc::new(ScriptedAdapter::new("gemini").hanging());
    let huggingface = Arc::new(ScriptedAdapter::new("huggingface").hanging());
    let engine = engine(&[gemini, huggingface], &config(30_000, 5_000));

    let err = engine
        .dispatch(text_turn("hi"), &DispatchMode::Auto, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, DispatchFailure::Timeout);
}

#[tokio::test(start_paused = true)]
async fn slow_adapter_times_out_individually() {
    let stuck = Arc::new(ScriptedAdapter::new("gemini").hanging());
    let steady = Arc::new(
        ScriptedAdapter::new("huggingface")
            .with_delay(Duration::from_secs(2))
            .reply("steady"),
    );
    let engine = engine(&[stuck, steady], &config(1_000, 45_000));

    let outcome = engine
        .dispatch(text_turn("hi"), &DispatchMode::Auto, CancellationToken::new())
        .await
        .expect("dispatch");
    assert_eq!(outcome.winner.adapter_id, "huggingface");
    assert_eq!(
        outcome.failures,
        vec![("gemini".to_string(), AdapterFailure::Timeout)]
    );
}

#[tokio::test]
async fn single_mode_queries_only_the_selected_adapter() {
    let gemini = Arc::new(ScriptedAdapter::new("gemini"));
    let huggingface = Arc::new(ScriptedAdapter::new("huggingface").reply("only me"));
    let engine = engine(&[gemini.clone(), huggingface.clone()], &config(30_000, 45_000));

    let outcome = engine
        .dispatch(
            text_turn("hi"),
            &DispatchMode::Single("huggingface".to_string()),
            CancellationToken::new(),
        )
        .await
        .expect("dispatch");
    assert_eq!(outcome.winner.response.text, "only me");
    assert_eq!(gemini.calls(), 0);
    assert_eq!(huggingface.calls(), 1);
    assert!(huggingface.all_tokens_cancelled());
}

#[tokio::test]
async fn single_mode_image_turn_on_text_adapter_fails_fast() {
    let huggingface = Arc::new(ScriptedAdapter::new("huggingface"));
    let engine = engine(&[huggingface.clone()], &config(30_000, 45_000));

    let err = engine
        .dispatch(
            image_turn(),
            &DispatchMode::Single("huggingface".to_string()),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, DispatchFailure::NoCapableAdapter);
    assert_eq!(huggingface.calls(), 0);
}

#[tokio::test]
async fn auto_mode_image_turn_skips_text_only_adapters() {
    let gemini = Arc::new(ScriptedAdapter::new("gemini").with_vision().reply("a cat"));
    let huggingface = Arc::new(ScriptedAdapter::new("huggingface"));
    let engine = engine(&[gemini.clone(), huggingface.clone()], &config(30_000, 45_000));

    let outcome = engine
        .dispatch(image_turn(), &DispatchMode::Auto, CancellationToken::new())
        .await
        .expect("dispatch");
    assert_eq!(outcome.winner.adapter_id, "gemini");
    assert_eq!(huggingface.calls(), 0);

    let text_only = engine_with_text_only();
    let err = text_only
        .dispatch(image_turn(), &DispatchMode::Auto, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, DispatchFailure::NoCapableAdapter);
}

fn engine_with_text_only() -> DispatchEngine {
    let huggingface: Arc<dyn ModelAdapter> = Arc::new(ScriptedAdapter::new("huggingface"));
    DispatchEngine::new(vec![huggingface], &config(30_000, 45_000))
}

#[tokio::test]
async fn text_only_adapters_get_history_without_images() {
    let gemini = Arc::new(ScriptedAdapter::new("gemini").with_vision());
    let huggingface = Arc::new(ScriptedAdapter::new("huggingface"));
    let engine = engine(&[gemini.clone(), huggingface.clone()], &config(30_000, 45_000));
    let context = Arc::new(ConversationContext::new(vec![
        ContextMessage {
            role: Role::User,
            text: "look".to_string(),
            images: vec![ImageRef::file("cat.png")],
        },
        ContextMessage {
            role: Role::Assistant,
            text: "a cat".to_string(),
            images: Vec::new(),
        },
        ContextMessage {
            role: Role::User,
            text: "what colour?".to_string(),
            images: Vec::new(),
        },
    ]));

    engine
        .dispatch(context, &DispatchMode::Auto, CancellationToken::new())
        .await
        .expect("dispatch");

    assert!(gemini.requests()[0].context.has_images());
    let stripped = &huggingface.requests()[0].context;
    assert!(!stripped.has_images());
    assert_eq!(stripped.len(), 3);
    assert_eq!(
        huggingface.last_context_texts(),
        vec!["look", "a cat", "what colour?"]
    );
}

#[tokio::test]
async fn adapter_panics_become_invalid_responses() {
    let gemini: Arc<dyn ModelAdapter> = Arc::new(PanickingAdapter::new("gemini"));
    let huggingface = Arc::new(ScriptedAdapter::new("huggingface").reply("survivor"));
    let engine = engine(&[gemini, huggingface], &config(30_000, 45_000));

    let outcome = engine
        .dispatch(text_turn("hi"), &DispatchMode::Auto, CancellationToken::new())
        .await
        .expect("dispatch");
    assert_eq!(outcome.winner.response.text, "survivor");
    let (adapter_id, failure) = &outcome.failures[0];
    assert_eq!(adapter_id, "gemini");
    assert!(
        matches!(failure, AdapterFailure::InvalidResponse(reason) if reason.contains("gemini exploded"))
    );
}

#[tokio::test]
async fn unknown_single_adapter_is_rejected() {
    let engine = engine(
        &[Arc::new(ScriptedAdapter::new("gemini"))],
        &config(30_000, 45_000),
    );
    let err = engine
        .dispatch(
            text_turn("hi"),
            &DispatchMode::Single("claude".to_string()),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, DispatchFailure::UnknownAdapter("claude".to_string()));
}

#[tokio::test(start_paused = true)]
async fn caller_cancellation_stops_every_call() {
    let gemini = Arc::new(ScriptedAdapter::new("gemini").hanging());
    let huggingface = Arc::new(ScriptedAdapter::new("huggingface").hanging());
    let engine = Arc::new(engine(
        &[gemini.clone(), huggingface.clone()],
        &config(30_000, 45_000),
    ));
    let cancel = CancellationToken::new();

    let task = tokio::spawn({
        let engine = engine.clone();
        let cancel = cancel.clone();
        async move {
            engine
                .dispatch(text_turn("hi"), &DispatchMode::Auto, cancel)
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let err = task.await.expect("join").unwrap_err();
    assert_eq!(err, DispatchFailure::Cancelled);
    assert!(gemini.all_tokens_cancelled());
    assert!(huggingface.all_tokens_cancelled());
}
