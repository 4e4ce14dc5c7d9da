#![cfg(unix)]

mod common;

use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{billed_caller, drain_events, event_sink, harness, of_type};
use gemini_relay::billing::ChargeStatus;
use gemini_relay::caller::Caller;
use gemini_relay::gemini_spawner::{CommandOptions, InvocationError, TIMEOUT_MESSAGE};
use gemini_relay::guards::GuardError;
use gemini_relay::session_store::Role;

const FIX_BUG_SCRIPT: &str = r#"
echo "[DEBUG] loading extensions"
echo '{"type":"cli-response","data":{"message":{"content":"Looking at the bug."},"usage":{"total_token_count":1000}}}'
echo "plain text chatter"
echo '{"type":"cli-response","data":{"message":{"content":[{"type":"text","text":"Fixed it."}]},"usage":{"total_token_count":2500}}}'
"#;

fn options_for(cwd: &str) -> CommandOptions {
    CommandOptions {
        cwd: Some(cwd.to_string()),
        ..CommandOptions::default()
    }
}

#[tokio::test]
async fn new_session_streams_bills_and_persists() {
    let h = harness(FIX_BUG_SCRIPT, |_| {});
    let (sink, mut rx) = event_sink();

    let outcome = h
        .state
        .spawner
        .spawn_invocation("fix bug", options_for(&h.project_str()), &billed_caller(), sink)
        .await
        .unwrap();

    let events = drain_events(&mut rx);
    let created = of_type(&events, "session-created");
    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["sessionId"], json!(outcome.session_id));
    assert!(outcome.session_id.starts_with("gemini_"));

    // The flat fee is charged before anything else happens
    assert_eq!(events[0]["type"], "photon-charge");
    assert_eq!(events[0]["data"]["reason"], "message");
    assert_eq!(events[0]["data"]["photonsCharged"], 3);

    assert_eq!(of_type(&events, "cli-response").len(), 2);
    assert!(of_type(&events, "gemini-error").is_empty());

    let complete = events.last().unwrap();
    assert_eq!(complete["type"], "gemini-complete");
    assert_eq!(complete["exitCode"], 0);
    assert_eq!(complete["isNewSession"], true);

    assert_eq!(outcome.billing.total_tokens, 2500);
    assert_eq!(outcome.billing.billed_tokens, 2500);
    assert_eq!(outcome.billing.failed_tokens, 0);
    assert_eq!(outcome.billing.photons_charged, 6);
    assert_eq!(outcome.billing.status, ChargeStatus::Charged);
    assert_eq!(h.client.photons().iter().sum::<u64>(), 6);
    assert_eq!(h.client.photons()[0], 3);

    assert_eq!(outcome.stats.responses, 2);
    assert_eq!(outcome.stats.noise, 1);
    assert_eq!(outcome.stats.unparseable, 1);

    let session = h.state.sessions().get_session(&outcome.session_id).await.unwrap();
    assert_eq!(session.project_path, h.project_str());
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].role, Role::User);
    assert_eq!(session.messages[0].content, "fix bug");
    assert_eq!(session.messages[1].role, Role::Assistant);
    assert_eq!(session.messages[1].content, "Looking at the bug.\nFixed it.");

    assert!(h.state.spawner.registry().is_empty());
    assert_eq!(h.last_prompt().as_deref(), Some("fix bug"));

    let audit = h.state.spawner.audit().log_path("alice");
    let log = std::fs::read_to_string(audit).unwrap();
    assert!(log.contains("\"command_received\""));
    assert!(log.contains("\"session_created\""));
    assert!(log.contains("\"invocation_complete\""));
}

#[tokio::test]
async fn missing_credentials_runs_without_billing() {
    let h = harness(FIX_BUG_SCRIPT, |_| {});
    let (sink, mut rx) = event_sink();

    let outcome = h
        .state
        .spawner
        .spawn_invocation("fix bug", options_for(&h.project_str()), &Caller::anonymous(), sink)
        .await
        .unwrap();

    assert_eq!(outcome.billing.status, ChargeStatus::MissingCredentials);
    assert_eq!(outcome.billing.total_tokens, 2500);
    assert_eq!(outcome.billing.photons_charged, 0);
    assert!(h.client.requests.lock().is_empty());
    assert!(of_type(&drain_events(&mut rx), "photon-charge").is_empty());
}

#[tokio::test]
async fn rejected_precharge_prevents_spawn() {
    let h = harness("touch \"$HERE/spawned\"", |_| {});
    h.client.fail.store(true, Ordering::SeqCst);
    let (sink, mut rx) = event_sink();

    let err = h
        .state
        .spawner
        .spawn_invocation("fix bug", options_for(&h.project_str()), &billed_caller(), sink)
        .await
        .unwrap_err();
    assert!(matches!(err, InvocationError::Billing(_)));

    let events = drain_events(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "photon-charge");
    assert_eq!(events[0]["tokensUsed"], 0);
    assert!(events[0]["error"].as_str().unwrap().contains("insufficient photons"));

    assert!(!h.dir.path().join("spawned").exists());
    assert!(h.state.spawner.registry().is_empty());
}

#[tokio::test]
async fn failed_token_charge_is_recorded_and_run_continues() {
    let h = harness(FIX_BUG_SCRIPT, |_| {});
    // Request 0 is the flat fee, request 1 the first token charge
    h.client.fail_on.lock().push(1);
    let (sink, mut rx) = event_sink();

    let outcome = h
        .state
        .spawner
        .spawn_invocation("fix bug", options_for(&h.project_str()), &billed_caller(), sink)
        .await
        .unwrap();

    assert!(outcome.billing.failed_tokens > 0);
    assert_eq!(
        outcome.billing.billed_tokens + outcome.billing.failed_tokens,
        2500
    );

    let events = drain_events(&mut rx);
    let charges = of_type(&events, "photon-charge");
    assert!(charges
        .iter()
        .any(|c| c["error"].as_str().map_or(false, |e| e.contains("insufficient photons"))));
    let complete = events.last().unwrap();
    assert_eq!(complete["type"], "gemini-complete");
    assert_eq!(complete["exitCode"], 0);
    assert!(h.state.spawner.registry().is_empty());
}

#[tokio::test]
async fn fatal_billing_error_terminates_the_cli() {
    let script = r#"
echo '{"type":"cli-response","data":{"message":{"content":"Working."},"usage":{"total_token_count":1000}}}'
exec sleep 30
"#;
    let h = harness(script, |config| config.billing.fatal_on_billing_error = true);
    h.client.fail_on.lock().push(1);
    let (sink, mut rx) = event_sink();

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        h.state.spawner.spawn_invocation(
            "fix bug",
            options_for(&h.project_str()),
            &billed_caller(),
            sink,
        ),
    )
    .await
    .expect("billing failure should stop the CLI");
    assert!(matches!(result, Err(InvocationError::Exited(code)) if code != Some(0)));

    let events = drain_events(&mut rx);
    assert!(of_type(&events, "photon-charge")
        .iter()
        .any(|c| c["tokensUsed"] == 1000 && c["error"].is_string()));
    let complete = of_type(&events, "gemini-complete");
    assert_eq!(complete.len(), 1);
    assert!(complete[0]["exitCode"].is_null() || complete[0]["exitCode"] != 0);
    assert!(h.state.spawner.registry().is_empty());
    assert_eq!(h.client.requests.lock().len(), 2);
}

#[tokio::test]
async fn resume_prepends_context_and_appends_messages() {
    let h = harness(FIX_BUG_SCRIPT, |_| {});
    let sessions = h.state.sessions();
    let project = h.project_str();
    sessions.add_message("gemini_42", Role::User, "hello", &project).await.unwrap();
    sessions
        .add_message("gemini_42", Role::Assistant, "hi there", &project)
        .await
        .unwrap();

    let (sink, mut rx) = event_sink();
    let options = CommandOptions {
        session_id: Some("gemini_42".into()),
        ..options_for(&project)
    };
    let outcome = h
        .state
        .spawner
        .spawn_invocation("fix bug", options, &billed_caller(), sink)
        .await
        .unwrap();
    assert_eq!(outcome.session_id, "gemini_42");
    assert!(!outcome.is_new_session);

    let prompt = h.last_prompt().unwrap();
    assert!(prompt.contains("hello"));
    assert!(prompt.contains("hi there"));
    assert!(prompt.ends_with("fix bug"));

    let events = drain_events(&mut rx);
    assert!(of_type(&events, "session-created").is_empty());
    assert_eq!(events.last().unwrap()["isNewSession"], false);

    let session = sessions.get_session("gemini_42").await.unwrap();
    let contents: Vec<&str> = session.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec!["hello", "hi there", "fix bug", "Looking at the bug.\nFixed it."]
    );
}

#[tokio::test]
async fn argv_carries_model_and_yolo() {
    let h = harness("true", |config| config.cli.default_model = "gemini-test".into());
    let (sink, _rx) = event_sink();
    let mut options = options_for(&h.project_str());
    options.tools_settings.skip_permissions = true;

    h.state
        .spawner
        .spawn_invocation("it's $(dangerous)", options, &Caller::anonymous(), sink)
        .await
        .unwrap();

    assert_eq!(
        h.last_args(),
        vec!["--prompt", "it's $(dangerous)", "--model", "gemini-test", "--yolo"]
    );
}

#[tokio::test]
async fn abort_terminates_exactly_the_named_session() {
    let h = harness("echo started; exec sleep 30", |_| {});
    let spawner = h.state.spawner.clone();
    let (sink, mut rx) = event_sink();
    let options = CommandOptions {
        session_id: Some("gemini_7".into()),
        ..options_for(&h.project_str())
    };

    let task = tokio::spawn({
        let spawner = spawner.clone();
        async move {
            spawner
                .spawn_invocation("wait", options, &Caller::anonymous(), sink)
                .await
        }
    });

    for _ in 0..100 {
        if spawner.registry().get("gemini_7").and_then(|p| p.pid).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!spawner.abort("gemini"));
    assert!(spawner.abort("gemini_7"));
    assert!(!spawner.registry().contains("gemini_7"));

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("invocation should stop after abort")
        .unwrap();
    assert!(matches!(result, Err(InvocationError::Exited(None))));

    let events = drain_events(&mut rx);
    let complete = events.last().unwrap();
    assert_eq!(complete["type"], "gemini-complete");
    assert!(complete["exitCode"].is_null());
    assert!(!spawner.abort("gemini_7"));
}

#[tokio::test]
async fn second_command_for_busy_session_is_rejected() {
    let h = harness("exec sleep 30", |_| {});
    let spawner = h.state.spawner.clone();
    let project = h.project_str();
    let options = CommandOptions {
        session_id: Some("gemini_9".into()),
        ..options_for(&project)
    };

    let (sink, _rx) = event_sink();
    let first = tokio::spawn({
        let spawner = spawner.clone();
        let options = options.clone();
        async move {
            spawner
                .spawn_invocation("one", options, &Caller::anonymous(), sink)
                .await
        }
    });
    for _ in 0..100 {
        if spawner.registry().contains("gemini_9") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let (sink, mut rx) = event_sink();
    let err = spawner
        .spawn_invocation("two", options, &Caller::anonymous(), sink)
        .await
        .unwrap_err();
    assert!(matches!(err, InvocationError::SessionBusy(_)));
    assert_eq!(drain_events(&mut rx)[0]["type"], "gemini-error");

    assert!(spawner.abort("gemini_9"));
    let _ = tokio::time::timeout(Duration::from_secs(5), first).await;
}

#[tokio::test]
async fn silent_cli_times_out() {
    let h = harness("exec sleep 30", |config| config.cli.output_timeout_secs = Some(1));
    let (sink, mut rx) = event_sink();

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        h.state.spawner.spawn_invocation(
            "hang",
            options_for(&h.project_str()),
            &Caller::anonymous(),
            sink,
        ),
    )
    .await
    .expect("timeout should fire");
    assert!(matches!(result, Err(InvocationError::Exited(_))));

    let events = drain_events(&mut rx);
    let errors = of_type(&events, "gemini-error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["error"], TIMEOUT_MESSAGE);
    assert!(h.state.spawner.registry().is_empty());
}

#[tokio::test]
async fn stderr_noise_is_filtered() {
    let script = r#"
echo "(node:123) [DEP0040] DeprecationWarning: punycode is deprecated" >&2
echo "Error: model not found" >&2
exit 3
"#;
    let h = harness(script, |_| {});
    let (sink, mut rx) = event_sink();

    let err = h
        .state
        .spawner
        .spawn_invocation("x", options_for(&h.project_str()), &Caller::anonymous(), sink)
        .await
        .unwrap_err();
    assert!(matches!(err, InvocationError::Exited(Some(3))));
    assert_eq!(err.to_string(), "Gemini CLI exited with code 3");

    let events = drain_events(&mut rx);
    let errors = of_type(&events, "gemini-error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["error"], "Error: model not found");
    assert_eq!(events.last().unwrap()["exitCode"], 3);
}

#[tokio::test]
async fn guards_reject_before_spawn() {
    let h = harness("touch \"$HERE/spawned\"", |config| config.paths.quota_bytes = 0);
    let (sink, mut rx) = event_sink();
    let err = h
        .state
        .spawner
        .spawn_invocation("x", options_for(&h.project_str()), &billed_caller(), sink)
        .await
        .unwrap_err();
    assert!(matches!(err, InvocationError::Guard(GuardError::OverQuota(_))));
    assert!(drain_events(&mut rx).is_empty());
    assert!(h.client.requests.lock().is_empty());

    let root = tempfile::TempDir::new().unwrap();
    let confined = harness("touch \"$HERE/spawned\"", |config| {
        config.paths.shell_root = Some(root.path().to_path_buf())
    });
    let (sink, _rx) = event_sink();
    let err = confined
        .state
        .spawner
        .spawn_invocation("x", options_for("/etc"), &Caller::anonymous(), sink)
        .await
        .unwrap_err();
    match err {
        InvocationError::Guard(guard) => assert_eq!(guard.status(), 403),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!confined.dir.path().join("spawned").exists());
}
