mod support;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;

use tally_core::{
    AuditVerdict, ExtractionSource, FollowUpOutcome, OrchestratorConfig, SessionError,
    SessionPhase, Termination,
};
use tally_tools::{Credential, ToolError};
use tally_types::{ChatRequest, StreamFrame};

use support::*;

fn invoice() -> serde_json::Value {
    json!({
        "invoiceId": "inv_7",
        "invoiceNumber": "INV-7",
        "status": "SENT",
        "client": "Acme",
        "total": 420.0
    })
}

#[tokio::test]
async fn silent_tool_turn_gets_a_follow_up_answer() {
    let provider = ScriptedProvider::new(vec![
        Round::Chunks(
            [call("c1", "get_invoice", json!({})), vec![done("tool_calls")]].concat(),
        ),
        Round::Chunks(vec![done("stop")]),
        Round::Chunks(vec![
            text("Your last invoice INV-7 "),
            text("is SENT."),
            done("stop"),
        ]),
    ]);
    let tools = Arc::new(FakeTools::new().with_output("get_invoice", invoice()));
    let orchestrator = orchestrator(provider.clone(), tools.clone(), test_config());

    let session = orchestrator
        .open(
            user_request("what's the status of my last invoice?"),
            Credential::default(),
        )
        .await
        .expect("session opens");
    let message_id = session.message_id().to_string();
    let (payloads, report) = session.collect().await;
    let frames = decode_all(&payloads);

    assert!(frames.iter().all(|(id, _)| id == &message_id));
    assert_eq!(
        kinds(&frames),
        vec![
            "tool_call_start",
            "tool_call_args",
            "tool_result",
            "step_finish",
            "step_finish",
            "text_delta",
            "text_delta",
            "message_finish",
        ]
    );
    assert_eq!(joined_text(&frames), "Your last invoice INV-7 is SENT.");
    assert!(matches!(
        frames.last(),
        Some((_, StreamFrame::MessageFinish { finish_reason, .. })) if finish_reason == "stop"
    ));

    let report = report.expect("report");
    assert_eq!(report.termination, Termination::Completed);
    assert_eq!(report.verdict, Some(AuditVerdict::NeedsFollowUp));
    assert_eq!(report.extraction, Some(ExtractionSource::StepTrace));
    assert_eq!(
        report.follow_up,
        FollowUpOutcome::Delivered {
            chars: "Your last invoice INV-7 is SENT.".chars().count()
        }
    );
    assert_eq!(
        report.phases,
        vec![
            SessionPhase::Open,
            SessionPhase::RelayingPrimary,
            SessionPhase::Auditing,
            SessionPhase::NeedsFollowUp,
            SessionPhase::RelayingFollowUp,
            SessionPhase::Closed,
        ]
    );
    assert_eq!(report.tool_calls, 1);
    assert_eq!(
        report.frames,
        frames.iter().map(|(_, frame)| frame.clone()).collect::<Vec<_>>()
    );

    let requests = provider.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].tools.as_ref().is_some_and(|t| t.len() == 2));
    assert!(requests[1]
        .messages
        .iter()
        .any(|m| m.role == "tool" && m.content.contains("SENT")));
    let follow_up = &requests[2];
    assert!(follow_up.tools.is_none());
    let prompt = &follow_up.messages.last().expect("prompt").content;
    assert!(prompt.contains("what's the status of my last invoice?"));
    assert!(prompt.contains("\"status\":\"SENT\""));
    assert_eq!(tools.calls().len(), 1);
}

#[tokio::test]
async fn plain_text_answer_passes_through_unchanged() {
    let provider = ScriptedProvider::new(vec![Round::Chunks(vec![
        text("Hello "),
        text(""),
        text("there"),
        done("stop"),
    ])]);
    let tools = Arc::new(FakeTools::new());
    let orchestrator = orchestrator(provider.clone(), tools.clone(), test_config());

    let (payloads, report) = orchestrator
        .open(user_request("hi"), Credential::default())
        .await
        .expect("session opens")
        .collect()
        .await;
    let frames = decode_all(&payloads);

    assert_eq!(
        kinds(&frames),
        vec!["text_delta", "text_delta", "step_finish", "message_finish"]
    );
    assert_eq!(joined_text(&frames), "Hello there");
    let report = report.expect("report");
    assert_eq!(report.verdict, Some(AuditVerdict::Done));
    assert_eq!(report.follow_up, FollowUpOutcome::NotNeeded);
    assert!(!report.follow_up_started());
    assert_eq!(provider.requests().len(), 1);
    assert!(tools.calls().is_empty());
}

#[tokio::test]
async fn failed_tool_with_explanation_needs_no_follow_up() {
    let provider = ScriptedProvider::new(vec![
        Round::Chunks(
            [
                call(
                    "c1",
                    "update_invoice_status",
                    json!({"invoiceId": "inv_7", "status": "paid"}),
                ),
                vec![done("tool_calls")],
            ]
            .concat(),
        ),
        Round::Chunks(vec![
            text("I couldn't mark that invoice as paid."),
            done("stop"),
        ]),
    ]);
    let tools = Arc::new(FakeTools::new().with_error(
        "update_invoice_status",
        ToolError::Rejected {
            status: 409,
            message: "invoice is locked".to_string(),
        },
    ));
    let orchestrator = orchestrator(provider.clone(), tools, test_config());

    let (payloads, report) = orchestrator
        .open(user_request("mark inv_7 as paid"), Credential::default())
        .await
        .expect("session opens")
        .collect()
        .await;
    let frames = decode_all(&payloads);

    let result = frames
        .iter()
        .find_map(|(_, frame)| match frame {
            StreamFrame::ToolResult {
                output, is_error, ..
            } => Some((output.clone(), *is_error)),
            _ => None,
        })
        .expect("tool result frame");
    assert!(result.1);
    assert_eq!(result.0["error"], "rejected");
    assert_eq!(joined_text(&frames), "I couldn't mark that invoice as paid.");

    let report = report.expect("report");
    assert_eq!(report.verdict, Some(AuditVerdict::Done));
    assert_eq!(report.follow_up, FollowUpOutcome::NotNeeded);
    assert_eq!(provider.requests().len(), 2);
}

#[tokio::test]
async fn dropping_the_stream_ends_the_session_quietly() {
    let provider = ScriptedProvider::new(vec![Round::Stall(vec![text("Let me check")])]);
    let orchestrator = orchestrator(provider, Arc::new(FakeTools::new()), test_config());

    let session = orchestrator
        .open(user_request("anything new?"), Credential::default())
        .await
        .expect("session opens");
    let (mut frames, report) = session.split();
    let first = frames.next().await.expect("first frame");
    assert!(first.contains("Let me check"));
    drop(frames);

    let report = tokio::time::timeout(Duration::from_secs(5), report.wait())
        .await
        .expect("session stops after disconnect")
        .expect("report");
    assert_eq!(report.termination, Termination::ClientDisconnected);
    assert_eq!(report.phases.last(), Some(&SessionPhase::Errored));
    assert_eq!(report.verdict, None);
}

async fn read_until(frames: &mut tally_core::FrameStream, kind: &str) {
    loop {
        let payload = frames.next().await.expect("stream still open");
        let decoded = decode_all(std::slice::from_ref(&payload));
        if decoded[0].1.kind() == kind {
            return;
        }
    }
}

#[tokio::test]
async fn disconnect_after_a_tool_call_stops_before_any_text() {
    let provider = ScriptedProvider::new(vec![Round::Stall(call(
        "c1",
        "get_invoice",
        json!({"invoiceId": "inv_7"}),
    ))]);
    let tools = Arc::new(FakeTools::new().with_output("get_invoice", invoice()));
    let orchestrator = orchestrator(provider.clone(), tools, test_config());

    let session = orchestrator
        .open(user_request("what's the status of inv_7?"), Credential::default())
        .await
        .expect("session opens");
    let (mut frames, report) = session.split();
    read_until(&mut frames, "tool_call_args").await;
    drop(frames);

    let report = tokio::time::timeout(Duration::from_secs(5), report.wait())
        .await
        .expect("session stops after disconnect")
        .expect("report");
    assert_eq!(report.termination, Termination::ClientDisconnected);
    assert_eq!(
        report.phases,
        vec![
            SessionPhase::Open,
            SessionPhase::RelayingPrimary,
            SessionPhase::Errored,
        ]
    );
    assert_eq!(report.verdict, None);
    assert!(!report.follow_up_started());
    assert!(report
        .frames
        .iter()
        .all(|frame| frame.text_payload().is_none()));
    assert_eq!(provider.requests().len(), 1);
}

#[tokio::test]
async fn disconnect_during_follow_up_cancels_it() {
    let provider = ScriptedProvider::new(vec![
        Round::Chunks([call("c1", "get_invoice", json!({})), vec![done("tool_calls")]].concat()),
        Round::Chunks(vec![done("stop")]),
        Round::Stall(vec![text("Your last invoice ")]),
    ]);
    let tools = Arc::new(FakeTools::new().with_output("get_invoice", invoice()));
    let orchestrator = orchestrator(provider.clone(), tools, test_config());

    let session = orchestrator
        .open(user_request("status?"), Credential::default())
        .await
        .expect("session opens");
    let (mut frames, report) = session.split();
    read_until(&mut frames, "text_delta").await;
    drop(frames);

    let report = tokio::time::timeout(Duration::from_secs(5), report.wait())
        .await
        .expect("session stops after disconnect")
        .expect("report");
    assert_eq!(report.termination, Termination::ClientDisconnected);
    assert_eq!(report.follow_up, FollowUpOutcome::Cancelled);
    assert_eq!(
        report.phases[report.phases.len() - 2..],
        [SessionPhase::RelayingFollowUp, SessionPhase::Errored]
    );
    assert_eq!(provider.requests().len(), 3);
}

#[tokio::test]
async fn tool_results_follow_calls_in_call_order() {
    let provider = ScriptedProvider::new(vec![
        Round::Chunks(
            [
                vec![text("Checking both. ")],
                call("c1", "get_invoice", json!({"invoiceId": "inv_1"})),
                call("c2", "get_invoice", json!({"invoiceId": "inv_2"})),
                vec![done("tool_calls")],
            ]
            .concat(),
        ),
        Round::Chunks(vec![text("Both are SENT."), done("stop")]),
    ]);
    let tools = Arc::new(
        FakeTools::new()
            .with_output("get_invoice", invoice())
            .with_delay(Duration::from_millis(5)),
    );
    let orchestrator = orchestrator(provider, tools.clone(), test_config());

    let (payloads, report) = orchestrator
        .open(user_request("compare inv_1 and inv_2"), Credential::default())
        .await
        .expect("session opens")
        .collect()
        .await;
    let frames = decode_all(&payloads);

    let result_ids = frames
        .iter()
        .filter_map(|(_, frame)| match frame {
            StreamFrame::ToolResult { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(result_ids, vec!["c1", "c2"]);

    let last_call_frame = frames
        .iter()
        .rposition(|(_, f)| matches!(f, StreamFrame::ToolCallArgs { .. }))
        .expect("args frame");
    let first_result = frames
        .iter()
        .position(|(_, f)| matches!(f, StreamFrame::ToolResult { .. }))
        .expect("result frame");
    assert!(last_call_frame < first_result);

    let continued = frames
        .iter()
        .filter_map(|(_, f)| match f {
            StreamFrame::StepFinish { is_continued, .. } => Some(*is_continued),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(continued, vec![true, false]);
    assert_eq!(
        kinds(&frames).iter().filter(|k| **k == "message_finish").count(),
        1
    );
    assert_eq!(report.expect("report").tool_calls, 2);
    assert_eq!(tools.calls().len(), 2);
}

#[tokio::test]
async fn follow_up_runs_at_most_once_even_when_it_fails() {
    let provider = ScriptedProvider::new(vec![
        Round::Chunks([call("c1", "get_invoice", json!({})), vec![done("tool_calls")]].concat()),
        Round::Chunks(vec![done("stop")]),
        Round::Chunks(vec![text("   "), done("stop")]),
    ]);
    let tools = Arc::new(FakeTools::new().with_output("get_invoice", invoice()));
    let orchestrator = orchestrator(provider.clone(), tools, test_config());

    let (payloads, report) = orchestrator
        .open(user_request("status?"), Credential::default())
        .await
        .expect("session opens")
        .collect()
        .await;
    let frames = decode_all(&payloads);

    let report = report.expect("report");
    assert_eq!(
        report.follow_up,
        FollowUpOutcome::Failed {
            reason: "empty".to_string()
        }
    );
    assert_eq!(
        report
            .phases
            .iter()
            .filter(|p| **p == SessionPhase::NeedsFollowUp)
            .count(),
        1
    );
    assert_eq!(report.termination, Termination::Completed);
    assert_eq!(kinds(&frames).last(), Some(&"message_finish"));
    assert_eq!(provider.requests().len(), 3);
}

#[tokio::test]
async fn follow_up_is_abandoned_without_an_object_result() {
    let provider = ScriptedProvider::new(vec![
        Round::Chunks([call("c1", "get_invoice", json!({})), vec![done("tool_calls")]].concat()),
        Round::Chunks(vec![done("stop")]),
    ]);
    let tools = Arc::new(FakeTools::new().with_output("get_invoice", json!("SENT")));
    let orchestrator = orchestrator(provider.clone(), tools, test_config());

    let (payloads, report) = orchestrator
        .open(user_request("status?"), Credential::default())
        .await
        .expect("session opens")
        .collect()
        .await;

    let report = report.expect("report");
    assert_eq!(report.verdict, Some(AuditVerdict::NeedsFollowUp));
    assert_eq!(report.follow_up, FollowUpOutcome::Abandoned);
    assert_eq!(report.extraction, None);
    assert_eq!(report.phases.last(), Some(&SessionPhase::Closed));
    assert_eq!(
        kinds(&decode_all(&payloads)).last(),
        Some(&"message_finish")
    );
    assert_eq!(provider.requests().len(), 2);
}

#[tokio::test]
async fn failures_before_the_first_chunk_are_returned_from_open() {
    let cases = [
        (Round::FailOpen("429 Too Many Requests".to_string()), "RATE_LIMIT_EXCEEDED"),
        (
            Round::FailAfter(Vec::new(), "upstream timed out".to_string()),
            "TIMEOUT",
        ),
        (Round::Chunks(Vec::new()), "PROVIDER_EMPTY_STREAM"),
    ];
    for (round, code) in cases {
        let provider = ScriptedProvider::new(vec![round]);
        let orchestrator = orchestrator(provider, Arc::new(FakeTools::new()), test_config());
        let err = match orchestrator
            .open(user_request("hi"), Credential::default())
            .await
        {
            Ok(_) => panic!("expected {code}"),
            Err(err) => err,
        };
        assert!(matches!(err, SessionError::Backend(_)));
        assert_eq!(err.code(), code);
    }
}

#[tokio::test]
async fn mid_stream_failure_ends_with_an_error_frame() {
    let provider = ScriptedProvider::new(vec![Round::FailAfter(
        vec![text("Working on it")],
        "503 service unavailable".to_string(),
    )]);
    let orchestrator = orchestrator(provider, Arc::new(FakeTools::new()), test_config());

    let (payloads, report) = orchestrator
        .open(user_request("hi"), Credential::default())
        .await
        .expect("session opens")
        .collect()
        .await;
    let frames = decode_all(&payloads);

    assert_eq!(kinds(&frames), vec!["text_delta", "error"]);
    assert!(matches!(
        &frames[1].1,
        StreamFrame::Error { code, .. } if code == "PROVIDER_SERVER_ERROR"
    ));
    assert_eq!(
        report.expect("report").termination,
        Termination::BackendFault {
            code: "PROVIDER_SERVER_ERROR".to_string()
        }
    );
}

#[tokio::test]
async fn empty_conversation_is_rejected() {
    let provider = ScriptedProvider::new(Vec::new());
    let orchestrator = orchestrator(provider.clone(), Arc::new(FakeTools::new()), test_config());
    let request = ChatRequest {
        messages: vec![json!({"role": "robot", "content": "beep"}), json!("loose")],
        model: None,
    };
    let err = match orchestrator.open(request, Credential::default()).await {
        Ok(_) => panic!("expected rejection"),
        Err(err) => err,
    };
    assert!(matches!(err, SessionError::EmptyConversation));
    assert!(provider.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn deadline_stops_a_stalled_stream() {
    let provider = ScriptedProvider::new(vec![Round::Stall(vec![text("Thinking")])]);
    let config = OrchestratorConfig {
        generation_deadline: Duration::from_secs(2),
        ..test_config()
    };
    let orchestrator = orchestrator(provider, Arc::new(FakeTools::new()), config);

    let (payloads, report) = orchestrator
        .open(user_request("hi"), Credential::default())
        .await
        .expect("session opens")
        .collect()
        .await;
    let frames = decode_all(&payloads);

    assert_eq!(kinds(&frames), vec!["text_delta", "error"]);
    assert!(matches!(
        &frames[1].1,
        StreamFrame::Error { code, .. } if code == "DEADLINE_EXCEEDED"
    ));
    let report = report.expect("report");
    assert_eq!(report.termination, Termination::DeadlineExceeded);
    assert_eq!(report.phases.last(), Some(&SessionPhase::Errored));
}

#[tokio::test(start_paused = true)]
async fn deadline_before_the_first_chunk_fails_open() {
    let provider = ScriptedProvider::new(vec![Round::Stall(Vec::new())]);
    let config = OrchestratorConfig {
        generation_deadline: Duration::from_secs(2),
        ..test_config()
    };
    let orchestrator = orchestrator(provider, Arc::new(FakeTools::new()), config);
    let err = match orchestrator.open(user_request("hi"), Credential::default()).await {
        Ok(_) => panic!("expected deadline"),
        Err(err) => err,
    };
    assert!(matches!(err, SessionError::DeadlineExceeded));
    assert_eq!(err.code(), "DEADLINE_EXCEEDED");
}
