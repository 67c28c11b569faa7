//! Transaction-level behavior observable on the wire: retransmission
//! schedules, duplicate absorption and replay, credentialed resends, and
//! garbage collection of settled state.

use std::time::Duration;

use ferrovox_call_core::{CallError, CallEventKind, CauseCode, ConnectionState, MessageStatus};
use ferrovox_sip_types::{CSeq, Method, StatusCode, Via, BRANCH_MAGIC_COOKIE};

mod common;
use common::*;

#[tokio::test(start_paused = true)]
async fn unanswered_invite_retransmits_then_times_out() {
    let mut call = TestCall::start().await;
    let id = call.engine.dial(bob_uri()).await.unwrap();

    let invite = as_request(call.next_wire().await, Method::Invite);
    let branch = invite.branch().unwrap().to_string();
    for _ in 0..3 {
        let resend = as_request(call.next_wire().await, Method::Invite);
        assert_eq!(resend.branch().unwrap(), branch);
        assert_eq!(resend.cseq.seq, invite.cseq.seq);
    }

    // exhaustion surfaces as a timeout final, acked like any failure
    let ack = as_request(call.next_wire().await, Method::Ack);
    assert_eq!(ack.branch().unwrap(), branch);
    let end = call.wait_for(CallEventKind::Disconnected).await;
    assert_eq!(end.cause, CauseCode::Cancelled);
    let state = call.engine.connection_state(id).await.unwrap();
    assert_eq!(state, ConnectionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn invite_final_resent_until_acked() {
    let mut call = TestCall::start().await;
    let invite = inbound_invite("rtx-1");
    call.feed(invite.clone()).await;
    let _trying = as_response(call.next_wire().await, StatusCode::Trying);
    let id = call.wait_for(CallEventKind::NewCall).await.connection;
    call.wait_for(CallEventKind::Offering).await;

    call.engine.answer(id).await.unwrap();
    let ok = as_response(call.next_wire().await, StatusCode::Ok);
    let again = as_response(call.next_wire().await, StatusCode::Ok);
    assert_eq!(again.cseq.seq, ok.cseq.seq);
    assert_eq!(again.to.tag, ok.to.tag);

    call.feed(caller_request(Method::Ack, &invite, &ok, 1, "rack"))
        .await;
    call.assert_quiet(Duration::from_secs(2)).await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_invite_replays_the_final() {
    let mut call = TestCall::start().await;
    let invite = inbound_invite("dup-1");
    call.feed(invite.clone()).await;
    let _trying = as_response(call.next_wire().await, StatusCode::Trying);
    let id = call.wait_for(CallEventKind::NewCall).await.connection;
    call.wait_for(CallEventKind::Offering).await;
    call.engine.answer(id).await.unwrap();
    let ok = as_response(call.next_wire().await, StatusCode::Ok);

    call.feed(invite.clone()).await;
    let replay = as_response(call.next_wire().await, StatusCode::Ok);
    assert_eq!(replay.cseq.seq, ok.cseq.seq);
    assert_eq!(replay.to.tag, ok.to.tag);
    assert_eq!(call.engine.connection_count(), 1);

    call.feed(caller_request(Method::Ack, &invite, &ok, 1, "dack"))
        .await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_invite_before_final_ignored() {
    let mut call = TestCall::start().await;
    let invite = inbound_invite("dup-2");
    call.feed(invite.clone()).await;
    let _trying = as_response(call.next_wire().await, StatusCode::Trying);
    call.wait_for(CallEventKind::Offering).await;

    call.feed(invite.clone()).await;
    call.assert_quiet(Duration::from_millis(400)).await;
    assert_eq!(call.engine.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn credentialed_resend_renumbers_the_dialog() {
    let mut call = TestCall::start().await;
    let id = call.engine.dial(bob_uri()).await.unwrap();
    let invite = as_request(call.next_wire().await, Method::Invite);

    // the transport met a challenge itself and resent under a fresh number
    let mut retried = invite.clone();
    retried.cseq = CSeq::new(10, Method::Invite);
    retried.via = vec![Via::new(
        "192.0.2.10:5060",
        format!("{BRANCH_MAGIC_COOKIE}auth1"),
    )];
    call.feed_report(retried.clone(), MessageStatus::AuthenticationRetry)
        .await;

    call.feed(ringing_for(&retried)).await;
    call.wait_for(CallEventKind::RemoteAlerting).await;
    call.feed(answer_for(&retried, audio_answer(20000))).await;
    let ack = as_request(call.next_wire().await, Method::Ack);
    assert_eq!(ack.cseq.seq, 10);
    call.wait_for(CallEventKind::Connected).await;

    // later requests continue above the adopted number
    call.engine.hangup(id).await.unwrap();
    let bye = as_request(call.next_wire().await, Method::Bye);
    assert_eq!(bye.cseq.seq, 11);
    let end = call.wait_for(CallEventKind::Disconnected).await;
    assert_eq!(end.cause, CauseCode::Normal);
}

#[tokio::test(start_paused = true)]
async fn superseded_request_stops_retransmitting() {
    let mut call = TestCall::start().await;
    let _id = call.engine.dial(bob_uri()).await.unwrap();
    let invite = as_request(call.next_wire().await, Method::Invite);

    let mut retried = invite.clone();
    retried.cseq = CSeq::new(10, Method::Invite);
    retried.via = vec![Via::new(
        "192.0.2.10:5060",
        format!("{BRANCH_MAGIC_COOKIE}auth2"),
    )];
    call.feed_report(retried.clone(), MessageStatus::AuthenticationRetry)
        .await;
    call.feed(ringing_for(&retried)).await;
    call.wait_for(CallEventKind::RemoteAlerting).await;

    // only the adopted transaction lives; the original neither resends
    // nor times the leg out
    call.assert_quiet(Duration::from_secs(9)).await;
    assert_eq!(call.engine.transaction_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn transport_error_fails_the_leg() {
    let mut call = TestCall::start().await;
    let id = call.engine.dial(bob_uri()).await.unwrap();
    let invite = as_request(call.next_wire().await, Method::Invite);

    call.feed_report(invite, MessageStatus::TransportError).await;
    let end = call.wait_for(CallEventKind::Disconnected).await;
    assert_eq!(end.cause, CauseCode::DestNotObtainable);
    let state = call.engine.connection_state(id).await.unwrap();
    assert_eq!(state, ConnectionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn engine_stopped_refuses_new_work() {
    let call = TestCall::start().await;
    call.engine.shutdown();
    let err = call.engine.dial(bob_uri()).await;
    assert!(matches!(err, Err(CallError::EngineStopped)));
}

#[tokio::test(start_paused = true)]
async fn garbage_collection_expires_idle_state() {
    let mut call = TestCall::start().await;
    let invite = inbound_invite("gc-1");
    call.feed(invite.clone()).await;
    let _trying = as_response(call.next_wire().await, StatusCode::Trying);
    let id = call.wait_for(CallEventKind::NewCall).await.connection;
    call.wait_for(CallEventKind::Offering).await;
    call.engine.answer(id).await.unwrap();
    let ok = as_response(call.next_wire().await, StatusCode::Ok);
    call.feed(caller_request(Method::Ack, &invite, &ok, 1, "gack"))
        .await;
    call.wait_for(CallEventKind::Connected).await;
    call.feed(caller_request(Method::Bye, &invite, &ok, 2, "gbye"))
        .await;
    let _ok = as_response(call.next_wire().await, StatusCode::Ok);
    call.wait_for(CallEventKind::Disconnected).await;
    assert_eq!(call.engine.connection_count(), 1);
    assert_eq!(call.engine.transaction_count(), 2);

    // the disconnected leg and the BYE transaction age out first
    tokio::time::sleep(Duration::from_secs(60)).await;
    call.wait_for(CallEventKind::Destroyed).await;
    assert_eq!(call.engine.connection_count(), 0);
    assert_eq!(call.engine.transaction_count(), 1);

    // the INVITE transaction has the longer horizon
    tokio::time::sleep(Duration::from_secs(200)).await;
    assert_eq!(call.engine.transaction_count(), 0);
}
