//! Mid-call renegotiation: hold and resume in both directions, glare
//! backoff, and a refused re-INVITE leaving the session intact.

use std::sync::atomic::Ordering;
use std::time::Duration;

use ferrovox_call_core::{CallEventKind, CauseCode, ConnectionState, MessageStatus};
use ferrovox_sip_types::{Body, Method, StatusCode};

mod common;
use common::*;

#[tokio::test(start_paused = true)]
async fn hold_and_resume_round_trip() {
    let mut call = TestCall::start().await;
    let (id, _invite) = call.establish_outbound().await;
    assert!(call.media.sending.load(Ordering::SeqCst));

    call.engine.hold(id).await.unwrap();
    let reinvite = as_request(call.next_wire().await, Method::Invite);
    assert_eq!(reinvite.cseq.seq, 2);
    assert!(reinvite.to.tag.is_some());
    assert!(reinvite.body.session().unwrap().is_hold());

    call.feed(answer_for(&reinvite, audio_answer(20000))).await;
    let _ack = as_request(call.next_wire().await, Method::Ack);
    let held = call.wait_for(CallEventKind::Held).await;
    assert_eq!(held.cause, CauseCode::Normal);
    assert!(!call.media.sending.load(Ordering::SeqCst));

    call.engine.off_hold(id).await.unwrap();
    let resume = as_request(call.next_wire().await, Method::Invite);
    assert_eq!(resume.cseq.seq, 3);
    assert!(!resume.body.session().unwrap().is_hold());

    call.feed(answer_for(&resume, audio_answer(20000))).await;
    let _ack = as_request(call.next_wire().await, Method::Ack);
    let bridged = call.wait_for(CallEventKind::Bridged).await;
    assert_eq!(bridged.cause, CauseCode::Normal);
    assert!(call.media.sending.load(Ordering::SeqCst));
    let state = call.engine.connection_state(id).await.unwrap();
    assert_eq!(state, ConnectionState::Established);
}

#[tokio::test(start_paused = true)]
async fn remote_hold_and_resume() {
    let mut call = TestCall::start().await;
    let (id, invite) = call.establish_outbound().await;

    let hold = remote_request(Method::Invite, &invite, 5, "hold5")
        .with_body(Body::Session(hold_answer()));
    call.feed(hold).await;
    let ok = as_response(call.next_wire().await, StatusCode::Ok);
    assert!(ok.contact.is_some());
    assert!(ok.body.session().is_some());
    call.wait_for(CallEventKind::RemoteHeld).await;
    assert!(!call.media.sending.load(Ordering::SeqCst));

    // the ACK reopens the gate for the next offer
    call.feed(remote_request(Method::Ack, &invite, 5, "hack5"))
        .await;

    let resume = remote_request(Method::Invite, &invite, 6, "res6")
        .with_body(Body::Session(audio_answer(20000)));
    call.feed(resume).await;
    let ok = as_response(call.next_wire().await, StatusCode::Ok);
    assert!(ok.body.session().is_some());
    call.wait_for(CallEventKind::Bridged).await;
    assert!(call.media.sending.load(Ordering::SeqCst));
    let state = call.engine.connection_state(id).await.unwrap();
    assert_eq!(state, ConnectionState::Established);
}

#[tokio::test(start_paused = true)]
async fn reinvite_before_ack_answered_491() {
    let mut call = TestCall::start().await;
    let (_id, invite) = call.establish_outbound().await;

    let hold = remote_request(Method::Invite, &invite, 5, "hold5")
        .with_body(Body::Session(hold_answer()));
    call.feed(hold).await;
    let _ok = as_response(call.next_wire().await, StatusCode::Ok);
    call.wait_for(CallEventKind::RemoteHeld).await;

    // second offer without acking the first
    let early = remote_request(Method::Invite, &invite, 6, "res6")
        .with_body(Body::Session(audio_answer(20000)));
    call.feed(early).await;
    let pending = as_response(call.next_wire().await, StatusCode::RequestPending);
    assert_eq!(pending.cseq.seq, 6);
}

#[tokio::test(start_paused = true)]
async fn glare_backs_off_and_retries() {
    let mut call = TestCall::start().await;
    let (id, _invite) = call.establish_outbound().await;

    call.engine.hold(id).await.unwrap();
    let reinvite = as_request(call.next_wire().await, Method::Invite);
    assert_eq!(reinvite.cseq.seq, 2);

    call.feed(reply(StatusCode::RequestPending, &reinvite)).await;
    let retried = as_request(call.next_wire().await, Method::Invite);
    assert_eq!(retried.cseq.seq, 3);
    assert_ne!(retried.branch().unwrap(), reinvite.branch().unwrap());
    assert!(retried.body.session().unwrap().is_hold());

    call.feed(answer_for(&retried, audio_answer(20000))).await;
    let _ack = as_request(call.next_wire().await, Method::Ack);
    let held = call.wait_for(CallEventKind::Held).await;
    assert_eq!(held.cause, CauseCode::Normal);
}

#[tokio::test(start_paused = true)]
async fn refused_reinvite_keeps_session() {
    let mut call = TestCall::start().await;
    let (id, _invite) = call.establish_outbound().await;

    call.engine.hold(id).await.unwrap();
    let reinvite = as_request(call.next_wire().await, Method::Invite);
    call.feed(reply(StatusCode::NotAcceptableHere, &reinvite))
        .await;

    let ack = as_request(call.next_wire().await, Method::Ack);
    assert_eq!(ack.branch().unwrap(), reinvite.branch().unwrap());
    assert_eq!(ack.uri, reinvite.uri);

    let state = call.engine.connection_state(id).await.unwrap();
    assert_eq!(state, ConnectionState::Established);
    call.assert_quiet(Duration::from_secs(2)).await;
    assert!(call.events.try_recv().is_err());

    // the leg can be held again on a fresh number
    call.engine.hold(id).await.unwrap();
    let again = as_request(call.next_wire().await, Method::Invite);
    assert_eq!(again.cseq.seq, 3);
    assert!(again.body.session().unwrap().is_hold());
}

#[tokio::test(start_paused = true)]
async fn session_timer_refreshes_the_offer() {
    let mut call = TestCall::start().await;
    let (id, invite) = call.establish_outbound().await;

    call.feed_report(invite.clone(), MessageStatus::SessionReinviteTimer)
        .await;
    let refresh = as_request(call.next_wire().await, Method::Invite);
    assert_eq!(refresh.cseq.seq, 2);
    assert!(refresh.to.tag.is_some());
    assert!(!refresh.body.session().unwrap().is_hold());

    // only one renegotiation can be in flight
    assert!(call.engine.hold(id).await.is_err());

    call.feed(answer_for(&refresh, audio_answer(20000))).await;
    let _ack = as_request(call.next_wire().await, Method::Ack);
    call.assert_quiet(Duration::from_millis(400)).await;
    assert!(call.events.try_recv().is_err());
    let state = call.engine.connection_state(id).await.unwrap();
    assert_eq!(state, ConnectionState::Established);
}
