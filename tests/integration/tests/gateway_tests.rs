//! Gateway Integration Tests
//!
//! Drive a real client against the in-process fake gateway over loopback
//! WebSockets. No external services are needed.
//!
//! Run with: cargo test -p integration-tests --test gateway_tests

use chatlink_gateway::{
    DispatchEvent, FatalError, GatewayConfig, GatewayError, GatewayEvent, GatewayEventType, GatewayStatus,
    IdentifyRateLimiter, Intents, Snowflake, StdIdentifyRateLimiter,
};
use integration_tests::{
    close_both, eventually, gateway_client, gateway_client_parts, gateway_client_with, FakeGateway, RecordingVoice,
    TEST_TOKEN,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const GUILD_ID: u64 = 41_771_983_423_143_937;
const LONG_HEARTBEAT_MS: u64 = 45_000;

fn is_ready(event: &chatlink_gateway::ShardEvent) -> bool {
    matches!(&event.event, GatewayEvent::Dispatch(DispatchEvent::Ready(_)))
}

// ============================================================================
// Handshake Tests
// ============================================================================

#[tokio::test]
async fn test_identify_then_ready() {
    let mut gateway = FakeGateway::start().await.unwrap();
    let mut client = gateway_client(&gateway.url());

    client.manager.open().await.unwrap();
    let mut session = gateway.next_session().await.unwrap();

    assert_eq!(session.path(), "/");
    assert_eq!(session.query(), "v=10&encoding=json");
    assert!(!session.is_compressed());

    session.hello(LONG_HEARTBEAT_MS).await.unwrap();
    let identify = session.recv_op(2).await.unwrap();
    let d = &identify["d"];
    assert_eq!(d["token"], TEST_TOKEN);
    assert_eq!(d["intents"], Intents::default().bits());
    assert_eq!(d["large_threshold"], 250);
    assert_eq!(d["compress"], false);
    assert_eq!(d["properties"]["$browser"], "chatlink");
    assert!(d.get("shard").is_none());

    session.ready("sess-1", None).await.unwrap();

    let connected = client.next_event().await.unwrap();
    assert!(matches!(connected.event, GatewayEvent::Connected));
    assert_eq!(connected.shard_id, 0);

    let ready = client.wait_event(is_ready).await.unwrap();
    match ready.event {
        GatewayEvent::Dispatch(DispatchEvent::Ready(ready)) => {
            assert_eq!(ready.session_id, "sess-1");
            assert_eq!(ready.user.username, "chatlink-test");
            assert_eq!(ready.guilds.len(), 1);
        }
        other => panic!("expected READY, got {other:?}"),
    }

    assert_eq!(client.manager.status(), GatewayStatus::Ready);
    let info = client.manager.session_info();
    assert_eq!(info.session_id.as_deref(), Some("sess-1"));
    assert_eq!(info.sequence, 1);

    assert_eq!(close_both(&client.manager, &mut session).await.unwrap(), Some(4000));
}

#[tokio::test]
async fn test_shard_sent_only_when_sharded() {
    let mut gateway = FakeGateway::start().await.unwrap();
    let client = gateway_client_with(
        GatewayConfig::new(TEST_TOKEN)
            .with_url(gateway.url())
            .with_compress(false)
            .with_shard(1, 2)
            .with_intents(Intents::GUILDS | Intents::GUILD_VOICE_STATES),
    );

    client.manager.open().await.unwrap();
    let mut session = gateway.next_session().await.unwrap();

    let identify = session.recv_op(2).await.unwrap();
    assert_eq!(identify["d"]["shard"], json!([1, 2]));
    assert_eq!(
        identify["d"]["intents"],
        (Intents::GUILDS | Intents::GUILD_VOICE_STATES).bits()
    );

    assert_eq!(close_both(&client.manager, &mut session).await.unwrap(), Some(4000));
}

#[tokio::test]
async fn test_compressed_stream_split_frames() {
    let mut gateway = FakeGateway::start().await.unwrap();
    let mut client = gateway_client_with(
        GatewayConfig::new(TEST_TOKEN)
            .with_url(gateway.url())
            .with_compress(true),
    );

    client.manager.open().await.unwrap();
    let mut session = gateway.next_session().await.unwrap();
    assert_eq!(session.query(), "v=10&encoding=json&compress=zlib-stream");
    assert!(session.is_compressed());

    session.hello(LONG_HEARTBEAT_MS).await.unwrap();
    session.recv_op(2).await.unwrap();

    // READY arrives in three binary frames; only the last ends with the flush marker
    let ready = json!({
        "op": 0,
        "s": 1,
        "t": "READY",
        "d": {
            "v": 10,
            "user": { "id": "80351110224678912", "username": "chatlink-test" },
            "guilds": [],
            "session_id": "compressed-session",
        }
    });
    session.send_json_split(&ready, 3).await.unwrap();
    session
        .send_json(&json!({ "op": 0, "s": 2, "t": "TYPING_START", "d": { "user_id": "7" } }))
        .await
        .unwrap();

    client.wait_event(is_ready).await.unwrap();
    let typing = client
        .wait_event(|e| matches!(&e.event, GatewayEvent::Dispatch(d) if d.kind() == GatewayEventType::TypingStart))
        .await
        .unwrap();
    match typing.event {
        GatewayEvent::Dispatch(DispatchEvent::Other { data, .. }) => assert_eq!(data["user_id"], "7"),
        other => panic!("expected TYPING_START, got {other:?}"),
    }

    assert_eq!(client.manager.session_info().sequence, 1);
    eventually("sequence 2", || {
        client.manager.current_connection().is_some_and(|c| c.sequence() == 2)
    })
    .await
    .unwrap();

    assert_eq!(close_both(&client.manager, &mut session).await.unwrap(), Some(4000));
}

#[tokio::test]
async fn test_unknown_opcode_is_ignored() {
    let mut gateway = FakeGateway::start().await.unwrap();
    let mut client = gateway_client(&gateway.url());

    client.manager.open().await.unwrap();
    let mut session = gateway.next_session().await.unwrap();
    session.hello(LONG_HEARTBEAT_MS).await.unwrap();
    session.recv_op(2).await.unwrap();
    session.ready("sess-1", None).await.unwrap();
    client.wait_event(is_ready).await.unwrap();

    session.send_json(&json!({ "op": 256, "d": null })).await.unwrap();
    session.send_json(&json!({ "op": 99, "d": { "x": 1 } })).await.unwrap();

    gateway.expect_no_session(Duration::from_millis(800)).await.unwrap();
    assert_eq!(client.manager.status(), GatewayStatus::Ready);
    assert_eq!(client.manager.current_connection().map(|c| c.conn_id()), Some(1));

    assert_eq!(close_both(&client.manager, &mut session).await.unwrap(), Some(4000));
}

// ============================================================================
// Reconnect Tests
// ============================================================================

#[tokio::test]
async fn test_reconnect_opcode_resumes_on_resume_url() {
    let mut gateway = FakeGateway::start().await.unwrap();
    let mut client = gateway_client(&gateway.url());
    let guild = Snowflake::new(GUILD_ID);
    let voice = RecordingVoice::new(guild);

    client.manager.open().await.unwrap();
    let mut first = gateway.next_session().await.unwrap();
    first.hello(LONG_HEARTBEAT_MS).await.unwrap();
    first.recv_op(2).await.unwrap();

    let resume_url = format!("{}/resume", gateway.url());
    first.ready("sess-1", Some(&resume_url)).await.unwrap();
    client.wait_event(is_ready).await.unwrap();

    client
        .manager
        .channel_voice_join(guild, Snowflake::new(7), false, false, voice.clone())
        .await
        .unwrap();
    first.recv_op(4).await.unwrap();
    assert_eq!(voice.rebinds(), 1);

    first.dispatch("TYPING_START", json!({ "user_id": "7" })).await.unwrap();
    first.send_op(7, json!(null)).await.unwrap();

    assert_eq!(first.expect_close().await.unwrap(), Some(4000));

    let mut second = gateway.next_session().await.unwrap();
    assert_eq!(second.path(), "/resume/");
    let resume = second.recv_op(6).await.unwrap();
    assert_eq!(resume["d"]["token"], TEST_TOKEN);
    assert_eq!(resume["d"]["session_id"], "sess-1");
    assert_eq!(resume["d"]["seq"], 2);

    second.dispatch("RESUMED", json!({})).await.unwrap();
    eventually("ready after resume", || client.manager.status() == GatewayStatus::Ready)
        .await
        .unwrap();
    eventually("voice re-pointed", || voice.rebinds() == 2).await.unwrap();
    assert_eq!(client.manager.current_connection().unwrap().conn_id(), 2);

    assert_eq!(close_both(&client.manager, &mut second).await.unwrap(), Some(4000));
}

#[tokio::test]
async fn test_forced_reconnect_identifies_again() {
    let mut gateway = FakeGateway::start().await.unwrap();
    let mut client = gateway_client(&gateway.url());

    client.manager.open().await.unwrap();
    let mut first = gateway.next_session().await.unwrap();
    first.recv_op(2).await.unwrap();
    first.ready("sess-1", None).await.unwrap();
    client.wait_event(is_ready).await.unwrap();

    let reconnect = {
        let manager = client.manager.clone();
        tokio::spawn(async move { manager.reconnect(true).await })
    };

    assert_eq!(first.expect_close().await.unwrap(), Some(4000));
    let mut second = gateway.next_session().await.unwrap();
    let identify = second.recv_op(2).await.unwrap();
    assert_eq!(identify["d"]["token"], TEST_TOKEN);

    reconnect.await.unwrap().unwrap();
    assert_eq!(client.manager.session_info().session_id, None);

    assert_eq!(close_both(&client.manager, &mut second).await.unwrap(), Some(4000));
}

#[tokio::test]
async fn test_close_keeps_session_for_resume() {
    let mut gateway = FakeGateway::start().await.unwrap();
    let mut client = gateway_client(&gateway.url());

    client.manager.open().await.unwrap();
    let mut first = gateway.next_session().await.unwrap();
    first.recv_op(2).await.unwrap();
    first.ready("sess-keep", None).await.unwrap();
    first.dispatch("TYPING_START", json!({ "user_id": "7" })).await.unwrap();
    client
        .wait_event(|e| matches!(&e.event, GatewayEvent::Dispatch(d) if d.kind() == GatewayEventType::TypingStart))
        .await
        .unwrap();

    let close = {
        let manager = client.manager.clone();
        tokio::spawn(async move { manager.close().await })
    };
    assert_eq!(first.expect_close().await.unwrap(), Some(4000));
    close.await.unwrap();

    assert!(client.manager.current_connection().is_none());
    assert_eq!(client.manager.status(), GatewayStatus::Disconnected);
    let info = client.manager.session_info();
    assert_eq!(info.session_id.as_deref(), Some("sess-keep"));
    assert_eq!(info.sequence, 2);

    client.manager.open().await.unwrap();
    let mut second = gateway.next_session().await.unwrap();
    let resume = second.recv_op(6).await.unwrap();
    assert_eq!(resume["d"]["session_id"], "sess-keep");
    assert_eq!(resume["d"]["seq"], 2);

    assert_eq!(close_both(&client.manager, &mut second).await.unwrap(), Some(4000));
}

#[tokio::test]
async fn test_invalid_session_identifies_again() {
    let mut gateway = FakeGateway::start().await.unwrap();
    let mut client = gateway_client(&gateway.url());

    client.manager.open().await.unwrap();
    let mut first = gateway.next_session().await.unwrap();
    first.recv_op(2).await.unwrap();
    first.ready("sess-1", None).await.unwrap();
    client.wait_event(is_ready).await.unwrap();

    first.send_op(9, json!(false)).await.unwrap();

    // The client waits 1-4s before reconnecting
    assert_eq!(first.expect_close().await.unwrap(), Some(4000));
    let mut second = gateway.next_session().await.unwrap();
    second.recv_op(2).await.unwrap();

    assert_eq!(close_both(&client.manager, &mut second).await.unwrap(), Some(4000));
}

#[tokio::test]
async fn test_missed_ack_reconnects_with_resume() {
    let mut gateway = FakeGateway::start().await.unwrap();
    let mut client = gateway_client(&gateway.url());

    client.manager.open().await.unwrap();
    let mut first = gateway.next_session().await.unwrap();
    first.recv_op(2).await.unwrap();
    first.hello(200).await.unwrap();
    first.ready("sess-1", None).await.unwrap();
    client.wait_event(is_ready).await.unwrap();

    // Never acknowledge; the second tick finds the first beat unanswered
    assert_eq!(first.expect_close().await.unwrap(), Some(4000));

    let mut second = gateway.next_session().await.unwrap();
    let resume = second.recv_op(6).await.unwrap();
    assert_eq!(resume["d"]["session_id"], "sess-1");
    assert_eq!(resume["d"]["seq"], 1);

    assert_eq!(close_both(&client.manager, &mut second).await.unwrap(), Some(4000));
}

#[tokio::test]
async fn test_heartbeat_on_request_and_ack() {
    let mut gateway = FakeGateway::start().await.unwrap();
    let mut client = gateway_client(&gateway.url());

    client.manager.open().await.unwrap();
    let mut session = gateway.next_session().await.unwrap();
    session.recv_op(2).await.unwrap();
    session.ready("sess-1", None).await.unwrap();
    client.wait_event(is_ready).await.unwrap();

    session.send_op(1, json!(null)).await.unwrap();
    let beat = session.recv_op(1).await.unwrap();
    assert_eq!(beat["d"], 1);

    session.heartbeat_ack().await.unwrap();
    eventually("ack recorded", || client.manager.heartbeat_stats().1.is_some())
        .await
        .unwrap();
    assert!(client.manager.heartbeat_stats().0.is_some());

    assert_eq!(close_both(&client.manager, &mut session).await.unwrap(), Some(4000));
}

// ============================================================================
// Shutdown Tests
// ============================================================================

#[tokio::test]
async fn test_close_bounded_when_sink_is_full() {
    let mut gateway = FakeGateway::start().await.unwrap();
    let limiter = Arc::new(StdIdentifyRateLimiter::new(Duration::from_millis(10)));
    // One slot that is never drained: Connected fills it, READY parks the reader
    let client = gateway_client_parts(
        GatewayConfig::new(TEST_TOKEN)
            .with_url(gateway.url())
            .with_compress(false),
        limiter,
        1,
    );

    client.manager.open().await.unwrap();
    let mut session = gateway.next_session().await.unwrap();
    session.hello(LONG_HEARTBEAT_MS).await.unwrap();
    session.recv_op(2).await.unwrap();
    session.ready("sess-full", None).await.unwrap();
    eventually("ready", || client.manager.status() == GatewayStatus::Ready)
        .await
        .unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(8), close_both(&client.manager, &mut session))
        .await
        .expect("close returned within its bound");
    assert_eq!(closed.unwrap(), Some(4000));
    assert!(client.manager.current_connection().is_none());
    assert_eq!(client.manager.session_info().session_id.as_deref(), Some("sess-full"));
}

#[tokio::test]
async fn test_close_interrupts_identify_wait() {
    let mut gateway = FakeGateway::start().await.unwrap();
    let limiter = Arc::new(StdIdentifyRateLimiter::new(Duration::from_secs(60)));
    // Another shard already took the only identify slot for the next minute
    limiter.wait(1).await;
    let mut client = gateway_client_parts(
        GatewayConfig::new(TEST_TOKEN)
            .with_url(gateway.url())
            .with_compress(false),
        limiter,
        64,
    );

    let opening = tokio::spawn(client.manager.open());
    let mut session = gateway.next_session().await.unwrap();
    let connected = client.next_event().await.unwrap();
    assert!(matches!(connected.event, GatewayEvent::Connected));

    assert_eq!(close_both(&client.manager, &mut session).await.unwrap(), Some(4000));

    let opened = tokio::time::timeout(Duration::from_secs(2), opening)
        .await
        .expect("open gave up once closed")
        .unwrap();
    assert!(matches!(opened, Err(GatewayError::Closed)));
}

// ============================================================================
// Fatal Close Tests
// ============================================================================

#[tokio::test]
async fn test_fatal_close_latches() {
    let mut gateway = FakeGateway::start().await.unwrap();
    let client = gateway_client(&gateway.url());

    client.manager.open().await.unwrap();
    let mut session = gateway.next_session().await.unwrap();
    session.recv_op(2).await.unwrap();
    session.close_with(4004, "Authentication failed.").await.unwrap();

    eventually("fatal latch", || client.manager.fatal_error() == Some(FatalError::BadAuth))
        .await
        .unwrap();

    let err = client.manager.open().await.unwrap_err();
    assert_eq!(err.fatal(), Some(FatalError::BadAuth));
    let err = client.manager.reconnect(false).await;
    assert!(err.is_ok() || err.is_err_and(|e| e.fatal() == Some(FatalError::BadAuth)));

    gateway.expect_no_session(Duration::from_millis(500)).await.unwrap();
}

#[tokio::test]
async fn test_non_fatal_close_reconnects() {
    let mut gateway = FakeGateway::start().await.unwrap();
    let mut client = gateway_client(&gateway.url());

    client.manager.open().await.unwrap();
    let mut first = gateway.next_session().await.unwrap();
    first.recv_op(2).await.unwrap();
    first.ready("sess-1", None).await.unwrap();
    client.wait_event(is_ready).await.unwrap();

    first.close_with(4000, "Unknown error").await.unwrap();

    let mut second = gateway.next_session().await.unwrap();
    let resume = second.recv_op(6).await.unwrap();
    assert_eq!(resume["d"]["session_id"], "sess-1");
    assert_eq!(client.manager.fatal_error(), None);

    assert_eq!(close_both(&client.manager, &mut second).await.unwrap(), Some(4000));
}

// ============================================================================
// Command Tests
// ============================================================================

#[tokio::test]
async fn test_commands_held_until_ready() {
    let mut gateway = FakeGateway::start().await.unwrap();
    let client = gateway_client(&gateway.url());

    client.manager.open().await.unwrap();
    let mut session = gateway.next_session().await.unwrap();
    session.recv_op(2).await.unwrap();

    client
        .manager
        .update_playing_status("chess", "online")
        .await
        .unwrap();
    session.expect_silence(Duration::from_millis(800)).await.unwrap();

    session.ready("sess-1", None).await.unwrap();
    let status = session.recv_op(3).await.unwrap();
    assert_eq!(status["d"]["status"], "online");
    assert_eq!(status["d"]["game"]["name"], "chess");
    assert_eq!(status["d"]["game"]["type"], 0);
    assert_eq!(status["d"]["afk"], false);

    assert_eq!(close_both(&client.manager, &mut session).await.unwrap(), Some(4000));
}

#[tokio::test]
async fn test_member_requests_and_voice_state() {
    let mut gateway = FakeGateway::start().await.unwrap();
    let mut client = gateway_client(&gateway.url());
    let guild = Snowflake::new(GUILD_ID);

    client.manager.open().await.unwrap();
    let mut session = gateway.next_session().await.unwrap();
    session.recv_op(2).await.unwrap();
    session.ready("sess-1", None).await.unwrap();
    client.wait_event(is_ready).await.unwrap();

    client.manager.request_guild_members(guild, "ab", 10).await.unwrap();
    let request = session.recv_op(8).await.unwrap();
    assert_eq!(request["d"]["guild_id"], GUILD_ID.to_string());
    assert_eq!(request["d"]["query"], "ab");
    assert_eq!(request["d"]["limit"], 10);
    assert!(!request["d"]["nonce"].as_str().unwrap().is_empty());

    client
        .manager
        .request_guild_member_by_id(guild, Snowflake::new(80_351_110_224_678_912), 1)
        .await
        .unwrap();
    let request = session.recv_op(8).await.unwrap();
    assert_eq!(request["d"]["user_ids"], json!(["80351110224678912"]));

    let voice = RecordingVoice::new(guild);
    let joined = client
        .manager
        .channel_voice_join(guild, Snowflake::new(99), false, true, voice.clone())
        .await
        .unwrap();
    assert_eq!(joined.guild_id(), guild);
    assert!(client.manager.voice_connection(guild).is_some());

    let join = session.recv_op(4).await.unwrap();
    assert_eq!(join["d"]["guild_id"], GUILD_ID.to_string());
    assert_eq!(join["d"]["channel_id"], "99");
    assert_eq!(join["d"]["self_mute"], false);
    assert_eq!(join["d"]["self_deaf"], true);

    client.manager.channel_voice_leave(guild).await.unwrap();
    let leave = session.recv_op(4).await.unwrap();
    assert!(leave["d"]["channel_id"].is_null());
    assert_eq!(leave["d"]["self_mute"], true);
    assert_eq!(leave["d"]["self_deaf"], true);
    assert!(client.manager.voice_connection(guild).is_none());

    // Only one registration per guild
    assert_eq!(Arc::strong_count(&voice), 1);

    assert_eq!(close_both(&client.manager, &mut session).await.unwrap(), Some(4000));
}
