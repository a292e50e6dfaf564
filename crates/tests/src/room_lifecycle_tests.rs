use std::time::Duration;

use crate::fixtures::test_app::{TestApp, WsClient};

#[tokio::test]
async fn reconnecting_patient_evicts_the_previous_one() {
    let mut app = TestApp::spawn().await;
    let (mut host, room_id, join_token, _host_session) = app.connect_host().await;

    let (mut first, _first_session) = app.connect_patient(&room_id, &join_token).await;
    let joined = host.recv_json().await;
    assert_eq!(joined["type"], "patient_joined");

    let (_second, _second_session) = app.connect_patient(&room_id, &join_token).await;

    let (code, _) = first.expect_close().await;
    assert_eq!(code, 4000);

    let status = host.recv_json().await;
    assert_eq!(status["type"], "patient_status");
    assert_eq!(status["connected"], false);
    assert_eq!(status["reason"], "evicted");
    let rejoined = host.recv_json().await;
    assert_eq!(rejoined["type"], "patient_joined");
}

#[tokio::test]
async fn patient_disconnect_notifies_host_with_reason() {
    let mut app = TestApp::spawn().await;
    let (mut host, room_id, join_token, _host_session) = app.connect_host().await;
    let (mut patient, _session) = app.connect_patient(&room_id, &join_token).await;
    assert_eq!(host.recv_json().await["type"], "patient_joined");

    patient
        .send_json(serde_json::json!({"type": "disconnect"}))
        .await;

    let status = host.recv_json().await;
    assert_eq!(status["type"], "patient_status");
    assert_eq!(status["connected"], false);
    assert_eq!(status["reason"], "disconnect");
}

#[tokio::test]
async fn room_survives_patient_leaving_and_accepts_a_new_one() {
    let mut app = TestApp::spawn().await;
    let (mut host, room_id, join_token, _host_session) = app.connect_host().await;

    let (mut patient, _s1) = app.connect_patient(&room_id, &join_token).await;
    assert_eq!(host.recv_json().await["type"], "patient_joined");
    patient
        .send_json(serde_json::json!({"type": "disconnect"}))
        .await;
    assert_eq!(host.recv_json().await["type"], "patient_status");

    // Same credentials still admit a new patient.
    let (_patient2, _s2) = app.connect_patient(&room_id, &join_token).await;
    assert_eq!(host.recv_json().await["type"], "patient_joined");
}

#[tokio::test]
async fn host_done_tears_down_the_room() {
    let mut app = TestApp::spawn().await;
    let (mut host, room_id, join_token, _host_session) = app.connect_host().await;
    let (mut patient, _session) = app.connect_patient(&room_id, &join_token).await;
    assert_eq!(host.recv_json().await["type"], "patient_joined");

    host.send_json(serde_json::json!({"type": "done"})).await;

    let (code, _) = patient.expect_close().await;
    assert_eq!(code, 1000);

    // The room is gone: rejoining fails.
    let mut ws = WsClient::connect(&app.patient_url()).await;
    ws.send_json(serde_json::json!({
        "type": "hello_patient",
        "roomId": room_id,
        "joinToken": join_token,
        "mimeType": "audio/pcm",
        "sampleRate": 16000,
    }))
    .await;
    let error = ws.recv_json().await;
    assert_eq!(error["message"], "Room no existe o expiró");
}

#[tokio::test]
async fn disconnect_from_host_is_rejected_without_closing() {
    let mut app = TestApp::spawn().await;
    let (mut host, _room_id, _join_token, mut session) = app.connect_host().await;

    host.send_json(serde_json::json!({"type": "disconnect"}))
        .await;
    assert_eq!(host.recv_json().await["type"], "error");

    host.send_binary(vec![3u8; 320]).await;
    assert_eq!(session.next_audio().await, vec![3u8; 320]);
}

#[tokio::test]
async fn idle_room_is_garbage_collected() {
    let mut app = TestApp::spawn_with_settings(|s| {
        s.live.room_ttl_ms = 200;
        s.live.sweep_interval_ms = 50;
    })
    .await;
    let (mut host, _room_id, _join_token, _session) = app.connect_host().await;

    // No traffic: the sweeper reaps the room and closes the host socket.
    let (code, _) = host.expect_close().await;
    assert_eq!(code, 1000);
}

#[tokio::test]
async fn traffic_keeps_a_room_alive_past_the_ttl() {
    let mut app = TestApp::spawn_with_settings(|s| {
        s.live.room_ttl_ms = 300;
        s.live.sweep_interval_ms = 50;
    })
    .await;
    let (mut host, _room_id, _join_token, mut session) = app.connect_host().await;

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        host.send_binary(vec![0u8; 32]).await;
        let _ = session.next_audio().await;
    }

    // Still connected: a protocol ping gets its pong.
    host.send_json(serde_json::json!({"type": "ping", "ts": 42}))
        .await;
    let pong = host.recv_json().await;
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["ts"], 42);
}

#[tokio::test]
async fn unresponsive_peer_is_reaped_by_heartbeat() {
    let mut app = TestApp::spawn_with_settings(|s| {
        s.live.heartbeat_interval_ms = 100;
        s.live.heartbeat_max_missed = 2;
    })
    .await;
    let (mut host, _room_id, _join_token, _session) = app.connect_host().await;

    // expect_close never answers the relay's pings.
    let (code, _) = host.expect_close().await;
    assert_eq!(code, 4008);
}

#[tokio::test]
async fn reaping_the_host_tears_the_room_down_immediately() {
    let mut app = TestApp::spawn_with_settings(|s| {
        s.live.heartbeat_interval_ms = 100;
        s.live.heartbeat_max_missed = 2;
    })
    .await;
    // Connect and then go silent without ever reading: the peer never
    // completes the close handshake, so teardown must not depend on it.
    let (_host, _room_id, _join_token, _session) = app.connect_host().await;

    tokio::time::sleep(Duration::from_secs(2)).await;

    let health: serde_json::Value = app
        .client
        .get(app.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["rooms"], 0);
    assert_eq!(health["connections"], 0);
}

#[tokio::test]
async fn timed_out_patient_is_reported_to_host_with_reason() {
    let mut app = TestApp::spawn_with_settings(|s| {
        s.live.heartbeat_interval_ms = 100;
        s.live.heartbeat_max_missed = 2;
    })
    .await;
    let (mut host, room_id, join_token, _host_session) = app.connect_host().await;
    let (_patient, _session) = app.connect_patient(&room_id, &join_token).await;
    assert_eq!(host.recv_json().await["type"], "patient_joined");

    // The patient stops answering; the host keeps replying to pings via
    // recv_json and must learn about the reaping.
    let status = host.recv_json().await;
    assert_eq!(status["type"], "patient_status");
    assert_eq!(status["connected"], false);
    assert_eq!(status["reason"], "timeout");
}

#[tokio::test]
async fn health_reports_room_and_connection_counts() {
    let mut app = TestApp::spawn().await;

    let before: serde_json::Value = app
        .client
        .get(app.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(before["status"], "ok");
    assert_eq!(before["rooms"], 0);

    let (_host, room_id, join_token, _hs) = app.connect_host().await;
    let (_patient, _ps) = app.connect_patient(&room_id, &join_token).await;

    let after: serde_json::Value = app
        .client
        .get(app.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(after["rooms"], 1);
    assert_eq!(after["connections"], 2);
}
