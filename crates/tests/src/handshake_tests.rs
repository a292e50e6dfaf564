use crate::fixtures::test_app::{TestApp, WsClient, sign_expired_token};

#[tokio::test]
async fn host_hello_creates_room_with_join_token() {
    let mut app = TestApp::spawn().await;

    let mut ws = WsClient::connect(&app.host_url()).await;
    ws.send_json(serde_json::json!({
        "type": "hello",
        "token": app.access_token("dr-garcia"),
        "mimeType": "audio/pcm",
        "sampleRate": 16000,
    }))
    .await;

    let ready = ws.recv_json().await;
    assert_eq!(ready["type"], "ready");
    assert_eq!(ready["role"], "host");
    assert!(!ready["roomId"].as_str().unwrap().is_empty());
    assert!(!ready["joinToken"].as_str().unwrap().is_empty());
    assert_ne!(ready["roomId"], ready["joinToken"]);

    // The pipeline opened a recognizer session for the host.
    let _session = app.next_session().await;
}

#[tokio::test]
async fn host_with_invalid_token_is_rejected() {
    let app = TestApp::spawn().await;

    let mut ws = WsClient::connect(&app.host_url()).await;
    ws.send_json(serde_json::json!({
        "type": "hello",
        "token": "definitely-not-a-jwt",
        "mimeType": "audio/pcm",
        "sampleRate": 16000,
    }))
    .await;

    let error = ws.recv_json().await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["message"], "token inválido");
    let (code, _) = ws.expect_close().await;
    assert_eq!(code, 4001);
}

#[tokio::test]
async fn host_with_expired_token_is_rejected() {
    let app = TestApp::spawn().await;

    let mut ws = WsClient::connect(&app.host_url()).await;
    ws.send_json(serde_json::json!({
        "type": "hello",
        "token": sign_expired_token(&app.settings, "dr-garcia"),
        "mimeType": "audio/pcm",
        "sampleRate": 16000,
    }))
    .await;

    let error = ws.recv_json().await;
    assert_eq!(error["message"], "token inválido");
    let (code, _) = ws.expect_close().await;
    assert_eq!(code, 4001);
}

#[tokio::test]
async fn first_control_frame_must_be_hello() {
    let app = TestApp::spawn().await;

    let mut ws = WsClient::connect(&app.host_url()).await;
    ws.send_json(serde_json::json!({"type": "ping", "ts": 1})).await;

    let (code, _) = ws.expect_close().await;
    assert_eq!(code, 4002);
}

#[tokio::test]
async fn malformed_handshake_json_closes_socket() {
    let app = TestApp::spawn().await;

    let mut ws = WsClient::connect(&app.host_url()).await;
    ws.send_text("this is not json").await;

    let (code, _) = ws.expect_close().await;
    assert_eq!(code, 4002);
}

#[tokio::test]
async fn patient_hello_on_host_endpoint_is_a_protocol_error() {
    let app = TestApp::spawn().await;

    let mut ws = WsClient::connect(&app.host_url()).await;
    ws.send_json(serde_json::json!({
        "type": "hello_patient",
        "roomId": "r",
        "joinToken": "t",
        "mimeType": "audio/pcm",
        "sampleRate": 16000,
    }))
    .await;

    let (code, _) = ws.expect_close().await;
    assert_eq!(code, 4002);
}

#[tokio::test]
async fn binary_frames_before_hello_are_dropped_silently() {
    let mut app = TestApp::spawn().await;

    let mut ws = WsClient::connect(&app.host_url()).await;
    ws.send_binary(vec![0u8; 640]).await;
    ws.send_binary(vec![1u8; 640]).await;

    ws.send_json(serde_json::json!({
        "type": "hello",
        "token": app.access_token("dr-garcia"),
        "mimeType": "audio/pcm",
        "sampleRate": 16000,
    }))
    .await;

    let ready = ws.recv_json().await;
    assert_eq!(ready["type"], "ready");
    let _session = app.next_session().await;
}

#[tokio::test]
async fn patient_joins_and_host_is_notified() {
    let mut app = TestApp::spawn().await;
    let (mut host, room_id, join_token, _host_session) = app.connect_host().await;

    let mut patient = WsClient::connect(&app.patient_url()).await;
    patient
        .send_json(serde_json::json!({
            "type": "hello_patient",
            "roomId": room_id,
            "joinToken": join_token,
            "mimeType": "audio/pcm",
            "sampleRate": 16000,
        }))
        .await;

    let ready = patient.recv_json().await;
    assert_eq!(ready["type"], "ready");
    assert_eq!(ready["role"], "patient");
    assert_eq!(ready["roomId"], room_id.as_str());
    // The join token is never disclosed to the patient.
    assert!(ready.get("joinToken").is_none());

    let joined = host.recv_json().await;
    assert_eq!(joined["type"], "patient_joined");
    assert_eq!(joined["roomId"], room_id.as_str());
}

#[tokio::test]
async fn patient_with_unknown_room_is_rejected() {
    let app = TestApp::spawn().await;

    let mut ws = WsClient::connect(&app.patient_url()).await;
    ws.send_json(serde_json::json!({
        "type": "hello_patient",
        "roomId": "no-such-room",
        "joinToken": "whatever",
        "mimeType": "audio/pcm",
        "sampleRate": 16000,
    }))
    .await;

    let error = ws.recv_json().await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["message"], "Room no existe o expiró");
    let (code, _) = ws.expect_close().await;
    assert_eq!(code, 4004);
}

#[tokio::test]
async fn patient_with_wrong_join_token_is_rejected() {
    let mut app = TestApp::spawn().await;
    let (_host, room_id, _join_token, _session) = app.connect_host().await;

    let mut ws = WsClient::connect(&app.patient_url()).await;
    ws.send_json(serde_json::json!({
        "type": "hello_patient",
        "roomId": room_id,
        "joinToken": "wrong-token",
        "mimeType": "audio/pcm",
        "sampleRate": 16000,
    }))
    .await;

    let error = ws.recv_json().await;
    assert_eq!(error["message"], "joinToken inválido");
    let (code, _) = ws.expect_close().await;
    assert_eq!(code, 4001);
}

#[tokio::test]
async fn second_hello_after_handshake_is_an_error_frame_not_a_close() {
    let mut app = TestApp::spawn().await;
    let (mut host, _room_id, _join_token, mut session) = app.connect_host().await;

    host.send_json(serde_json::json!({
        "type": "hello",
        "token": app.access_token("dr-garcia"),
        "mimeType": "audio/pcm",
        "sampleRate": 16000,
    }))
    .await;

    let error = host.recv_json().await;
    assert_eq!(error["type"], "error");

    // The connection stays usable.
    host.send_binary(vec![7u8; 320]).await;
    assert_eq!(session.next_audio().await, vec![7u8; 320]);
}
