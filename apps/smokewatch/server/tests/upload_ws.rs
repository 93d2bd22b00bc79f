mod support;

use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use smokewatch_core::CameraKind;
use smokewatch_server::{router, AppState, HelperTemplate, ProcessSupervisor, SessionManager};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use support::{camera, frame_message, session_config, Fixture, SMOKING_FRAME};

async fn serve(fixture: &Fixture) -> std::net::SocketAddr {
    let sessions = SessionManager::new(session_config(), fixture.collaborators.clone());
    let supervisor = ProcessSupervisor::new(Default::default());
    let helper = HelperTemplate {
        program: "camera-client".into(),
        base_args: Vec::new(),
        server_url: "ws://127.0.0.1:0".into(),
    };
    let app = router(AppState::new(
        sessions,
        supervisor,
        helper,
        fixture.screenshots.dir().to_path_buf(),
        None,
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

async fn next_json<S>(ws: &mut S) -> serde_json::Value
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("server reply")
            .expect("socket open")
            .expect("valid frame");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

#[test_timeout::tokio_timeout_test(secs = 15, flavor = "multi_thread")]
async fn camera_upload_session_end_to_end() {
    let fixture = Fixture::new().with_camera(camera(11, CameraKind::Local, "tok-11"));
    let addr = serve(&fixture).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/upload/tok-11"))
        .await
        .unwrap();

    ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "pong");

    for _ in 0..3 {
        ws.send(Message::Text(frame_message(SMOKING_FRAME)))
            .await
            .unwrap();
    }
    let mut types = Vec::new();
    let mut alert = serde_json::Value::Null;
    for _ in 0..4 {
        let json = next_json(&mut ws).await;
        if json["type"] == "alert" {
            alert = json["data"].clone();
        }
        types.push(json["type"].as_str().unwrap().to_string());
    }
    assert_eq!(
        types,
        vec!["detection_result", "detection_result", "alert", "detection_result"]
    );
    assert_eq!(alert["camera_id"], 11);
    assert_eq!(alert["is_smoking"], true);
    assert_eq!(alert["smoking_pairs"][0]["person_id"], 1);

    ws.send(Message::Binary(SMOKING_FRAME.to_vec())).await.unwrap();
    let json = next_json(&mut ws).await;
    assert_eq!(json["type"], "detection_result");
    assert_eq!(json["data"]["is_smoking"], true);

    ws.close(None).await.unwrap();
    for _ in 0..100 {
        if !fixture
            .cameras
            .liveness(smokewatch_core::CameraId(11))
            .map(|liveness| liveness.online)
            .unwrap_or(true)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!fixture
        .cameras
        .liveness(smokewatch_core::CameraId(11))
        .unwrap()
        .online);
}

#[test_timeout::tokio_timeout_test(secs = 15, flavor = "multi_thread")]
async fn invalid_token_receives_policy_close() {
    let fixture = Fixture::new();
    let addr = serve(&fixture).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/upload/nope"))
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("server reply")
        .expect("socket open")
        .expect("valid frame");
    match message {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Policy);
            assert_eq!(frame.reason, "unauthorized");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}
