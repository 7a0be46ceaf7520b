//! Document sync as seen on the wire.

use std::path::Path;

use crate::common::{Harness, Script, uri};

fn version(frame: &serde_json::Value) -> i64 {
    frame["params"]["textDocument"]["version"]
        .as_i64()
        .expect("frame carries a version")
}

#[tokio::test]
async fn test_open_change_close_scenario() {
    let mut h = Harness::new(Script::default()).await;
    let mut server = h.open_and_connect("/proj/a.ts", "let x=1").await;

    let open = server.next_frame().await;
    assert_eq!(open["method"], "textDocument/didOpen");
    assert_eq!(open["params"]["textDocument"]["uri"], uri("/proj/a.ts"));
    assert_eq!(open["params"]["textDocument"]["languageId"], "typescript");
    assert_eq!(version(&open), 1);
    assert_eq!(open["params"]["textDocument"]["text"], "let x=1");

    h.manager
        .change_document(Path::new("/proj/a.ts"), "let x=2")
        .await
        .unwrap();
    let change = server.next_frame().await;
    assert_eq!(change["method"], "textDocument/didChange");
    assert_eq!(version(&change), 2);
    assert_eq!(change["params"]["contentChanges"][0]["text"], "let x=2");
    assert!(change["params"]["contentChanges"][0].get("range").is_none());

    h.manager.close_document(Path::new("/proj/a.ts"));
    let close = server.next_frame().await;
    assert_eq!(close["method"], "textDocument/didClose");
    assert_eq!(close["params"]["textDocument"]["uri"], uri("/proj/a.ts"));

    // Second close queues nothing: the next frame is the marker open.
    h.manager.close_document(Path::new("/proj/a.ts"));
    h.manager
        .open_document(Path::new("/proj/marker.ts"), "")
        .await
        .unwrap();
    let marker = server.next_frame().await;
    assert_eq!(marker["method"], "textDocument/didOpen");
    assert_eq!(marker["params"]["textDocument"]["uri"], uri("/proj/marker.ts"));
}

#[tokio::test]
async fn test_versions_strictly_increase_with_single_open_and_close() {
    let mut h = Harness::new(Script::default()).await;
    let path = Path::new("/proj/src/app.ts");
    let mut server = h.open_and_connect("/proj/src/app.ts", "v0").await;

    for i in 1..=5 {
        // Re-focusing an open file must not resend it.
        h.manager.open_document(path, "ignored").await.unwrap();
        h.manager
            .change_document(path, &format!("v{i}"))
            .await
            .unwrap();
    }
    h.manager.close_document(path);

    let mut opens = 0;
    let mut versions = Vec::new();
    loop {
        let frame = server.next_frame().await;
        match frame["method"].as_str() {
            Some("textDocument/didOpen") => {
                opens += 1;
                versions.push(version(&frame));
            }
            Some("textDocument/didChange") => versions.push(version(&frame)),
            Some("textDocument/didClose") => break,
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert_eq!(opens, 1);
    assert_eq!(versions, vec![1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn test_identical_change_sends_nothing() {
    let mut h = Harness::new(Script::default()).await;
    let path = Path::new("/proj/a.ts");
    let mut server = h.open_and_connect("/proj/a.ts", "let x=1").await;
    server.wait_for("textDocument/didOpen").await;

    for _ in 0..3 {
        h.manager.change_document(path, "let x=1").await.unwrap();
    }
    h.manager.change_document(path, "let x=3").await.unwrap();

    let change = server.next_frame().await;
    assert_eq!(change["method"], "textDocument/didChange");
    assert_eq!(version(&change), 2);
    assert_eq!(change["params"]["contentChanges"][0]["text"], "let x=3");
}

#[tokio::test]
async fn test_opens_queued_during_startup_follow_handshake() {
    let mut h = Harness::new(Script::default()).await;
    h.manager
        .open_document(Path::new("/proj/one.ts"), "1")
        .await
        .unwrap();
    h.manager
        .open_document(Path::new("/proj/two.ts"), "2")
        .await
        .unwrap();
    h.manager
        .change_document(Path::new("/proj/one.ts"), "1 + 1")
        .await
        .unwrap();

    let mut server = h.next_server().await;
    let init = server.handshake().await;
    assert_eq!(init["params"]["rootUri"], "file:///proj");
    assert_eq!(
        init["params"]["capabilities"]["textDocument"]["synchronization"]["didSave"],
        false
    );

    let first = server.next_frame().await;
    let second = server.next_frame().await;
    let third = server.next_frame().await;
    assert_eq!(first["params"]["textDocument"]["uri"], uri("/proj/one.ts"));
    assert_eq!(second["params"]["textDocument"]["uri"], uri("/proj/two.ts"));
    assert_eq!(third["method"], "textDocument/didChange");
    assert_eq!(version(&third), 2);
}

#[tokio::test]
async fn test_change_before_open_sends_open_at_version_one() {
    let mut h = Harness::new(Script::default()).await;
    h.manager
        .change_document(Path::new("/proj/late.ts"), "export {}")
        .await
        .unwrap();

    let mut server = h.next_server().await;
    server.handshake().await;
    let open = server.next_frame().await;
    assert_eq!(open["method"], "textDocument/didOpen");
    assert_eq!(version(&open), 1);
    assert_eq!(open["params"]["textDocument"]["text"], "export {}");
}

#[tokio::test]
async fn test_languages_get_separate_sessions() {
    let mut h = Harness::new(Script::default()).await;
    let mut ts = h.open_and_connect("/proj/a.ts", "let a = 1").await;
    let mut py = h.open_and_connect("/proj/b.py", "b = 2").await;

    assert_eq!(ts.language, "typescript");
    assert_eq!(py.language, "python");
    assert_eq!(h.launcher.launch_count(), 2);
    assert_eq!(h.manager.active_languages(), ["python", "typescript"]);

    let ts_open = ts.next_frame().await;
    let py_open = py.next_frame().await;
    assert_eq!(ts_open["params"]["textDocument"]["uri"], uri("/proj/a.ts"));
    assert_eq!(py_open["params"]["textDocument"]["uri"], uri("/proj/b.py"));
    assert_eq!(py_open["params"]["textDocument"]["languageId"], "python");
}
