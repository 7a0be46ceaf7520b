//! Session lifecycle: restarts, crashes, handshake failures and teardown.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kestrel_lsp::{LspError, LspEvent, SessionState};
use serde_json::json;

use crate::common::{Harness, Script, wait_for_state};

#[tokio::test]
async fn test_root_change_terminates_and_relaunches_lazily() {
    let mut h = Harness::new(Script::default()).await;
    let mut server = h.open_and_connect("/proj/a.ts", "let x = 1;").await;
    server.wait_for("textDocument/didOpen").await;

    let hover = h.manager.hover(Path::new("/proj/a.ts"), 1, 5);
    let restart = async {
        server.wait_for("textDocument/hover").await;
        h.manager.set_workspace_root("/proj/b").await;
    };
    let (hover, ()) = tokio::join!(hover, restart);
    assert_eq!(
        hover.unwrap_err(),
        LspError::SessionTerminated {
            language: "typescript".to_string()
        }
    );

    // Graceful teardown: shutdown request, then exit.
    let shutdown = server.next_frame().await;
    assert_eq!(shutdown["method"], "shutdown");
    let exit = server.next_frame().await;
    assert_eq!(exit["method"], "exit");

    assert!(h.manager.active_languages().is_empty());
    assert_eq!(h.manager.session_state("typescript"), None);

    let mut fresh = h.open_and_connect("/proj/b/a.ts", "let y = 2;").await;
    assert_eq!(fresh.root, PathBuf::from("/proj/b"));
    let open = fresh.next_frame().await;
    assert_eq!(open["params"]["textDocument"]["version"], 1);
    assert_eq!(h.launcher.launch_count(), 2);
}

#[tokio::test]
async fn test_fresh_session_announces_new_root() {
    let mut h = Harness::new(Script::default()).await;
    h.manager.set_workspace_root("/work/other").await;
    h.manager
        .open_document(Path::new("/work/other/main.py"), "print(1)")
        .await
        .unwrap();

    let mut server = h.next_server().await;
    let init = server.handshake().await;
    assert_eq!(init["params"]["rootUri"], "file:///work/other");
    assert_eq!(
        init["params"]["workspaceFolders"][0]["uri"],
        "file:///work/other"
    );
}

#[tokio::test]
async fn test_crash_fails_fast_until_next_sync_relaunches() {
    let mut h = Harness::new(Script::default()).await;
    let mut events = h.manager.subscribe();
    let path = Path::new("/proj/a.ts");
    let mut server = h.open_and_connect("/proj/a.ts", "x.").await;

    let pending = h.manager.completions(path, 1, 3);
    let crash = async {
        server.wait_for("textDocument/completion").await;
        server.crash();
    };
    let (pending, ()) = tokio::join!(pending, crash);
    assert_eq!(
        pending.unwrap_err(),
        LspError::SessionTerminated {
            language: "typescript".to_string()
        }
    );
    wait_for_state(&h.manager, "typescript", SessionState::Degraded).await;

    // Each request fails immediately rather than waiting for a timeout.
    let started = tokio::time::Instant::now();
    for _ in 0..3 {
        let err = h.manager.completions(path, 1, 3).await.unwrap_err();
        assert_eq!(
            err,
            LspError::ServerUnavailable {
                language: "typescript".to_string()
            }
        );
    }
    assert!(h.manager.hover(path, 1, 1).await.is_err());
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(h.launcher.launch_count(), 1);

    let mut saw_degraded = false;
    while let Ok(event) = events.try_recv() {
        if let LspEvent::SessionState {
            language,
            state: SessionState::Degraded,
            reason,
        } = event
        {
            assert_eq!(language, "typescript");
            assert!(reason.is_some());
            saw_degraded = true;
        }
    }
    assert!(saw_degraded);

    // The next sync replaces the dead server; the document is sent afresh.
    h.manager.change_document(path, "y.").await.unwrap();
    assert_eq!(h.launcher.launch_count(), 2);
    let mut fresh = h.next_server().await;
    fresh.handshake().await;
    let open = fresh.next_frame().await;
    assert_eq!(open["method"], "textDocument/didOpen");
    assert_eq!(open["params"]["textDocument"]["version"], 1);
    assert_eq!(open["params"]["textDocument"]["text"], "y.");
    wait_for_state(&h.manager, "typescript", SessionState::Ready).await;

    let request = h.manager.hover(path, 1, 1);
    let respond = async {
        let frame = fresh.wait_for("textDocument/hover").await;
        fresh.respond(&frame, json!({ "contents": "y: unknown" }));
    };
    let (hover, ()) = tokio::join!(request, respond);
    assert_eq!(hover.unwrap().unwrap().contents, "y: unknown");
}

#[tokio::test]
async fn test_undeliverable_change_degrades_silently() {
    let mut h = Harness::new(Script::default()).await;
    let path = Path::new("/proj/a.ts");
    let mut server = h.open_and_connect("/proj/a.ts", "let x = 1;").await;
    server.wait_for("textDocument/didOpen").await;
    server.hang_up().await;

    // Editing never surfaces the transport failure.
    h.manager.change_document(path, "let x = 2;").await.unwrap();
    wait_for_state(&h.manager, "typescript", SessionState::Degraded).await;

    let started = tokio::time::Instant::now();
    let err = h.manager.completions(path, 1, 9).await.unwrap_err();
    assert_eq!(
        err,
        LspError::ServerUnavailable {
            language: "typescript".to_string()
        }
    );
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_rejected_initialize_degrades() {
    let mut h = Harness::new(Script {
        reject_initialize: true,
        ..Script::default()
    })
    .await;
    h.manager
        .open_document(Path::new("/proj/a.ts"), "")
        .await
        .unwrap();
    let mut server = h.next_server().await;
    assert_eq!(server.next_frame().await["method"], "initialize");

    wait_for_state(&h.manager, "typescript", SessionState::Degraded).await;
    let err = h
        .manager
        .completions(Path::new("/proj/a.ts"), 1, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, LspError::ServerUnavailable { .. }));

    // A server that never became ready is not relaunched on every open.
    h.manager
        .open_document(Path::new("/proj/b.ts"), "")
        .await
        .unwrap();
    assert_eq!(h.launcher.launch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_initialize_timeout_degrades() {
    let mut h = Harness::new(Script {
        hang_initialize: true,
        ..Script::default()
    })
    .await;
    h.manager
        .open_document(Path::new("/proj/a.ts"), "let x = 1;")
        .await
        .unwrap();
    assert_eq!(
        h.manager.session_state("typescript"),
        Some(SessionState::Starting)
    );

    wait_for_state(&h.manager, "typescript", SessionState::Degraded).await;
    let err = h
        .manager
        .hover(Path::new("/proj/a.ts"), 1, 5)
        .await
        .unwrap_err();
    assert!(matches!(err, LspError::ServerUnavailable { .. }));

    // The queued didOpen is never written once the handshake fails.
    let mut server = h.next_server().await;
    assert_eq!(server.next_frame().await["method"], "initialize");
    assert!(!server.has_pending_frames());
}

#[tokio::test]
async fn test_launch_failure_reported_once_until_root_changes() {
    let mut h = Harness::new(Script::default()).await;
    h.launcher.fail_launches(true);

    let err = h
        .manager
        .open_document(Path::new("/proj/a.ts"), "")
        .await
        .unwrap_err();
    match err {
        LspError::LaunchFailure { language, reason } => {
            assert_eq!(language, "typescript");
            assert!(reason.contains("typescript-language-server"));
        }
        other => panic!("expected LaunchFailure, got {other:?}"),
    }

    h.manager
        .open_document(Path::new("/proj/b.ts"), "")
        .await
        .unwrap();
    assert_eq!(h.launcher.launch_count(), 1);
    assert_eq!(
        h.manager.session_state("typescript"),
        Some(SessionState::Degraded)
    );

    h.launcher.fail_launches(false);
    h.manager.set_workspace_root("/proj2").await;
    let _server = h.open_and_connect("/proj2/a.ts", "").await;
    assert_eq!(h.launcher.launch_count(), 2);
    assert_eq!(
        h.manager.session_state("typescript"),
        Some(SessionState::Ready)
    );
}

#[tokio::test]
async fn test_dispose_all_shuts_every_session_down() {
    let mut h = Harness::new(Script::default()).await;
    let mut ts = h.open_and_connect("/proj/a.ts", "").await;
    let mut py = h.open_and_connect("/proj/b.py", "").await;
    let mut events = h.manager.subscribe();
    ts.publish_diagnostics(
        "file:///proj/a.ts",
        json!([crate::common::diagnostic(0, 0, 1, "boom")]),
    );
    crate::common::next_diagnostics(&mut events).await;
    assert!(!h.manager.diagnostics_snapshot().is_empty());

    h.manager.dispose_all().await;

    ts.wait_for("shutdown").await;
    ts.wait_for("exit").await;
    py.wait_for("shutdown").await;
    py.wait_for("exit").await;
    assert!(h.manager.active_languages().is_empty());
    assert!(h.manager.diagnostics_snapshot().is_empty());
    assert_eq!(h.manager.workspace_root(), Some(PathBuf::from("/proj")));
}

#[tokio::test]
async fn test_server_requests_get_method_not_found() {
    let mut h = Harness::new(Script::default()).await;
    let mut server = h.open_and_connect("/proj/a.ts", "").await;
    server.wait_for("textDocument/didOpen").await;

    server.send(json!({
        "jsonrpc": "2.0",
        "id": "cfg-1",
        "method": "workspace/configuration",
        "params": { "items": [{ "section": "typescript" }] }
    }));
    let reply = server.next_frame().await;
    assert_eq!(reply["id"], "cfg-1");
    assert_eq!(reply["error"]["code"], -32601);
    assert!(reply.get("result").is_none());
    assert_eq!(
        h.manager.session_state("typescript"),
        Some(SessionState::Ready)
    );
}
