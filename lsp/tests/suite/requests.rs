//! Completion and hover requests against a scripted server.

use std::path::Path;
use std::time::Duration;

use kestrel_lsp::{CompletionItemKind, HoverFormat, LspError, Position, SessionState};
use serde_json::json;

use crate::common::{Harness, Script, uri};

#[tokio::test]
async fn test_completion_round_trip_converts_position() {
    let mut h = Harness::new(Script::default()).await;
    let source = "let s = \"😀\"; s.";
    let mut server = h.open_and_connect("/proj/a.ts", source).await;
    server.wait_for("textDocument/didOpen").await;

    let request = h.manager.completions(Path::new("/proj/a.ts"), 1, 16);
    let respond = async {
        let frame = server.wait_for("textDocument/completion").await;
        assert_eq!(frame["params"]["textDocument"]["uri"], uri("/proj/a.ts"));
        // The emoji is one column but two UTF-16 units.
        assert_eq!(frame["params"]["position"], json!({ "line": 0, "character": 16 }));
        assert_eq!(frame["params"]["context"]["triggerKind"], 1);
        server.respond(
            &frame,
            json!({
                "isIncomplete": false,
                "items": [
                    { "label": "length", "kind": 10, "detail": "number" },
                    { "label": "toString", "kind": 2, "insertText": "toString()" },
                    { "label": "mystery", "kind": 99 }
                ]
            }),
        );
    };
    let (items, ()) = tokio::join!(request, respond);
    let items = items.unwrap();

    assert_eq!(items.len(), 3);
    assert_eq!(items[0].label, "length");
    assert_eq!(items[0].kind, Some(CompletionItemKind::Property));
    assert_eq!(items[0].detail.as_deref(), Some("number"));
    assert_eq!(items[1].kind, Some(CompletionItemKind::Method));
    assert_eq!(items[1].text_to_insert(), "toString()");
    assert_eq!(items[2].kind, None);
}

#[tokio::test]
async fn test_second_completion_supersedes_first() {
    let mut h = Harness::new(Script::default()).await;
    let path = Path::new("/proj/a.ts");
    let mut server = h.open_and_connect("/proj/a.ts", "foo.\nbar.").await;
    server.wait_for("textDocument/didOpen").await;

    let first = h.manager.completions(path, 1, 5);
    let second = h.manager.completions(path, 2, 5);
    let respond = async {
        let stale = server.wait_for("textDocument/completion").await;
        let latest = server.wait_for("textDocument/completion").await;
        assert_ne!(stale["id"], latest["id"]);
        server.respond(&latest, json!([{ "label": "baz" }]));
        // A late answer to the superseded request is dropped.
        server.respond(&stale, json!([{ "label": "stale" }]));
    };
    let (first, second, ()) = tokio::join!(first, second, respond);

    assert_eq!(first.unwrap(), Vec::new());
    let second = second.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].label, "baz");
}

#[tokio::test]
async fn test_completions_for_other_documents_are_independent() {
    let mut h = Harness::new(Script::default()).await;
    let mut server = h.open_and_connect("/proj/a.ts", "a.").await;
    h.manager
        .open_document(Path::new("/proj/b.ts"), "b.")
        .await
        .unwrap();

    let a = h.manager.completions(Path::new("/proj/a.ts"), 1, 3);
    let b = h.manager.completions(Path::new("/proj/b.ts"), 1, 3);
    let respond = async {
        for _ in 0..2 {
            let frame = server.wait_for("textDocument/completion").await;
            let label = if frame["params"]["textDocument"]["uri"] == uri("/proj/a.ts") {
                "from_a"
            } else {
                "from_b"
            };
            server.respond(&frame, json!([{ "label": label }]));
        }
    };
    let (a, b, ()) = tokio::join!(a, b, respond);
    assert_eq!(a.unwrap()[0].label, "from_a");
    assert_eq!(b.unwrap()[0].label, "from_b");
}

#[tokio::test]
async fn test_hover_markdown_with_range() {
    let mut h = Harness::new(Script::default()).await;
    let mut server = h.open_and_connect("/proj/a.ts", "let x = 1;").await;

    let request = h.manager.hover(Path::new("/proj/a.ts"), 1, 5);
    let respond = async {
        let frame = server.wait_for("textDocument/hover").await;
        assert_eq!(frame["params"]["position"], json!({ "line": 0, "character": 4 }));
        server.respond(
            &frame,
            json!({
                "contents": { "kind": "markdown", "value": "```ts\nlet x: number\n```" },
                "range": {
                    "start": { "line": 0, "character": 4 },
                    "end": { "line": 0, "character": 5 }
                }
            }),
        );
    };
    let (hover, ()) = tokio::join!(request, respond);
    let hover = hover.unwrap().expect("hover present");

    assert_eq!(hover.format, HoverFormat::Markdown);
    assert!(hover.contents.contains("let x: number"));
    let range = hover.range.expect("range present");
    assert_eq!(range.start, Position::new(1, 5));
    assert_eq!(range.end, Position::new(1, 6));
}

#[tokio::test]
async fn test_hover_null_is_none() {
    let mut h = Harness::new(Script::default()).await;
    let mut server = h.open_and_connect("/proj/a.ts", "// nothing").await;

    let request = h.manager.hover(Path::new("/proj/a.ts"), 1, 1);
    let respond = async {
        let frame = server.wait_for("textDocument/hover").await;
        server.respond(&frame, serde_json::Value::Null);
    };
    let (hover, ()) = tokio::join!(request, respond);
    assert_eq!(hover.unwrap(), None);
}

#[tokio::test]
async fn test_server_error_response_surfaces() {
    let mut h = Harness::new(Script::default()).await;
    let mut server = h.open_and_connect("/proj/a.ts", "x").await;

    let request = h.manager.hover(Path::new("/proj/a.ts"), 1, 1);
    let respond = async {
        let frame = server.wait_for("textDocument/hover").await;
        server.respond_error(&frame, -32603, "internal failure");
    };
    let (hover, ()) = tokio::join!(request, respond);
    assert_eq!(
        hover.unwrap_err(),
        LspError::ServerError {
            code: -32603,
            message: "internal failure".to_string(),
        }
    );
    assert_eq!(
        h.manager.session_state("typescript"),
        Some(SessionState::Ready)
    );
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_completion_times_out() {
    let mut h = Harness::new(Script::default()).await;
    let mut server = h.open_and_connect("/proj/a.ts", "x.").await;

    let started = tokio::time::Instant::now();
    let err = h
        .manager
        .completions(Path::new("/proj/a.ts"), 1, 3)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        LspError::ProtocolTimeout {
            method: "textDocument/completion",
            timeout: Duration::from_millis(500),
        }
    );
    assert!(started.elapsed() >= Duration::from_millis(500));

    // A timeout fails only that request.
    assert_eq!(
        h.manager.session_state("typescript"),
        Some(SessionState::Ready)
    );
    let frame = server.wait_for("textDocument/completion").await;
    server.respond(&frame, json!([{ "label": "too_late" }]));

    let request = h.manager.hover(Path::new("/proj/a.ts"), 1, 1);
    let respond = async {
        let frame = server.wait_for("textDocument/hover").await;
        server.respond(&frame, json!({ "contents": "x: unknown" }));
    };
    let (hover, ()) = tokio::join!(request, respond);
    assert_eq!(hover.unwrap().unwrap().contents, "x: unknown");
}

#[tokio::test]
async fn test_unsupported_language_returns_empty_without_launch() {
    let h = Harness::new(Script::default()).await;

    let items = h
        .manager
        .completions(Path::new("/proj/README.md"), 1, 1)
        .await
        .unwrap();
    assert!(items.is_empty());
    let hover = h
        .manager
        .hover(Path::new("/proj/README.md"), 1, 1)
        .await
        .unwrap();
    assert!(hover.is_none());

    assert_eq!(h.launcher.launch_count(), 0);
    assert!(h.manager.active_languages().is_empty());
}

#[tokio::test]
async fn test_requests_do_not_start_sessions() {
    let h = Harness::new(Script::default()).await;
    let items = h
        .manager
        .completions(Path::new("/proj/a.ts"), 1, 1)
        .await
        .unwrap();
    assert!(items.is_empty());
    assert_eq!(h.launcher.launch_count(), 0);
}
