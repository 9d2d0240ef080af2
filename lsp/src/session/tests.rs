use std::cell::{Cell, RefCell};
use std::env;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use super::*;
use crate::capabilities::TextDocumentSyncKind;
use crate::codec::encode_frame;
use crate::testing::ScriptHandle;

fn server_config() -> ServerConfig {
    serde_json::from_value(json!({ "command": "fake-ls", "language_id": "rust" })).unwrap()
}

fn workspace() -> PathBuf {
    env::temp_dir()
}

fn awaiting_init(settings: SessionSettings) -> (Session, ScriptHandle) {
    let script = ScriptHandle::default();
    let mut session = Session::new("fake", server_config(), settings);
    session.start(script.transport());
    assert_eq!(session.state(), SessionState::Starting);
    session.initialize(&workspace(), "relay", "0.1.0").unwrap();
    assert_eq!(session.state(), SessionState::AwaitingInit);
    (session, script)
}

fn init_reply(capabilities: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": 1, "result": { "capabilities": capabilities } })
}

fn ready_with(settings: SessionSettings, now: Instant) -> (Session, ScriptHandle) {
    let (mut session, script) = awaiting_init(settings);
    session.tick_at(now);
    script.reply(&init_reply(json!({ "textDocumentSync": 2, "hoverProvider": true })));
    session.tick_at(now);
    assert_eq!(session.state(), SessionState::Ready);
    session.take_events();
    script.clear_written();
    (session, script)
}

fn ready(now: Instant) -> (Session, ScriptHandle) {
    ready_with(SessionSettings::default(), now)
}

fn tick_n(session: &mut Session, now: Instant, n: usize) {
    for _ in 0..n {
        session.tick_at(now);
    }
}

#[test]
fn test_initialize_handshake() {
    let now = Instant::now();
    let (mut session, script) = awaiting_init(SessionSettings::default());

    session.tick_at(now);
    let frames = script.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["method"], "initialize");
    assert_eq!(frames[0]["id"], 1);
    assert_eq!(frames[0]["params"]["clientInfo"]["name"], "relay");
    assert!(session.capabilities().is_none());

    script.reply(&init_reply(json!({ "textDocumentSync": 2 })));
    session.tick_at(now);

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(script.methods(), vec!["initialize", "initialized"]);
    let sync = &session.capabilities().unwrap().text_document_sync;
    assert!(sync.open_close);
    assert_eq!(sync.change, TextDocumentSyncKind::Incremental);
    assert!(!sync.save.as_ref().unwrap().include_text);

    let events = session.take_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], LspEvent::Initialized { server } if server == "fake"));
}

#[test]
fn test_nothing_but_initialize_before_ready() {
    let now = Instant::now();
    let (mut session, script) = awaiting_init(SessionSettings::default());

    assert!(session.push_notification(
        "textDocument/didOpen",
        Some(json!({})),
        NotificationOptions::default()
    ));
    let id = session.push_request(
        "textDocument/hover",
        Some(json!({})),
        |_: &mut Session, _: Response| {},
        RequestOptions::default(),
    );
    assert_eq!(id, Some(2));
    tick_n(&mut session, now, 5);
    assert_eq!(script.methods(), vec!["initialize"]);

    script.reply(&init_reply(json!({})));
    tick_n(&mut session, now, 3);
    assert_eq!(
        script.methods(),
        vec![
            "initialize",
            "initialized",
            "textDocument/didOpen",
            "textDocument/hover"
        ]
    );
}

#[test]
fn test_push_before_start_is_dropped() {
    let mut session = Session::new("fake", server_config(), SessionSettings::default());
    assert!(!session.push_notification("textDocument/didOpen", None, NotificationOptions::default()));
    assert!(
        session
            .push_request(
                "textDocument/hover",
                None,
                |_: &mut Session, _: Response| {},
                RequestOptions::default()
            )
            .is_none()
    );
}

#[test]
fn test_initialize_error_degrades() {
    let now = Instant::now();
    let (mut session, script) = awaiting_init(SessionSettings::default());
    session.tick_at(now);
    script.reply(&json!({
        "jsonrpc": "2.0",
        "id": 1,
        "error": { "code": -32603, "message": "boom" }
    }));
    session.tick_at(now);

    assert_eq!(session.state(), SessionState::Degraded);
    let events = session.take_events();
    assert!(matches!(
        &events[0],
        LspEvent::ServerStopped { reason: ServerStopReason::InitFailed(msg), .. } if msg == "boom"
    ));
}

#[test]
fn test_unanswered_initialize_is_resent_then_fails() {
    let t0 = Instant::now();
    let (mut session, script) = awaiting_init(SessionSettings::default());
    let interval = Duration::from_secs(10);

    session.tick_at(t0);
    session.tick_at(t0 + interval);
    session.tick_at(t0 + interval * 2);
    assert_eq!(script.methods(), vec!["initialize"; 3]);
    assert!(script.frames().iter().all(|f| f["id"] == 1));
    assert_eq!(session.state(), SessionState::AwaitingInit);

    session.tick_at(t0 + interval * 3);
    assert_eq!(session.state(), SessionState::Degraded);
    assert_eq!(script.methods().len(), 3);
}

#[test]
fn test_request_ids_increase() {
    let now = Instant::now();
    let (mut session, _script) = ready(now);
    let ids: Vec<_> = (0..3)
        .map(|_| {
            session
                .push_request(
                    "textDocument/definition",
                    None,
                    |_: &mut Session, _: Response| {},
                    RequestOptions::default(),
                )
                .unwrap()
        })
        .collect();
    assert_eq!(ids, vec![2, 3, 4]);
}

#[test]
fn test_response_invokes_callback_once() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();

    let id = session
        .push_request(
            "textDocument/hover",
            Some(json!({})),
            move |_: &mut Session, response: Response| sink.borrow_mut().push(response),
            RequestOptions::default(),
        )
        .unwrap();
    session.tick_at(now);

    let reply = json!({ "jsonrpc": "2.0", "id": id, "result": { "contents": "docs" } });
    script.reply(&reply);
    script.reply(&reply);
    session.tick_at(now);

    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], Ok(json!({ "contents": "docs" })));
    assert_eq!(session.pending_requests(), 0);
}

#[test]
fn test_error_response_reaches_callback() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    let seen = Rc::new(RefCell::new(None));
    let sink = seen.clone();

    let id = session
        .push_request(
            "textDocument/rename",
            None,
            move |_: &mut Session, response: Response| *sink.borrow_mut() = Some(response),
            RequestOptions::default(),
        )
        .unwrap();
    session.tick_at(now);
    script.reply(&json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": -32602, "message": "bad rename" }
    }));
    session.tick_at(now);

    let response = seen.borrow_mut().take().unwrap();
    assert_eq!(response.unwrap_err().code, ResponseError::INVALID_PARAMS);
}

#[test]
fn test_five_write_failures_degrade_once() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    let stops = Rc::new(Cell::new(0));
    let counter = stops.clone();
    session.add_event_listener(LspEvent::SHUTDOWN, move |_, _| {
        counter.set(counter.get() + 1);
    });

    session.push_notification(
        "textDocument/didChange",
        Some(json!({})),
        NotificationOptions::default(),
    );
    session.push_request(
        "textDocument/hover",
        None,
        |_: &mut Session, _: Response| panic!("callback must be dropped"),
        RequestOptions::default(),
    );
    script.with(|s| s.fail_writes = true);

    tick_n(&mut session, now, 4);
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.queued_notifications(), 1);

    session.tick_at(now);
    assert_eq!(session.state(), SessionState::Degraded);
    assert_eq!(session.queued_notifications(), 0);
    assert_eq!(session.pending_requests(), 0);
    assert!(script.with(|s| s.killed));

    tick_n(&mut session, now, 5);
    assert_eq!(stops.get(), 1);
    let events = session.take_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        LspEvent::ServerStopped {
            reason: ServerStopReason::WriteFailures(5),
            ..
        }
    ));
}

#[test]
fn test_successful_write_resets_failure_count() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    let push = |session: &mut Session| {
        session.push_notification(
            "textDocument/didChange",
            Some(json!({})),
            NotificationOptions::default(),
        );
    };

    push(&mut session);
    script.with(|s| s.fail_writes = true);
    tick_n(&mut session, now, 4);
    script.with(|s| s.fail_writes = false);
    session.tick_at(now);

    push(&mut session);
    script.with(|s| s.fail_writes = true);
    tick_n(&mut session, now, 4);
    assert_eq!(session.state(), SessionState::Ready);
}

#[test]
fn test_timeout_after_two_sends() {
    let t0 = Instant::now();
    let (mut session, script) = ready(t0);
    let timeouts = Rc::new(Cell::new(0));
    let counter = timeouts.clone();

    session.push_request(
        "textDocument/definition",
        Some(json!({})),
        |_: &mut Session, _: Response| panic!("no response was sent"),
        RequestOptions {
            on_timeout: Some(Box::new(move |_: &mut Session| {
                counter.set(counter.get() + 1);
            })),
            ..RequestOptions::default()
        },
    );

    session.tick_at(t0);
    session.tick_at(t0 + Duration::from_millis(500));
    assert_eq!(script.methods().len(), 1);

    session.tick_at(t0 + Duration::from_secs(1));
    session.tick_at(t0 + Duration::from_millis(1500));
    assert_eq!(script.methods(), vec!["textDocument/definition"; 2]);
    assert_eq!(timeouts.get(), 0);

    session.tick_at(t0 + Duration::from_secs(2));
    assert_eq!(timeouts.get(), 1);
    assert_eq!(session.pending_requests(), 0);

    session.tick_at(t0 + Duration::from_secs(5));
    assert_eq!(script.methods().len(), 2);
    assert_eq!(timeouts.get(), 1);
}

#[test]
fn test_custom_request_timeout() {
    let t0 = Instant::now();
    let (mut session, script) = ready(t0);
    session.push_request(
        "textDocument/references",
        None,
        |_: &mut Session, _: Response| {},
        RequestOptions {
            timeout: Some(Duration::from_secs(5)),
            ..RequestOptions::default()
        },
    );
    session.tick_at(t0);
    session.tick_at(t0 + Duration::from_secs(1));
    assert_eq!(script.methods().len(), 1);
    session.tick_at(t0 + Duration::from_secs(5));
    assert_eq!(script.methods().len(), 2);
}

#[test]
fn test_did_change_overwrite_yields_one_frame() {
    let now = Instant::now();
    let (mut session, script) = ready(now);

    for version in 1..=3 {
        session.push_notification(
            "textDocument/didChange",
            Some(json!({ "version": version })),
            NotificationOptions::overwrite(),
        );
    }
    assert_eq!(session.queued_for("textDocument/didChange"), 1);

    tick_n(&mut session, now, 3);
    let frames = script.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["params"]["version"], 3);
}

#[test]
fn test_overwrite_key_separates_documents() {
    let now = Instant::now();
    let (mut session, script) = ready(now);

    for (uri, version) in [("file:///a.rs", 1), ("file:///b.rs", 1), ("file:///a.rs", 2)] {
        session.push_notification(
            "textDocument/didChange",
            Some(json!({ "uri": uri, "version": version })),
            NotificationOptions::overwrite_key(uri),
        );
    }
    assert_eq!(session.queued_for("textDocument/didChange"), 2);

    tick_n(&mut session, now, 3);
    let frames = script.frames();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["params"], json!({ "uri": "file:///a.rs", "version": 2 }));
    assert_eq!(frames[1]["params"], json!({ "uri": "file:///b.rs", "version": 1 }));
}

#[test]
fn test_notification_on_sent_fires_after_write() {
    let now = Instant::now();
    let (mut session, _script) = ready(now);
    let sent = Rc::new(Cell::new(false));
    let flag = sent.clone();

    session.push_notification(
        "textDocument/didOpen",
        None,
        NotificationOptions {
            overwrite: false,
            on_sent: Some(Box::new(move |_: &mut Session| flag.set(true))),
            ..NotificationOptions::default()
        },
    );
    assert!(!sent.get());
    session.tick_at(now);
    assert!(sent.get());
}

#[test]
fn test_hitrate_ceiling_drops_excess() {
    let now = Instant::now();
    let settings = SessionSettings {
        hitrate_ceiling: 8,
        ..SessionSettings::default()
    };
    let (mut session, script) = ready_with(settings, now);

    let accepted = (0..13)
        .filter(|n| {
            session.push_notification(
                "textDocument/didChange",
                Some(json!({ "n": n })),
                NotificationOptions::default(),
            )
        })
        .count();
    assert_eq!(accepted, 8);

    tick_n(&mut session, now, 20);
    assert_eq!(script.frames().len(), 8);
}

#[test]
fn test_whitelisted_methods_are_never_dropped() {
    let now = Instant::now();
    let settings = SessionSettings {
        hitrate_ceiling: 4,
        ..SessionSettings::default()
    };
    let (mut session, script) = ready_with(settings, now);

    for _ in 0..10 {
        session.push_notification("textDocument/hover-ish", None, NotificationOptions::default());
    }
    for _ in 0..10 {
        assert!(session.push_notification(
            "textDocument/didSave",
            None,
            NotificationOptions::default()
        ));
    }
    tick_n(&mut session, now, 30);
    let saves = script
        .methods()
        .iter()
        .filter(|m| *m == "textDocument/didSave")
        .count();
    assert_eq!(saves, 10);
}

#[test]
fn test_overwrite_of_unsent_request_keeps_id() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    let first = session.push_request(
        "textDocument/completion",
        Some(json!({ "n": 1 })),
        |_: &mut Session, _: Response| panic!("replaced before sending"),
        RequestOptions::overwrite(),
    );
    let second = session.push_request(
        "textDocument/completion",
        Some(json!({ "n": 2 })),
        |_: &mut Session, _: Response| {},
        RequestOptions::overwrite(),
    );
    assert_eq!(first, second);
    assert_eq!(session.pending_requests(), 1);

    session.tick_at(now);
    let frames = script.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["params"]["n"], 2);
}

#[test]
fn test_superseded_response_goes_to_overwritten_callback() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    let log = Rc::new(RefCell::new(Vec::new()));

    let primary = log.clone();
    let superseded = log.clone();
    let first = session
        .push_request(
            "textDocument/hover",
            None,
            move |_: &mut Session, _: Response| primary.borrow_mut().push("primary"),
            RequestOptions {
                on_overwritten: Some(Box::new(move |_: &mut Session, _: Response| {
                    superseded.borrow_mut().push("overwritten");
                })),
                ..RequestOptions::overwrite()
            },
        )
        .unwrap();
    session.tick_at(now);

    let newer = log.clone();
    let second = session
        .push_request(
            "textDocument/hover",
            None,
            move |_: &mut Session, _: Response| newer.borrow_mut().push("newer"),
            RequestOptions::overwrite(),
        )
        .unwrap();
    assert_ne!(first, second);
    session.tick_at(now);

    script.reply(&json!({ "jsonrpc": "2.0", "id": first, "result": null }));
    script.reply(&json!({ "jsonrpc": "2.0", "id": second, "result": null }));
    session.tick_at(now);
    assert_eq!(*log.borrow(), vec!["overwritten", "newer"]);
}

#[test]
fn test_unsent_overwrite_answers_latest_overwritten_callback() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    let log = Rc::new(RefCell::new(Vec::new()));

    let (first_primary, first_overwritten) = (log.clone(), log.clone());
    let first = session.push_request(
        "textDocument/completion",
        Some(json!({ "n": 1 })),
        move |_: &mut Session, _: Response| first_primary.borrow_mut().push("first primary"),
        RequestOptions {
            on_overwritten: Some(Box::new(move |_: &mut Session, _: Response| {
                first_overwritten.borrow_mut().push("first overwritten");
            })),
            ..RequestOptions::overwrite()
        },
    );
    let (second_primary, second_overwritten) = (log.clone(), log.clone());
    let second = session.push_request(
        "textDocument/completion",
        Some(json!({ "n": 2 })),
        move |_: &mut Session, _: Response| second_primary.borrow_mut().push("second primary"),
        RequestOptions {
            on_overwritten: Some(Box::new(move |_: &mut Session, _: Response| {
                second_overwritten.borrow_mut().push("second overwritten");
            })),
            ..RequestOptions::overwrite()
        },
    );
    assert_eq!(first, second);

    session.tick_at(now);
    assert_eq!(script.frames()[0]["params"]["n"], 2);
    script.reply(&json!({ "jsonrpc": "2.0", "id": second, "result": [] }));
    session.tick_at(now);

    assert_eq!(*log.borrow(), vec!["second overwritten"]);
    assert_eq!(session.pending_requests(), 0);
}

#[test]
fn test_late_response_to_superseded_request_is_delivered() {
    let t0 = Instant::now();
    let (mut session, script) = ready(t0);
    let log = Rc::new(RefCell::new(Vec::new()));

    let superseded = log.clone();
    let first = session
        .push_request(
            "textDocument/hover",
            None,
            |_: &mut Session, _: Response| {},
            RequestOptions {
                on_overwritten: Some(Box::new(move |_: &mut Session, _: Response| {
                    superseded.borrow_mut().push("overwritten");
                })),
                ..RequestOptions::overwrite()
            },
        )
        .unwrap();
    session.tick_at(t0);
    session.push_request(
        "textDocument/hover",
        None,
        |_: &mut Session, _: Response| {},
        RequestOptions::overwrite(),
    );
    session.tick_at(t0);
    session.tick_at(t0 + Duration::from_secs(1));

    script.reply(&json!({ "jsonrpc": "2.0", "id": first, "result": null }));
    session.tick_at(t0 + Duration::from_millis(1500));
    assert_eq!(*log.borrow(), vec!["overwritten"]);
}

#[test]
fn test_superseded_request_is_not_resent() {
    let t0 = Instant::now();
    let (mut session, script) = ready(t0);
    let first = session
        .push_request(
            "textDocument/hover",
            None,
            |_: &mut Session, _: Response| {},
            RequestOptions::overwrite(),
        )
        .unwrap();
    session.tick_at(t0);
    session.push_request(
        "textDocument/hover",
        None,
        |_: &mut Session, _: Response| {},
        RequestOptions::overwrite(),
    );
    session.tick_at(t0);
    session.tick_at(t0 + Duration::from_secs(1));

    let resent_first = script
        .frames()
        .iter()
        .filter(|f| f["id"] == first)
        .count();
    assert_eq!(resent_first, 1);
}

#[test]
fn test_unknown_server_request_gets_method_not_found() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    script.reply(&json!({
        "jsonrpc": "2.0",
        "id": "req-7",
        "method": "workspace/somethingNew",
        "params": {}
    }));
    session.tick_at(now);

    let frames = script.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["id"], "req-7");
    assert_eq!(frames[0]["error"]["code"], ResponseError::METHOD_NOT_FOUND);
    assert!(frames[0].get("result").is_none());
}

#[test]
fn test_default_server_request_replies() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    script.reply(&json!({
        "jsonrpc": "2.0",
        "id": 3,
        "method": "workspace/configuration",
        "params": { "items": [{ "section": "a" }, { "section": "b" }] }
    }));
    script.reply(&json!({
        "jsonrpc": "2.0",
        "id": 4,
        "method": "window/workDoneProgress/create",
        "params": { "token": "t" }
    }));
    tick_n(&mut session, now, 3);

    let frames = script.frames();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["id"], 3);
    assert_eq!(frames[0]["result"], json!([null, null]));
    assert_eq!(frames[1]["id"], 4);
    assert_eq!(frames[1]["result"], Value::Null);
}

#[test]
fn test_request_listener_answers_server_request() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    session.add_request_listener("workspace/configuration", |session, id, _params| {
        session.push_response(id.clone(), Ok(json!([{ "checkOnSave": true }])));
    });
    script.reply(&json!({
        "jsonrpc": "2.0",
        "id": 9,
        "method": "workspace/configuration",
        "params": { "items": [{}] }
    }));
    session.tick_at(now);

    let frames = script.frames();
    assert_eq!(frames[0]["result"], json!([{ "checkOnSave": true }]));
}

#[test]
fn test_default_publish_diagnostics_emits_event() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    let path = workspace().join("main.rs");
    let uri = protocol::path_to_file_uri(&path).unwrap();
    script.reply(&json!({
        "jsonrpc": "2.0",
        "method": "textDocument/publishDiagnostics",
        "params": {
            "uri": uri.as_str(),
            "diagnostics": [{
                "range": {
                    "start": { "line": 4, "character": 2 },
                    "end": { "line": 4, "character": 8 }
                },
                "severity": 1,
                "message": "mismatched types"
            }]
        }
    }));
    session.tick_at(now);

    let events = session.take_events();
    assert_eq!(events.len(), 1);
    let LspEvent::Diagnostics { server, path: got, items } = &events[0] else {
        panic!("expected diagnostics, got {events:?}");
    };
    assert_eq!(server, "fake");
    assert_eq!(got, &path);
    assert_eq!(items[0].message(), "mismatched types");
    assert_eq!(items[0].line(), 4);
    assert!(items[0].severity().is_error());
}

#[test]
fn test_message_listeners_replace_default_and_all_fire() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    let hits = Rc::new(Cell::new(0));
    for _ in 0..2 {
        let hits = hits.clone();
        session.add_message_listener("textDocument/publishDiagnostics", move |_, _| {
            hits.set(hits.get() + 1);
        });
    }
    script.reply(&json!({
        "jsonrpc": "2.0",
        "method": "textDocument/publishDiagnostics",
        "params": { "uri": "file:///x.rs", "diagnostics": [] }
    }));
    session.tick_at(now);

    assert_eq!(hits.get(), 2);
    assert!(session.take_events().is_empty());
}

#[test]
fn test_listener_registered_during_dispatch_is_kept() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    let hits = Rc::new(Cell::new(0));
    let outer = hits.clone();
    session.add_message_listener("$/progress", move |session, _| {
        outer.set(outer.get() + 1);
        let inner = outer.clone();
        session.add_message_listener("$/progress", move |_, _| inner.set(inner.get() + 10));
    });
    let progress = json!({ "jsonrpc": "2.0", "method": "$/progress", "params": {} });

    script.reply(&progress);
    session.tick_at(now);
    assert_eq!(hits.get(), 1);

    script.reply(&progress);
    session.tick_at(now);
    assert_eq!(hits.get(), 12);
}

#[test]
fn test_undecodable_frame_is_dropped() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    script.reply_raw(&encode_frame(b"{not json"));
    script.reply(&json!({
        "jsonrpc": "2.0",
        "id": 5,
        "method": "client/registerCapability",
        "params": {}
    }));
    session.tick_at(now);

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(script.frames()[0]["id"], 5);
}

#[test]
fn test_response_for_unknown_id_is_ignored() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    script.reply(&json!({ "jsonrpc": "2.0", "id": 99, "result": {} }));
    session.tick_at(now);
    assert_eq!(session.state(), SessionState::Ready);
}

#[test]
fn test_framing_error_degrades() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    script.reply_raw(b"Content-Type: text/plain\r\n\r\n{}");
    session.tick_at(now);

    assert_eq!(session.state(), SessionState::Degraded);
    assert!(matches!(
        session.take_events().as_slice(),
        [LspEvent::ServerStopped {
            reason: ServerStopReason::Protocol(_),
            ..
        }]
    ));
}

#[test]
fn test_process_exit_degrades() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    script.with(|s| s.exited = true);
    session.tick_at(now);
    assert_eq!(session.state(), SessionState::Degraded);
    assert!(matches!(
        session.take_events().as_slice(),
        [LspEvent::ServerStopped {
            reason: ServerStopReason::Exited,
            ..
        }]
    ));
}

#[test]
fn test_split_inbound_frame_is_reassembled() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    let body = serde_json::to_vec(&json!({
        "jsonrpc": "2.0",
        "id": 6,
        "method": "client/registerCapability",
        "params": {}
    }))
    .unwrap();
    let frame = encode_frame(&body);
    let (head, tail) = frame.split_at(frame.len() / 2);

    script.reply_raw(head);
    session.tick_at(now);
    assert!(script.frames().is_empty());

    script.reply_raw(tail);
    session.tick_at(now);
    assert_eq!(script.frames()[0]["id"], 6);
}

#[test]
fn test_partial_write_completes_before_next_frame() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    script.with(|s| s.max_write = Some(10));
    let sent = Rc::new(Cell::new(false));
    let flag = sent.clone();

    session.push_notification(
        "textDocument/didChange",
        Some(json!({ "text": "fn main() {}" })),
        NotificationOptions {
            overwrite: true,
            on_sent: Some(Box::new(move |_: &mut Session| flag.set(true))),
            ..NotificationOptions::default()
        },
    );
    session.push_request(
        "textDocument/hover",
        Some(json!({})),
        |_: &mut Session, _: Response| {},
        RequestOptions::default(),
    );

    session.tick_at(now);
    assert!(!sent.get());
    assert!(script.frames().is_empty());

    tick_n(&mut session, now, 100);
    assert!(sent.get());
    assert_eq!(
        script.methods(),
        vec!["textDocument/didChange", "textDocument/hover"]
    );
    assert_eq!(session.state(), SessionState::Ready);
}

#[test]
fn test_raw_payload_is_chunked_and_never_interleaved() {
    let now = Instant::now();
    let settings = SessionSettings {
        raw_chunk_bytes: 16,
        ..SessionSettings::default()
    };
    let (mut session, script) = ready_with(settings, now);
    let done = Rc::new(Cell::new(false));
    let flag = done.clone();

    let body = serde_json::to_vec(&json!({
        "jsonrpc": "2.0",
        "method": "custom/bulkIndex",
        "params": { "data": "x".repeat(100) }
    }))
    .unwrap();
    let framed_len = encode_frame(&body).len();
    assert!(session.push_raw(
        "bulk",
        body,
        Some(Box::new(move |_: &mut Session| flag.set(true))),
        false
    ));

    session.tick_at(now);
    assert_eq!(script.with(|s| s.written.len()), 16);
    session.push_notification("textDocument/didSave", None, NotificationOptions::default());

    let mut ticks = 0;
    while session.queued_raw() > 0 {
        session.tick_at(now);
        ticks += 1;
        assert!(ticks < 100);
    }
    assert!(done.get());
    assert_eq!(ticks, framed_len.div_ceil(16) - 1);
    assert_eq!(script.methods(), vec!["custom/bulkIndex"]);

    session.tick_at(now);
    assert_eq!(
        script.methods(),
        vec!["custom/bulkIndex", "textDocument/didSave"]
    );
}

#[test]
fn test_raw_overwrite_replaces_unstarted_payload() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    let payload = |n: u32| {
        serde_json::to_vec(&json!({ "jsonrpc": "2.0", "method": "custom/sync", "params": { "n": n } }))
            .unwrap()
    };
    session.push_raw("sync", payload(1), None, true);
    session.push_raw("sync", payload(2), None, true);
    assert_eq!(session.queued_raw(), 1);

    tick_n(&mut session, now, 3);
    let frames = script.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["params"]["n"], 2);
}

#[test]
fn test_exit_sends_shutdown_then_exit() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    session.push_notification("textDocument/didOpen", None, NotificationOptions::default());

    session.exit();

    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(script.methods(), vec!["shutdown", "exit"]);
    assert_eq!(script.frames()[0]["id"], 2);
    assert_eq!(script.with(|s| s.closed_with), Some(EXIT_GRACE));
    assert!(script.with(|s| s.killed));
    assert_eq!(session.queued_notifications(), 0);

    session.tick_at(now);
    assert_eq!(script.methods().len(), 2);
}

#[test]
fn test_exit_after_degrade_ends_stopped() {
    let now = Instant::now();
    let (mut session, script) = ready(now);
    script.with(|s| s.exited = true);
    session.tick_at(now);
    assert_eq!(session.state(), SessionState::Degraded);

    session.exit();
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(script.frames().is_empty());
}

#[test]
fn test_quit_timer() {
    let now = Instant::now();
    let mut session = Session::new("fake", server_config(), SessionSettings::default());
    assert!(!session.quit_due(now));
    session.schedule_quit(now + Duration::from_secs(60));
    assert!(!session.quit_due(now));
    assert!(session.quit_due(now + Duration::from_secs(60)));
    session.cancel_quit();
    assert!(!session.quit_due(now + Duration::from_secs(120)));
}
