//! Blocking execution against the scripted server in `tests/support`.

mod support;

use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;
use sqt::prelude::*;
use sqt::table::TableState;
use support::MockServer;
use tokio::sync::mpsc::UnboundedReceiver;

fn drain(events: &mut UnboundedReceiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn errors(events: &[ConnectionEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            ConnectionEvent::Error(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

fn messages(events: &[ConnectionEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            ConnectionEvent::Message(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

fn opened(server: &MockServer) -> (Box<dyn DbConnection>, UnboundedReceiver<ConnectionEvent>) {
    let mut conn = sqt::connect(Backend::Postgres, &server.conninfo(), "testdb");
    let events = conn.subscribe();
    assert!(conn.open(), "open failed");
    (conn, events)
}

#[test]
fn test_select_one() {
    let server = MockServer::start();
    let (mut conn, mut events) = opened(&server);
    drain(&mut events);

    assert!(conn.execute("select 1", &[], None));
    assert_eq!(conn.query_state(), QueryState::Inactive);
    assert_eq!(conn.async_phase(), AsyncPhase::None);

    let tables = conn.results().snapshot();
    assert_eq!(tables.len(), 1);
    let table = &tables[0];
    assert_eq!(table.column_count(), 1);
    assert_eq!(table.columns()[0].name, "?column?");
    assert_eq!(table.columns()[0].kind, ValueKind::Int);
    assert_eq!(table.row_count(), 1);
    assert_eq!(table.value(0, 0), Some(&Value::Int(1)));
    assert_eq!(table.state(), TableState::Complete);

    let events = drain(&mut events);
    assert!(events.contains(&ConnectionEvent::Fetched(TableRef { index: 0, rows: 1 })));
    assert!(messages(&events).contains(&"1 rows fetched"));
    assert!(errors(&events).is_empty());
    assert_eq!(
        events.first(),
        Some(&ConnectionEvent::QueryStateChanged(QueryState::Running))
    );
    assert_eq!(
        events.last(),
        Some(&ConnectionEvent::QueryStateChanged(QueryState::Inactive))
    );
}

#[test]
fn test_invalid_sql() {
    let server = MockServer::start();
    let (mut conn, mut events) = opened(&server);
    drain(&mut events);

    assert!(!conn.execute("selec 1", &[], None));
    let events = drain(&mut events);
    let errors = errors(&events);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("syntax error"));
    assert!(conn.results().is_empty());
    assert_eq!(conn.query_state(), QueryState::Inactive);

    // the connection stays usable
    assert!(conn.execute("select 1", &[], None));
}

#[test]
fn test_multiple_result_sets() {
    let server = MockServer::start();
    let (mut conn, mut events) = opened(&server);
    drain(&mut events);

    assert!(conn.execute("select 1; select 2", &[], None));
    let tables = conn.results().snapshot();
    assert_eq!(tables.len(), 2);
    assert_eq!(tables[1].value(0, 0), Some(&Value::Int(2)));

    let fetched: Vec<TableRef> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            ConnectionEvent::Fetched(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(
        fetched,
        vec![
            TableRef { index: 0, rows: 1 },
            TableRef { index: 1, rows: 1 }
        ]
    );
}

#[test]
fn test_results_cleared_between_commands() {
    let server = MockServer::start();
    let (mut conn, _events) = opened(&server);

    assert!(conn.execute("select 1; select 2", &[], None));
    assert_eq!(conn.results().len(), 2);
    assert!(conn.execute("select 1", &[], None));
    assert_eq!(conn.results().len(), 1);
}

#[test]
fn test_parameters() {
    let server = MockServer::start();
    let (mut conn, _events) = opened(&server);

    assert!(conn.execute("select $1", &[Value::from("hello")], None));
    let table = &conn.results().snapshot()[0];
    assert_eq!(table.value(0, 0), Some(&Value::Text("hello".into())));

    assert!(conn.execute("select $1", &[Value::Null], None));
    let table = &conn.results().snapshot()[0];
    assert_eq!(table.value(0, 0), Some(&Value::Null));
}

#[test]
fn test_null_is_distinct() {
    let server = MockServer::start();
    let (mut conn, _events) = opened(&server);

    assert!(conn.execute("select null", &[], None));
    let table = &conn.results().snapshot()[0];
    assert_eq!(table.value(0, 0), Some(&Value::Null));
    assert_ne!(table.value(0, 0), Some(&Value::Int(0)));
}

#[test]
fn test_row_limit() {
    let server = MockServer::start();
    let (mut conn, _events) = opened(&server);

    assert!(conn.execute("select * from generate_series(1, 50)", &[], Some(10)));
    let table = &conn.results().snapshot()[0];
    assert_eq!(table.row_count(), 10);
    assert_eq!(table.value(9, 0), Some(&Value::Int(10)));
    assert_eq!(
        server.queries().last().map(String::as_str),
        Some("select * from generate_series(1, 50) limit 10")
    );
}

#[test]
fn test_command_without_rows() {
    let server = MockServer::start();
    let (mut conn, mut events) = opened(&server);
    drain(&mut events);

    assert!(conn.execute("insert into t select 1", &[], None));
    let events = drain(&mut events);
    assert!(messages(&events).contains(&"3 rows affected"));

    // an empty table still marks the command as done
    let tables = conn.results().snapshot();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].column_count(), 0);
    assert!(events.contains(&ConnectionEvent::Fetched(TableRef { index: 0, rows: 0 })));
}

#[test]
fn test_notice_becomes_message() {
    let server = MockServer::start();
    let (mut conn, mut events) = opened(&server);
    drain(&mut events);

    assert!(conn.execute("raise notice", &[], None));
    let events = drain(&mut events);
    assert!(
        messages(&events)
            .iter()
            .any(|m| m.starts_with("NOTICE:") && m.contains("hello from the server"))
    );
    assert!(messages(&events).contains(&"statement executed successfully"));
}

#[test]
fn test_column_mismatch() {
    let server = MockServer::start();
    let (mut conn, mut events) = opened(&server);
    drain(&mut events);

    assert!(!conn.execute("select mismatch", &[], None));
    let events = drain(&mut events);
    assert!(errors(&events).iter().any(|e| e.contains("do not match")));

    let table = &conn.results().snapshot()[0];
    // rows after the bad one are dropped
    assert_eq!(table.row_count(), 1);
    assert_eq!(table.state(), TableState::Failed);
    assert!(conn.is_opened());
}

#[test]
fn test_reconnect_once() {
    let server = MockServer::start();
    let (mut conn, mut events) = opened(&server);
    assert!(conn.execute("select 1", &[], None));
    drain(&mut events);

    server.drop_on_next_query();
    assert!(conn.execute("select 1", &[], None));
    assert_eq!(server.connections(), 2);
    assert_eq!(conn.results().snapshot()[0].value(0, 0), Some(&Value::Int(1)));

    // the lost connection is reported once, then the retry succeeds
    let events = drain(&mut events);
    assert_eq!(errors(&events).len(), 1);
    let error_at = events
        .iter()
        .position(|e| matches!(e, ConnectionEvent::Error(_)))
        .unwrap();
    let fetched_at = events
        .iter()
        .position(|e| matches!(e, ConnectionEvent::Fetched(_)))
        .unwrap();
    assert!(error_at < fetched_at);
    assert!(messages(&events).contains(&"1 rows fetched"));
    assert_eq!(
        events.last(),
        Some(&ConnectionEvent::QueryStateChanged(QueryState::Inactive))
    );
}

#[test]
fn test_open_replaces_pending_handshake() {
    let server = MockServer::start();
    let mut conn = sqt::connect(Backend::Postgres, &server.conninfo(), "testdb");
    let mut events = conn.subscribe();

    // nothing drives the handshake without a reactor
    conn.open_async();
    assert_eq!(conn.async_phase(), AsyncPhase::Connecting);

    assert!(conn.open());
    assert!(conn.is_opened());
    assert_eq!(conn.async_phase(), AsyncPhase::None);
    assert_eq!(conn.query_state(), QueryState::Inactive);

    assert!(conn.execute("select 1", &[], None));
    assert_eq!(conn.results().snapshot()[0].value(0, 0), Some(&Value::Int(1)));
    assert!(errors(&drain(&mut events)).is_empty());
}

#[test]
fn test_no_retry_inside_transaction() {
    let server = MockServer::start();
    let (mut conn, mut events) = opened(&server);
    assert!(conn.execute("begin", &[], None));
    assert!(!conn.is_idle());
    drain(&mut events);

    server.drop_on_next_query();
    assert!(!conn.execute("select 1", &[], None));
    assert_eq!(server.connections(), 1);
    assert_eq!(server.queries(), vec!["begin".to_string()]);
    assert!(!conn.is_opened());
    assert_eq!(errors(&drain(&mut events)).len(), 1);
}

#[test]
fn test_busy_connection_rejects_execute() {
    let server = MockServer::start();
    let (mut conn, mut events) = opened(&server);

    conn.execute_async("select 1", None);
    assert_eq!(conn.query_state(), QueryState::Running);
    drain(&mut events);

    assert!(!conn.execute("select 1", &[], None));
    let events = drain(&mut events);
    assert_eq!(
        errors(&events),
        vec!["another command is already in progress"]
    );
    // the in-flight command is untouched
    assert_eq!(conn.query_state(), QueryState::Running);
    assert_eq!(conn.async_phase(), AsyncPhase::WaitingForReadableResult);

    conn.close();
    assert_eq!(conn.query_state(), QueryState::Inactive);
    assert_eq!(conn.async_phase(), AsyncPhase::None);
}

#[test]
fn test_cancel_blocking_command() {
    let server = MockServer::start();
    let (mut conn, mut events) = opened(&server);
    drain(&mut events);

    let cancel = conn.cancel_handle();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        cancel.cancel()
    });

    assert!(!conn.execute("select pg_sleep(10)", &[], None));
    assert!(canceller.join().unwrap());
    assert_eq!(server.cancel_requests(), 1);

    let events = drain(&mut events);
    assert!(errors(&events).is_empty());
    let messages = messages(&events);
    assert!(messages.contains(&"cancelling..."));
    assert!(messages.iter().any(|m| m.contains("canceling statement")));
    assert_eq!(conn.query_state(), QueryState::Inactive);
}

#[test]
fn test_server_info() {
    let server = MockServer::start();
    let (conn, _events) = opened(&server);

    assert_eq!(conn.dbms_name(), "PostgreSQL");
    assert_eq!(conn.dbms_version(), "16.2");
    assert_eq!(conn.dbms_comparable_version(), 160002);
    assert_eq!(conn.context(), format!("127.0.0.1:{}/testdb", server.port()));

    let info = conn.dbms_info();
    assert!(info.starts_with("PostgreSQL v.16.2\n\n"));
    assert!(info.contains(&format!("{:<27}: UTF8\n", "server_encoding")));
}

#[test]
fn test_close_is_idempotent() {
    let server = MockServer::start();
    let (mut conn, _events) = opened(&server);
    assert!(conn.execute("select 1", &[], None));

    conn.close();
    conn.close();
    assert!(!conn.is_opened());
    assert!(conn.results().is_empty());
    assert_eq!(conn.context(), "");
}

#[test]
fn test_open_failure_reports_error() {
    // bind and release a port so nothing listens on it
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let mut conn = sqt::connect(
        Backend::Postgres,
        &format!("host=127.0.0.1 port={} connect_timeout=2", port),
        "",
    );
    let mut events = conn.subscribe();
    assert!(!conn.open());
    assert!(!conn.is_opened());
    let events = drain(&mut events);
    assert!(errors(&events)[0].contains("could not connect"));
}

#[test]
fn test_md5_authentication() {
    let server = MockServer::with_password("s3cret");
    let mut conn = sqt::connect(
        Backend::Postgres,
        &format!("{} password=s3cret", server.conninfo()),
        "testdb",
    );
    assert!(conn.open());
    assert!(conn.execute("select 1", &[], None));

    let mut wrong = sqt::connect(
        Backend::Postgres,
        &format!("{} password=nope", server.conninfo()),
        "testdb",
    );
    let mut events = wrong.subscribe();
    assert!(!wrong.open());
    let events = drain(&mut events);
    assert!(errors(&events)[0].contains("password authentication failed"));
}

#[test]
fn test_clone_connection_is_unopened() {
    let server = MockServer::start();
    let (conn, _events) = opened(&server);

    let mut copy = conn.clone_connection();
    assert!(!copy.is_opened());
    assert_eq!(copy.database(), "testdb");
    assert!(copy.open());
    assert_eq!(server.connections(), 2);
}
