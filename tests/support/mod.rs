//! In-process PostgreSQL stand-in for integration tests.
//!
//! Speaks enough of protocol v3 to serve the commands below; anything else
//! is answered with a syntax error.
//!
//! | Command                                  | Reply                                  |
//! |------------------------------------------|----------------------------------------|
//! | `select 1`                               | one int4 row                           |
//! | `select 1; select 2`                     | two row sets                           |
//! | `select $1`                              | the bound parameter as text            |
//! | `select * from generate_series(1, N)`    | N int4 rows (honours ` limit M`)       |
//! | `select null`                            | one NULL cell                          |
//! | `select mismatch`                        | a row wider than its description, then |
//! |                                          | one that fits again                    |
//! | `select pg_sleep(..)`                    | waits for a CancelRequest, then 57014  |
//! | `raise notice`                           | a NOTICE, then `DO`                    |
//! | `insert ...`                             | `INSERT 0 3`                           |
//! | `begin` / `commit` / `rollback`          | moves the transaction status           |
//! | `listen <channel>`                       | `LISTEN`, then a notification          |
//! | `terminate`                              | replies, then closes the connection    |

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const CANCEL_REQUEST_CODE: i32 = 80877102;
const BACKEND_SECRET: i32 = 0x5eed;
const INT4: i32 = 23;
const TEXT: i32 = 25;

#[derive(Default)]
struct Shared {
    connections: AtomicUsize,
    cancel_requests: AtomicUsize,
    cancel_pending: AtomicBool,
    drop_next: AtomicBool,
    next_pid: AtomicI32,
    password: Option<String>,
    queries: Mutex<Vec<String>>,
}

pub struct MockServer {
    port: u16,
    shared: Arc<Shared>,
}

impl MockServer {
    pub fn start() -> Self {
        Self::spawn(Shared::default())
    }

    /// A server that demands MD5 password authentication.
    pub fn with_password(password: &str) -> Self {
        Self::spawn(Shared {
            password: Some(password.to_string()),
            ..Shared::default()
        })
    }

    fn spawn(shared: Shared) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let port = listener.local_addr().expect("local addr").port();
        let shared = Arc::new(shared);
        shared.next_pid.store(1000, Ordering::SeqCst);

        let accept_shared = shared.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let shared = accept_shared.clone();
                thread::spawn(move || {
                    let _ = serve(stream, &shared);
                });
            }
        });
        Self { port, shared }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn conninfo(&self) -> String {
        format!("host=127.0.0.1 port={} user=tester", self.port)
    }

    /// Completed startups so far.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub fn cancel_requests(&self) -> usize {
        self.shared.cancel_requests.load(Ordering::SeqCst)
    }

    /// Commands the server answered, in order.
    pub fn queries(&self) -> Vec<String> {
        self.shared.queries.lock().expect("queries lock").clone()
    }

    /// Close the connection instead of answering the next command.
    pub fn drop_on_next_query(&self) {
        self.shared.drop_next.store(true, Ordering::SeqCst);
    }
}

fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(tag);
    out.extend_from_slice(&(body.len() as i32 + 4).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn auth(code: i32, extra: &[u8]) -> Vec<u8> {
    let mut body = code.to_be_bytes().to_vec();
    body.extend_from_slice(extra);
    frame(b'R', &body)
}

fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut body = Vec::new();
    cstr(&mut body, name);
    cstr(&mut body, value);
    frame(b'S', &body)
}

fn ready(tx: u8) -> Vec<u8> {
    frame(b'Z', &[tx])
}

fn row_description(columns: &[(&str, i32)]) -> Vec<u8> {
    let mut body = (columns.len() as i16).to_be_bytes().to_vec();
    for (name, type_oid) in columns {
        cstr(&mut body, name);
        body.extend_from_slice(&0i32.to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
        body.extend_from_slice(&type_oid.to_be_bytes());
        let size: i16 = if *type_oid == INT4 { 4 } else { -1 };
        body.extend_from_slice(&size.to_be_bytes());
        body.extend_from_slice(&(-1i32).to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
    }
    frame(b'T', &body)
}

fn data_row(cells: &[Option<&str>]) -> Vec<u8> {
    let mut body = (cells.len() as i16).to_be_bytes().to_vec();
    for cell in cells {
        match cell {
            Some(value) => {
                body.extend_from_slice(&(value.len() as i32).to_be_bytes());
                body.extend_from_slice(value.as_bytes());
            }
            None => body.extend_from_slice(&(-1i32).to_be_bytes()),
        }
    }
    frame(b'D', &body)
}

fn complete(tag: &str) -> Vec<u8> {
    let mut body = Vec::new();
    cstr(&mut body, tag);
    frame(b'C', &body)
}

fn fields(tag: u8, severity: &str, code: &str, message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for (field, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', message)] {
        body.push(field);
        cstr(&mut body, value);
    }
    body.push(0);
    frame(tag, &body)
}

fn error(code: &str, message: &str) -> Vec<u8> {
    fields(b'E', "ERROR", code, message)
}

fn notification(pid: i32, channel: &str, payload: &str) -> Vec<u8> {
    let mut body = pid.to_be_bytes().to_vec();
    cstr(&mut body, channel);
    cstr(&mut body, payload);
    frame(b'A', &body)
}

fn read_i32(stream: &mut TcpStream) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

/// One frontend message: type byte and body.
fn read_message(stream: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
    let mut tag = [0u8; 1];
    stream.read_exact(&mut tag)?;
    let len = read_i32(stream)? as usize;
    let mut body = vec![0u8; len.saturating_sub(4)];
    stream.read_exact(&mut body)?;
    Ok((tag[0], body))
}

fn body_cstr(body: &[u8], start: usize) -> (String, usize) {
    let end = body[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .unwrap_or(body.len());
    (String::from_utf8_lossy(&body[start..end]).to_string(), end + 1)
}

/// Parameter values of a Bind message (text format).
fn bind_params(body: &[u8]) -> Vec<Option<String>> {
    let (_, pos) = body_cstr(body, 0);
    let (_, mut pos) = body_cstr(body, pos);
    let i16_at = |p: usize| i16::from_be_bytes([body[p], body[p + 1]]) as usize;
    let formats = i16_at(pos);
    pos += 2 + formats * 2;
    let count = i16_at(pos);
    pos += 2;
    let mut params = Vec::with_capacity(count);
    for _ in 0..count {
        let len = i32::from_be_bytes([body[pos], body[pos + 1], body[pos + 2], body[pos + 3]]);
        pos += 4;
        if len < 0 {
            params.push(None);
        } else {
            let len = len as usize;
            params.push(Some(
                String::from_utf8_lossy(&body[pos..pos + len]).to_string(),
            ));
            pos += len;
        }
    }
    params
}

fn startup_user(body: &[u8]) -> String {
    let mut pos = 4;
    while pos < body.len() && body[pos] != 0 {
        let (key, next) = body_cstr(body, pos);
        let (value, next) = body_cstr(body, next);
        if key == "user" {
            return value;
        }
        pos = next;
    }
    String::new()
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

fn serve(mut stream: TcpStream, shared: &Shared) -> io::Result<()> {
    let len = read_i32(&mut stream)? as usize;
    let mut startup = vec![0u8; len.saturating_sub(4)];
    stream.read_exact(&mut startup)?;
    let code = i32::from_be_bytes([startup[0], startup[1], startup[2], startup[3]]);
    if code == CANCEL_REQUEST_CODE {
        shared.cancel_requests.fetch_add(1, Ordering::SeqCst);
        shared.cancel_pending.store(true, Ordering::SeqCst);
        return Ok(());
    }

    if let Some(password) = &shared.password {
        let salt = [1u8, 2, 3, 4];
        stream.write_all(&auth(5, &salt))?;
        let (tag, body) = read_message(&mut stream)?;
        let (answer, _) = body_cstr(&body, 0);
        let user = startup_user(&startup);
        let inner = md5_hex(format!("{}{}", password, user).as_bytes());
        let mut salted = inner.into_bytes();
        salted.extend_from_slice(&salt);
        let expected = format!("md5{}", md5_hex(&salted));
        if tag != b'p' || answer != expected {
            stream.write_all(&fields(
                b'E',
                "FATAL",
                "28P01",
                &format!("password authentication failed for user \"{}\"", user),
            ))?;
            return Ok(());
        }
    }

    let pid = shared.next_pid.fetch_add(1, Ordering::SeqCst);
    let mut hello = auth(0, &[]);
    for (name, value) in [
        ("server_version", "16.2"),
        ("server_version_num", "160002"),
        ("server_encoding", "UTF8"),
        ("client_encoding", "UTF8"),
        ("DateStyle", "ISO, MDY"),
        ("integer_datetimes", "on"),
    ] {
        hello.extend(parameter_status(name, value));
    }
    let mut key = pid.to_be_bytes().to_vec();
    key.extend_from_slice(&BACKEND_SECRET.to_be_bytes());
    hello.extend(frame(b'K', &key));
    hello.extend(ready(b'I'));
    stream.write_all(&hello)?;
    shared.connections.fetch_add(1, Ordering::SeqCst);

    let mut tx = b'I';
    let mut statement = String::new();
    let mut params = Vec::new();
    loop {
        let (tag, body) = read_message(&mut stream)?;
        let sql = match tag {
            b'X' => return Ok(()),
            b'Q' => body_cstr(&body, 0).0,
            b'P' => {
                statement = body_cstr(&body, body_cstr(&body, 0).1).0;
                continue;
            }
            b'B' => {
                params = bind_params(&body);
                continue;
            }
            b'D' | b'E' | b'H' => continue,
            b'S' => statement.clone(),
            _ => continue,
        };

        if shared.drop_next.swap(false, Ordering::SeqCst) {
            let _ = stream.shutdown(Shutdown::Both);
            return Ok(());
        }
        shared
            .queries
            .lock()
            .expect("queries lock")
            .push(sql.clone());

        let mut reply = Vec::new();
        if tag == b'S' {
            reply.extend(frame(b'1', &[]));
            reply.extend(frame(b'2', &[]));
        }
        let after = respond(&sql, &params, shared, &mut tx, &mut reply);
        reply.extend(ready(tx));
        stream.write_all(&reply)?;
        params.clear();

        match after {
            After::Nothing => {}
            After::Notify(channel) => {
                thread::sleep(Duration::from_millis(50));
                stream.write_all(&notification(pid, &channel, "hello"))?;
            }
            After::Close => {
                let _ = stream.shutdown(Shutdown::Both);
                return Ok(());
            }
        }
    }
}

enum After {
    Nothing,
    Notify(String),
    Close,
}

/// Split a trailing ` limit N` off the command.
fn split_limit(sql: &str) -> (&str, Option<usize>) {
    if let Some(pos) = sql.rfind(" limit ") {
        if let Ok(n) = sql[pos + 7..].trim().parse() {
            return (sql[..pos].trim(), Some(n));
        }
    }
    (sql, None)
}

fn respond(
    sql: &str,
    params: &[Option<String>],
    shared: &Shared,
    tx: &mut u8,
    out: &mut Vec<u8>,
) -> After {
    let lowered = sql.trim().to_ascii_lowercase();
    let (command, limit) = split_limit(&lowered);

    match command {
        "select 1" => {
            out.extend(row_description(&[("?column?", INT4)]));
            out.extend(data_row(&[Some("1")]));
            out.extend(complete("SELECT 1"));
        }
        "select 1; select 2" => {
            for value in ["1", "2"] {
                out.extend(row_description(&[("?column?", INT4)]));
                out.extend(data_row(&[Some(value)]));
                out.extend(complete("SELECT 1"));
            }
        }
        "select $1" => {
            let value = params.first().cloned().flatten();
            out.extend(row_description(&[("value", TEXT)]));
            out.extend(data_row(&[value.as_deref()]));
            out.extend(complete("SELECT 1"));
        }
        "select null" => {
            out.extend(row_description(&[("n", INT4)]));
            out.extend(data_row(&[None]));
            out.extend(complete("SELECT 1"));
        }
        "select mismatch" => {
            out.extend(row_description(&[("a", INT4)]));
            out.extend(data_row(&[Some("1")]));
            out.extend(data_row(&[Some("2"), Some("3")]));
            out.extend(data_row(&[Some("4")]));
            out.extend(complete("SELECT 3"));
        }
        "raise notice" => {
            out.extend(fields(b'N', "NOTICE", "00000", "hello from the server"));
            out.extend(complete("DO"));
        }
        "begin" => {
            *tx = b'T';
            out.extend(complete("BEGIN"));
        }
        "commit" | "rollback" => {
            *tx = b'I';
            out.extend(complete(&command.to_ascii_uppercase()));
        }
        "terminate" => {
            out.extend(complete("SELECT 0"));
            return After::Close;
        }
        _ if command.starts_with("insert") => out.extend(complete("INSERT 0 3")),
        _ if command.starts_with("listen ") => {
            out.extend(complete("LISTEN"));
            let channel = command["listen ".len()..].trim().trim_matches('"');
            return After::Notify(channel.to_string());
        }
        _ if command.starts_with("select pg_sleep") => {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !shared.cancel_pending.swap(false, Ordering::SeqCst) {
                if Instant::now() > deadline {
                    out.extend(row_description(&[("pg_sleep", TEXT)]));
                    out.extend(data_row(&[Some("")]));
                    out.extend(complete("SELECT 1"));
                    return After::Nothing;
                }
                thread::sleep(Duration::from_millis(10));
            }
            out.extend(error("57014", "canceling statement due to user request"));
        }
        _ if command.starts_with("select * from generate_series(1, ") => {
            let n: usize = command["select * from generate_series(1, ".len()..]
                .trim_end_matches(')')
                .trim()
                .parse()
                .unwrap_or(0);
            let n = limit.map_or(n, |l| l.min(n));
            out.extend(row_description(&[("generate_series", INT4)]));
            for i in 1..=n {
                out.extend(data_row(&[Some(&i.to_string())]));
            }
            out.extend(complete(&format!("SELECT {}", n)));
        }
        _ => {
            if *tx == b'T' {
                *tx = b'E';
            }
            let near = command.split_whitespace().next().unwrap_or("");
            out.extend(error(
                "42601",
                &format!("syntax error at or near \"{}\"", near),
            ));
        }
    }
    After::Nothing
}
