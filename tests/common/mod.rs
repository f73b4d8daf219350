//! Scripted msgpack-rpc server for integration tests.
//!
//! The server runs on plain `std::net` sockets in its own threads, so it is
//! independent of the client's runtime.

#![allow(dead_code)]

use std::io::{BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rpcwire_client::protocol::{CallId, Message, Response};
use rpcwire_client::Value;

/// Install a test subscriber once; `RUST_LOG` controls the output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// A port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// A request as the server saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: CallId,
    pub method: String,
    pub params: Vec<Value>,
}

/// Server side of one accepted connection.
pub struct Conn {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Conn {
    fn new(stream: TcpStream) -> Self {
        let writer = stream.try_clone().unwrap();
        Self {
            reader: BufReader::new(stream),
            writer,
        }
    }

    /// Next message from the client, or `None` once it hangs up.
    pub fn next_message(&mut self) -> Option<Message> {
        let value = rmpv::decode::read_value(&mut self.reader).ok()?;
        Some(Message::from_value(value).expect("client sent a malformed message"))
    }

    /// Next message, which must be a request.
    pub fn next_request(&mut self) -> Option<Request> {
        match self.next_message()? {
            Message::Request { id, method, params } => Some(Request { id, method, params }),
            other => panic!("expected a request, got {:?}", other),
        }
    }

    pub fn respond(&mut self, id: CallId, result: Value) {
        self.send(Message::Response(Response::ok(id, result)));
    }

    pub fn respond_error(&mut self, id: CallId, error: Value) {
        self.send(Message::Response(Response::error(id, error)));
    }

    pub fn send(&mut self, message: Message) {
        let bytes = message.encode().unwrap();
        self.send_raw(&bytes);
    }

    /// Abort the connection: with a zero linger the close sends RST
    /// instead of FIN.
    pub fn reset(self) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        self.writer.set_nonblocking(true).unwrap();
        let stream = tokio::net::TcpStream::from_std(self.writer).unwrap();
        // A zero linger never blocks on drop.
        #[allow(deprecated)]
        stream.set_linger(Some(Duration::ZERO)).unwrap();
        drop(self.reader);
        drop(stream);
    }

    /// Write bytes as they are. Errors are ignored; the client may be gone.
    pub fn send_raw(&mut self, bytes: &[u8]) {
        let _ = self.writer.write_all(bytes);
        let _ = self.writer.flush();
    }
}

/// Notifications received by [`MockServer::calculator`].
pub type NotificationLog = Arc<Mutex<Vec<(String, Vec<Value>)>>>;

pub struct MockServer {
    port: u16,
    thread: Option<JoinHandle<()>>,
    pub notifications: NotificationLog,
    pub request_ids: Arc<Mutex<Vec<CallId>>>,
}

impl MockServer {
    /// Accept a single connection and run `script` on it.
    pub fn script<F>(script: F) -> Self
    where
        F: FnOnce(Conn) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let thread = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            script(Conn::new(stream));
        });
        Self::with_port(port, Some(thread))
    }

    /// Accept connections forever, each handled on its own thread.
    ///
    /// The handler also gets the zero-based index of the connection.
    pub fn serve<F>(handler: F) -> Self
    where
        F: Fn(usize, Conn) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handler = Arc::new(handler);
        thread::spawn(move || {
            for (index, stream) in listener.incoming().enumerate() {
                let Ok(stream) = stream else { break };
                let handler = handler.clone();
                thread::spawn(move || handler(index, Conn::new(stream)));
            }
        });
        Self::with_port(port, None)
    }

    /// Serve `add`, `sub`, `echo` and `fail`, logging notifications.
    pub fn calculator() -> Self {
        let notifications: NotificationLog = Arc::default();
        let request_ids: Arc<Mutex<Vec<CallId>>> = Arc::default();
        let (log, ids) = (notifications.clone(), request_ids.clone());

        let mut server = Self::serve(move |_, conn| calculate(conn, &log, &ids));
        server.notifications = notifications;
        server.request_ids = request_ids;
        server
    }

    fn with_port(port: u16, thread: Option<JoinHandle<()>>) -> Self {
        Self {
            port,
            thread,
            notifications: Arc::default(),
            request_ids: Arc::default(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for a scripted server to finish, re-raising its panics.
    pub fn finish(mut self) {
        if let Some(thread) = self.thread.take() {
            if let Err(panic) = thread.join() {
                std::panic::resume_unwind(panic);
            }
        }
    }
}

/// Answer requests one at a time until the client hangs up.
pub fn calculate(mut conn: Conn, log: &NotificationLog, ids: &Mutex<Vec<CallId>>) {
    while let Some(message) = conn.next_message() {
        match message {
            Message::Request { id, method, params } => {
                ids.lock().unwrap().push(id);
                let int = |i: usize| params.get(i).and_then(Value::as_i64).unwrap_or(0);
                match method.as_str() {
                    "add" => conn.respond(id, Value::from(int(0) + int(1))),
                    "sub" => conn.respond(id, Value::from(int(0) - int(1))),
                    "echo" => conn.respond(id, params.first().cloned().unwrap_or(Value::Nil)),
                    "fail" => conn.respond_error(id, Value::from("boom")),
                    other => conn.respond_error(
                        id,
                        Value::from(format!("unknown function '{}'", other)),
                    ),
                }
            }
            Message::Notification { method, params } => {
                log.lock().unwrap().push((method, params));
            }
            Message::Response(_) => {}
        }
    }
}
