//! Integration tests for rpcwire-client.
//!
//! Every test runs a real client against a scripted server on localhost.

mod common;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use common::{closed_port, eventually, init_tracing, MockServer};
use rpcwire_client::{Client, ClientConfig, ClientError, ConnectionState, Value};

fn client(port: u16) -> Client {
    init_tracing();
    Client::builder("127.0.0.1", port)
        .timeout(Duration::from_secs(5))
        .connect()
        .unwrap()
}

#[test]
fn test_add_round_trip() {
    let server = MockServer::calculator();
    let client = client(server.port());

    let sum: i64 = client.call("add", &(2, 3)).unwrap();
    assert_eq!(sum, 5);
    assert!(client.is_connected());
    assert_eq!(client.pending_calls(), 0);
}

#[test]
fn test_call_with_typed_arguments() {
    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Point {
        x: i32,
        y: i32,
    }

    let server = MockServer::calculator();
    let client = client(server.port());

    let point = Point { x: 1, y: -2 };
    let echoed: Point = client.call("echo", &(&point,)).unwrap();
    assert_eq!(echoed, point);

    let text: String = client.call("echo", "single").unwrap();
    assert_eq!(text, "single");

    let list: Vec<u8> = client.call("echo", &(vec![1u8, 2, 3],)).unwrap();
    assert_eq!(list, vec![1, 2, 3]);
}

#[test]
fn test_responses_out_of_order() {
    let server = MockServer::script(|mut conn| {
        let add = conn.next_request().unwrap();
        let sub = conn.next_request().unwrap();
        assert_eq!(add.method, "add");
        assert_eq!(sub.method, "sub");
        assert!(add.id < sub.id);

        // Second call first.
        conn.respond(sub.id, Value::from(4));
        conn.respond(add.id, Value::from(5));
        while conn.next_message().is_some() {}
    });
    let client = client(server.port());
    client.wait_for_connection().unwrap();

    let add = client.async_call("add", &(2, 3)).unwrap();
    let sub = client.async_call("sub", &(5, 1)).unwrap();

    assert_eq!(sub.wait(Some(Duration::from_secs(5))).unwrap(), Value::from(4));
    assert_eq!(add.wait(Some(Duration::from_secs(5))).unwrap(), Value::from(5));

    drop(client);
    server.finish();
}

#[test]
fn test_three_responses_any_order() {
    let server = MockServer::script(|mut conn| {
        let requests: Vec<_> = (0..3).map(|_| conn.next_request().unwrap()).collect();
        for index in [2, 0, 1] {
            let request = &requests[index];
            conn.respond(request.id, request.params[0].clone());
        }
        while conn.next_message().is_some() {}
    });
    let client = client(server.port());

    let handles: Vec<_> = [10, 20, 30]
        .iter()
        .map(|n| client.async_call("echo", &(n,)).unwrap())
        .collect();

    for (handle, expected) in handles.into_iter().zip([10, 20, 30]) {
        let value = handle.wait(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(value, Value::from(expected));
    }
    assert!(eventually(Duration::from_secs(1), || client.pending_calls() == 0));

    drop(client);
    server.finish();
}

#[test]
fn test_rpc_error_carries_function_and_payload() {
    let server = MockServer::calculator();
    let client = client(server.port());

    match client.call::<_, Value>("fail", &()) {
        Err(ClientError::Rpc { function, error }) => {
            assert_eq!(function, "fail");
            assert_eq!(error, Value::from("boom"));
        }
        other => panic!("expected rpc error, got {:?}", other),
    }

    // The connection and later calls are unaffected.
    assert!(client.is_connected());
    let sum: i64 = client.call("add", &(1, 1)).unwrap();
    assert_eq!(sum, 2);
}

#[test]
fn test_server_closes_mid_flight() {
    let server = MockServer::script(|mut conn| {
        let request = conn.next_request().unwrap();
        assert_eq!(request.method, "slow");
        // Hang up without answering.
    });
    let client = client(server.port());

    let result = client.call::<_, Value>("slow", &());
    assert!(matches!(result, Err(ClientError::ConnectionClosed)), "{:?}", result);
    assert!(eventually(Duration::from_secs(2), || {
        client.connection_state() == ConnectionState::Disconnected
    }));
    assert_eq!(client.pending_calls(), 0);

    server.finish();
}

#[test]
fn test_server_resets_mid_flight() {
    let server = MockServer::script(|mut conn| {
        let request = conn.next_request().unwrap();
        assert_eq!(request.method, "slow");
        conn.reset();
    });
    let client = client(server.port());

    let result = client.call::<_, Value>("slow", &());
    assert!(matches!(result, Err(ClientError::ConnectionClosed)), "{:?}", result);
    assert!(eventually(Duration::from_secs(2), || {
        client.connection_state() == ConnectionState::Disconnected
    }));
    assert_eq!(client.pending_calls(), 0);
    assert!(matches!(
        client.call::<_, Value>("again", &()),
        Err(ClientError::NotConnected)
    ));

    server.finish();
}

#[test]
fn test_unreachable_host_with_short_timeout() {
    init_tracing();
    // Reserved for documentation, never routable.
    let client = Client::builder("192.0.2.1", 9)
        .timeout(Duration::from_millis(50))
        .connect()
        .unwrap();

    let start = Instant::now();
    let state = client.reconnect().unwrap();
    assert_eq!(state, ConnectionState::Disconnected);
    assert!(start.elapsed() < Duration::from_secs(2));

    let start = Instant::now();
    let err = client.wait_for_connection().unwrap_err();
    assert!(
        matches!(err, ClientError::NotConnected | ClientError::ConnectTimeout { .. }),
        "{:?}",
        err
    );
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_wait_for_connection_timeout_message() {
    init_tracing();
    let client = Client::builder("192.0.2.1", 9)
        .timeout(Duration::from_millis(200))
        .connect()
        .unwrap();
    // Waiting less than the connect attempt takes.
    client.set_timeout(Duration::from_millis(20));

    match client.wait_for_connection() {
        Err(err @ ClientError::ConnectTimeout { .. }) => {
            assert_eq!(
                err.to_string(),
                "Timeout of 20ms while connecting to 192.0.2.1:9"
            );
            assert!(err.is_timeout());
        }
        // Some sandboxes fail unroutable connects immediately.
        Err(ClientError::NotConnected) => {}
        other => panic!("expected a connect failure, got {:?}", other),
    }
}

#[test]
fn test_call_timeout_then_late_response_is_cleaned_up() {
    let server = MockServer::script(|mut conn| {
        let request = conn.next_request().unwrap();
        thread::sleep(Duration::from_millis(300));
        conn.respond(request.id, Value::from("late"));
        while conn.next_message().is_some() {}
    });
    let client = client(server.port());
    client.wait_for_connection().unwrap();
    client.set_timeout(Duration::from_millis(50));

    match client.call::<_, Value>("sleepy", &()) {
        Err(err @ ClientError::CallTimeout { .. }) => {
            assert_eq!(
                err.to_string(),
                "Timeout of 50ms while calling RPC function 'sleepy'"
            );
        }
        other => panic!("expected call timeout, got {:?}", other),
    }
    assert_eq!(client.pending_calls(), 1);

    // The late response still removes the entry.
    assert!(eventually(Duration::from_secs(2), || client.pending_calls() == 0));
    assert!(client.is_connected());

    drop(client);
    server.finish();
}

#[test]
fn test_wait_all_responses() {
    let server = MockServer::script(|mut conn| {
        let requests: Vec<_> = (0..3).map(|_| conn.next_request().unwrap()).collect();
        thread::sleep(Duration::from_millis(100));
        for request in requests {
            conn.respond(request.id, Value::Nil);
        }
        while conn.next_message().is_some() {}
    });
    let client = client(server.port());

    let mut handles: Vec<_> = (0..3)
        .map(|_| client.async_call("work", &()).unwrap())
        .collect();
    client.wait_all_responses().unwrap();

    assert_eq!(client.pending_calls(), 0);
    for handle in &mut handles {
        assert_eq!(handle.try_result().unwrap().unwrap(), Value::Nil);
    }

    drop(client);
    server.finish();
}

#[test]
fn test_observer_sees_every_transition() {
    init_tracing();
    let server = MockServer::script(|mut conn| {
        // Close as soon as the first request arrives.
        let _ = conn.next_request();
    });

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let client = Client::builder("127.0.0.1", server.port())
        .timeout(Duration::from_secs(5))
        .on_state_change(move |client, prev, next| {
            assert_eq!(client.endpoint().host(), "127.0.0.1");
            assert_eq!(client.connection_state(), next);
            sink.lock().unwrap().push((prev, next));
        })
        .connect()
        .unwrap();

    client.wait_for_connection().unwrap();
    let _ = client.call::<_, Value>("close", &());
    assert!(eventually(Duration::from_secs(2), || seen.lock().unwrap().len() == 2));

    use ConnectionState::*;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(Initial, Connected), (Connected, Disconnected)]
    );
    server.finish();
}

#[test]
fn test_observer_can_be_swapped() {
    let log: common::NotificationLog = Arc::default();
    let ids: Arc<Mutex<Vec<u32>>> = Arc::default();
    let server = MockServer::serve(move |index, mut conn| {
        if index == 0 {
            // Hang up on the first request.
            let _ = conn.next_message();
        } else {
            common::calculate(conn, &log, &ids);
        }
    });
    let client = client(server.port());
    client.wait_for_connection().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client.set_state_handler(move |_, prev, next| sink.lock().unwrap().push((prev, next)));

    let _ = client.call::<_, Value>("close", &());
    assert!(eventually(Duration::from_secs(2), || seen.lock().unwrap().len() == 1));
    client.clear_state_handler();
    assert_eq!(client.reconnect().unwrap(), ConnectionState::Connected);

    // The reconnect happened after the observer was removed.
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(ConnectionState::Connected, ConnectionState::Disconnected)]
    );
}

#[test]
fn test_observer_reconnects_through_handle() {
    init_tracing();
    let log: common::NotificationLog = Arc::default();
    let ids: Arc<Mutex<Vec<u32>>> = Arc::default();
    let server = MockServer::serve(move |index, conn| {
        // The first connection is dropped right away.
        if index > 0 {
            common::calculate(conn, &log, &ids);
        }
    });

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let client = Client::builder("127.0.0.1", server.port())
        .timeout(Duration::from_secs(5))
        .on_state_change(move |client, prev, next| {
            sink.lock().unwrap().push((prev, next));
            if next == ConnectionState::Disconnected {
                // The attempt starts without polling the future.
                let _ = client.async_reconnect();
            }
        })
        .connect()
        .unwrap();

    assert!(eventually(Duration::from_secs(2), || seen.lock().unwrap().len() == 3));
    use ConnectionState::*;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (Initial, Connected),
            (Connected, Disconnected),
            (Disconnected, Connected)
        ]
    );
    let sum: i64 = client.call("add", &(4, 5)).unwrap();
    assert_eq!(sum, 9);
}

#[test]
fn test_reconnect_after_disconnect() {
    let log: common::NotificationLog = Arc::default();
    let ids: Arc<Mutex<Vec<u32>>> = Arc::default();
    let server = MockServer::serve(move |index, conn| {
        // The first connection is dropped right away.
        if index > 0 {
            common::calculate(conn, &log, &ids);
        }
    });
    let client = client(server.port());

    assert!(eventually(Duration::from_secs(2), || {
        client.connection_state() == ConnectionState::Disconnected
    }));
    assert!(matches!(
        client.call::<_, i64>("add", &(1, 2)),
        Err(ClientError::NotConnected)
    ));

    assert_eq!(client.reconnect().unwrap(), ConnectionState::Connected);
    let sum: i64 = client.call("add", &(1, 2)).unwrap();
    assert_eq!(sum, 3);

    // Reconnecting while connected keeps the connection.
    assert_eq!(client.reconnect().unwrap(), ConnectionState::Connected);
    let sum: i64 = client.call("add", &(2, 2)).unwrap();
    assert_eq!(sum, 4);
}

#[test]
fn test_concurrent_reconnects_share_one_attempt() {
    let server = MockServer::calculator();
    init_tracing();
    let client = Arc::new(
        Client::builder("127.0.0.1", server.port())
            .timeout(Duration::from_secs(5))
            .connect()
            .unwrap(),
    );

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let client = client.clone();
            thread::spawn(move || client.reconnect().unwrap())
        })
        .collect();
    for thread in threads {
        assert_eq!(thread.join().unwrap(), ConnectionState::Connected);
    }
    let sum: i64 = client.call("add", &(20, 22)).unwrap();
    assert_eq!(sum, 42);
}

#[test]
fn test_not_connected_fails_fast() {
    let client = client(closed_port());
    assert!(matches!(
        client.wait_for_connection(),
        Err(ClientError::NotConnected)
    ));

    let start = Instant::now();
    let handle = client.async_call("add", &(1, 2)).unwrap();
    assert!(matches!(handle.wait(None), Err(ClientError::NotConnected)));
    assert!(matches!(
        client.call::<_, i64>("add", &(1, 2)),
        Err(ClientError::NotConnected)
    ));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_notification_reaches_server() {
    let server = MockServer::calculator();
    let client = client(server.port());
    client.wait_for_connection().unwrap();

    client.notify("log", &("hello", 1)).unwrap();
    // Same connection, written in order: once this returns the log is in.
    let _: i64 = client.call("add", &(0, 0)).unwrap();

    let notifications = server.notifications.lock().unwrap();
    assert_eq!(
        *notifications,
        vec![(
            "log".to_string(),
            vec![Value::from("hello"), Value::from(1)]
        )]
    );
}

#[test]
fn test_concurrent_callers_get_their_own_results() {
    let server = MockServer::calculator();
    let client = Arc::new(client(server.port()));

    let threads: Vec<_> = (0..8)
        .map(|t| {
            let client = client.clone();
            thread::spawn(move || {
                for i in 0..50i64 {
                    let n = t * 1000 + i;
                    let echoed: i64 = client.call("echo", &(n,)).unwrap();
                    assert_eq!(echoed, n);
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let mut ids = server.request_ids.lock().unwrap().clone();
    assert_eq!(ids.len(), 400);
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 400, "call ids were reused");
    assert_eq!(client.pending_calls(), 0);
}

#[test]
fn test_bad_bytes_halt_the_read_loop() {
    let server = MockServer::script(|mut conn| {
        let _ = conn.next_request().unwrap();
        // 0xc1 is never valid MessagePack.
        conn.send_raw(&[0xc1]);
        while conn.next_message().is_some() {}
    });
    let client = client(server.port());

    let result = client.call::<_, Value>("anything", &());
    assert!(matches!(result, Err(ClientError::ReadLoopHalted(_))), "{:?}", result);

    // The connection stays up; new calls fail until reconnected.
    assert!(client.is_connected());
    let handle = client.async_call("again", &()).unwrap();
    assert!(matches!(
        handle.wait(Some(Duration::from_secs(1))),
        Err(ClientError::ReadLoopHalted(_))
    ));

    drop(client);
    server.finish();
}

#[test]
fn test_drop_fails_pending_calls() {
    let server = MockServer::script(|mut conn| {
        // Never answer; wait for the client to go away.
        while conn.next_message().is_some() {}
    });
    let client = client(server.port());
    client.wait_for_connection().unwrap();

    let handle = client.async_call("never", &()).unwrap();
    drop(client);
    assert!(matches!(handle.wait(None), Err(ClientError::Shutdown)));

    server.finish();
}

#[test]
fn test_from_config() {
    let server = MockServer::calculator();
    let config = ClientConfig::from_json(&format!(
        r#"{{ "address": "127.0.0.1", "port": {}, "timeout_ms": 5000, "thread_name": "rpc-io" }}"#,
        server.port()
    ))
    .unwrap();

    let client = Client::from_config(config).unwrap();
    let diff: i64 = client.call("sub", &(10, 4)).unwrap();
    assert_eq!(diff, 6);
    assert_eq!(client.endpoint().port(), server.port());
}

#[tokio::test]
async fn test_async_call_from_tokio() {
    let server = MockServer::calculator();
    let client = client(server.port());

    let add = client.async_call("add", &(2, 3)).unwrap();
    let sub = client.async_call("sub", &(5, 1)).unwrap();
    let (sum, diff) = tokio::join!(add.decode::<i64>(), sub.decode::<i64>());
    assert_eq!(sum.unwrap(), 5);
    assert_eq!(diff.unwrap(), 4);

    client.async_wait_all_responses().await.unwrap();
    assert_eq!(client.async_reconnect().await.unwrap(), ConnectionState::Connected);
}
