//! Authentication rounds against a scripted origin server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pipenet::auth::{BasicAuthHandler, DigestAuthHandler, Key};
use pipenet::{Call, CondensedStatus, Pipeline};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn read_request_head(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Option<String> {
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_string();
            buf.drain(..end + 4);
            return Some(head);
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn header_of<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim())
        } else {
            None
        }
    })
}

fn spawn_server<F, Fut>(listener: TcpListener, handler: F) -> SocketAddr
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let handler = handler.clone();
            tokio::spawn(async move { handler(stream).await });
        }
    });
    addr
}

#[tokio::test]
async fn test_digest_challenge_round() {
    let authorizations = Arc::new(Mutex::new(Vec::<String>::new()));
    let seen = authorizations.clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = spawn_server(listener, move |mut stream| {
        let seen = seen.clone();
        async move {
            let mut buf = Vec::new();
            while let Some(head) = read_request_head(&mut stream, &mut buf).await {
                match header_of(&head, "authorization") {
                    None => {
                        stream
                            .write_all(
                                b"HTTP/1.1 401 Unauthorized\r\n\
                                  WWW-Authenticate: Digest realm=\"x\", nonce=\"abc\", qop=\"auth\"\r\n\
                                  Content-Length: 0\r\n\r\n",
                            )
                            .await
                            .ok();
                    }
                    Some(auth) => {
                        seen.lock().unwrap().push(auth.to_string());
                        stream
                            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecret")
                            .await
                            .ok();
                    }
                }
            }
        }
    });

    let mut pipeline = Pipeline::new();
    pipeline.register_auth_handler(Arc::new(DigestAuthHandler::new()));
    pipeline.add_key(Key::new("mufasa", "circle", "x", Vec::new()));

    let outcome = Arc::new(Mutex::new(None));
    let o = outcome.clone();
    pipeline.add_with_callback(
        Call::get(&format!("http://{}/protected", addr)).unwrap(),
        move |c| {
            *o.lock().unwrap() = Some((
                c.status().clone(),
                c.response_status().map(|s| s.as_u16()),
                c.response_body().map(|b| b.to_vec()),
            ));
        },
    );
    pipeline.run().await.unwrap();

    let guard = outcome.lock().unwrap();
    let (status, code, body) = guard.as_ref().unwrap();
    assert_eq!(*status, CondensedStatus::Successful);
    assert_eq!(*code, Some(200));
    assert_eq!(body.as_deref(), Some(&b"secret"[..]));

    let auths = authorizations.lock().unwrap();
    assert_eq!(auths.len(), 1);
    let auth = &auths[0];
    assert!(auth.starts_with("Digest username=\"mufasa\""), "got: {}", auth);
    assert!(auth.contains("realm=\"x\""));
    assert!(auth.contains("nonce=\"abc\""));
    assert!(auth.contains("uri=\"/protected\""));
    assert!(auth.contains("qop=auth"));
    assert!(auth.contains("nc=00000001"));
    assert!(auth.contains("cnonce=\""));
    assert!(auth.contains("response=\""));
}

#[tokio::test]
async fn test_basic_auth_in_advance_covers_protection_space() {
    let requests = Arc::new(Mutex::new(Vec::<(String, Option<String>)>::new()));
    let log = requests.clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = spawn_server(listener, move |mut stream| {
        let log = log.clone();
        async move {
            let mut buf = Vec::new();
            while let Some(head) = read_request_head(&mut stream, &mut buf).await {
                let target = head.split_whitespace().nth(1).unwrap_or("").to_string();
                let auth = header_of(&head, "authorization").map(str::to_string);
                let authorized = auth.is_some();
                log.lock().unwrap().push((target, auth));
                if authorized {
                    stream
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                        .await
                        .ok();
                } else {
                    stream
                        .write_all(
                            b"HTTP/1.1 401 Unauthorized\r\n\
                              WWW-Authenticate: Basic realm=\"vault\"\r\n\
                              Content-Length: 0\r\n\r\n",
                        )
                        .await
                        .ok();
                }
            }
        }
    });

    let mut pipeline = Pipeline::new();
    pipeline.register_auth_handler(Arc::new(BasicAuthHandler::new().with_auth_in_advance(true)));
    pipeline.add_key(Key::new("alice", "pw", "vault", Vec::new()));

    let first_done = Arc::new(Mutex::new(None));
    let o = first_done.clone();
    let handle = pipeline.handle();
    let second_url = format!("http://{}/vault/b", addr);
    let second_done = Arc::new(Mutex::new(None));
    let o2 = second_done.clone();
    pipeline.add_with_callback(
        Call::get(&format!("http://{}/vault/a", addr)).unwrap(),
        move |c| {
            *o.lock().unwrap() = Some(c.status().clone());
            // The second call enters the established protection space.
            let call = Call::get(&second_url).unwrap();
            let o2 = o2.clone();
            handle
                .add_with_callback(call, move |c| {
                    *o2.lock().unwrap() = Some(c.status().clone());
                })
                .unwrap();
        },
    );
    pipeline.run().await.unwrap();

    assert_eq!(
        first_done.lock().unwrap().as_ref(),
        Some(&CondensedStatus::Successful)
    );
    assert_eq!(
        second_done.lock().unwrap().as_ref(),
        Some(&CondensedStatus::Successful)
    );

    let log = requests.lock().unwrap();
    // Challenge round for /vault/a, then /vault/b authorized in advance.
    assert_eq!(log.len(), 3);
    assert_eq!(log[0].0, "/vault/a");
    assert!(log[0].1.is_none());
    assert_eq!(log[1].0, "/vault/a");
    assert_eq!(log[1].1.as_deref(), Some("Basic YWxpY2U6cHc="));
    assert_eq!(log[2].0, "/vault/b");
    assert_eq!(log[2].1.as_deref(), Some("Basic YWxpY2U6cHc="));
}

#[tokio::test]
async fn test_basic_auth_without_key_delivers_challenge() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = spawn_server(listener, |mut stream| async move {
        let mut buf = Vec::new();
        while read_request_head(&mut stream, &mut buf).await.is_some() {
            stream
                .write_all(
                    b"HTTP/1.1 401 Unauthorized\r\n\
                      WWW-Authenticate: Basic realm=\"nope\"\r\n\
                      Content-Length: 6\r\n\r\ndenied",
                )
                .await
                .ok();
        }
    });

    let mut pipeline = Pipeline::new();
    pipeline.register_auth_handler(Arc::new(BasicAuthHandler::new()));
    // No key in the ring: the challenge is delivered verbatim.

    let outcome = Arc::new(Mutex::new(None));
    let o = outcome.clone();
    pipeline.add_with_callback(
        Call::get(&format!("http://{}/secret", addr)).unwrap(),
        move |c| {
            *o.lock().unwrap() = Some((
                c.status().clone(),
                c.response_status().map(|s| s.as_u16()),
                c.response_body().map(|b| b.to_vec()),
            ));
        },
    );
    pipeline.run().await.unwrap();

    let guard = outcome.lock().unwrap();
    let (status, code, body) = guard.as_ref().unwrap();
    assert_eq!(*status, CondensedStatus::ClientError);
    assert_eq!(*code, Some(401));
    assert_eq!(body.as_deref(), Some(&b"denied"[..]));
}

#[tokio::test]
async fn test_wrong_basic_credentials_terminate_after_one_round() {
    let rounds = Arc::new(AtomicUsize::new(0));
    let counter = rounds.clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = spawn_server(listener, move |mut stream| {
        let counter = counter.clone();
        async move {
            let mut buf = Vec::new();
            while read_request_head(&mut stream, &mut buf).await.is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
                stream
                    .write_all(
                        b"HTTP/1.1 401 Unauthorized\r\n\
                          WWW-Authenticate: Basic realm=\"strict\"\r\n\
                          Content-Length: 0\r\n\r\n",
                    )
                    .await
                    .ok();
            }
        }
    });

    let mut pipeline = Pipeline::new();
    pipeline.register_auth_handler(Arc::new(BasicAuthHandler::new()));
    pipeline.add_key(Key::new("bob", "wrong", "strict", Vec::new()));

    let outcome = Arc::new(Mutex::new(None));
    let o = outcome.clone();
    pipeline.add_with_callback(
        Call::get(&format!("http://{}/strict", addr)).unwrap(),
        move |c| {
            *o.lock().unwrap() = Some(c.status().clone());
        },
    );
    pipeline.run().await.unwrap();

    // Basic has no stale semantics: a repeat challenge is terminal.
    assert_eq!(
        outcome.lock().unwrap().as_ref(),
        Some(&CondensedStatus::ClientError)
    );
    assert_eq!(rounds.load(Ordering::SeqCst), 2);
}
