//! Redirect handling across origins and the loop guard.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pipenet::{Call, CondensedStatus, NetError, Pipeline, RedirectMode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Reads one request: returns the head text, draining head and body.
async fn read_request_head(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Option<String> {
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_string();
            let content_length = head
                .lines()
                .find_map(|l| {
                    l.to_lowercase()
                        .strip_prefix("content-length:")
                        .map(str::to_string)
                })
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            let total = end + 4 + content_length;
            while buf.len() < total {
                let mut chunk = [0u8; 4096];
                let n = stream.read(&mut chunk).await.ok()?;
                if n == 0 {
                    return None;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            buf.drain(..total);
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

fn spawn_server<F, Fut>(listener: TcpListener, handler: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            counter.fetch_add(1, Ordering::SeqCst);
            let handler = handler.clone();
            tokio::spawn(async move { handler(stream).await });
        }
    });
    (addr, accepted)
}

#[tokio::test]
async fn test_redirect_moves_call_across_origins() {
    // Origin B answers with content.
    let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (addr_b, accepted_b) = spawn_server(listener_b, |mut stream| async move {
        let mut buf = Vec::new();
        while let Some(head) = read_request_head(&mut stream, &mut buf).await {
            assert!(head.starts_with("GET /2 "));
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nfinal")
                .await
                .ok();
        }
    });

    // Origin A redirects to B.
    let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let location = format!("http://{}/2", addr_b);
    let (addr_a, accepted_a) = spawn_server(listener_a, move |mut stream| {
        let location = location.clone();
        async move {
            let mut buf = Vec::new();
            while read_request_head(&mut stream, &mut buf).await.is_some() {
                let resp = format!(
                    "HTTP/1.1 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\n\r\n",
                    location
                );
                stream.write_all(resp.as_bytes()).await.ok();
            }
        }
    });

    let mut pipeline = Pipeline::new();
    let outcome = Arc::new(Mutex::new(None));
    let o = outcome.clone();
    pipeline.add_with_callback(
        Call::get(&format!("http://{}/1", addr_a)).unwrap(),
        move |c| {
            *o.lock().unwrap() = Some((
                c.status().clone(),
                c.url().to_string(),
                c.response_body().map(|b| b.to_vec()),
                c.redirect_count(),
            ));
        },
    );
    pipeline.run().await.unwrap();

    let guard = outcome.lock().unwrap();
    let (status, url, body, redirects) = guard.as_ref().unwrap();
    assert_eq!(*status, CondensedStatus::Successful);
    assert_eq!(url, &format!("http://{}/2", addr_b));
    assert_eq!(body.as_deref(), Some(&b"final"[..]));
    assert_eq!(*redirects, 1);

    assert_eq!(accepted_a.load(Ordering::SeqCst), 1);
    assert_eq!(accepted_b.load(Ordering::SeqCst), 1);
    let counters = pipeline.counters();
    assert_eq!(counters.new_connections, 2);
}

#[tokio::test]
async fn test_redirect_loop_terminates_with_too_many_redirections() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hops = Arc::new(AtomicUsize::new(0));
    let hop_counter = hops.clone();
    let (addr, _) = spawn_server(listener, move |mut stream| {
        let hops = hop_counter.clone();
        async move {
            let mut buf = Vec::new();
            while read_request_head(&mut stream, &mut buf).await.is_some() {
                let n = hops.fetch_add(1, Ordering::SeqCst);
                let resp = format!(
                    "HTTP/1.1 302 Found\r\nLocation: /hop/{}\r\nContent-Length: 0\r\n\r\n",
                    n + 1
                );
                stream.write_all(resp.as_bytes()).await.ok();
            }
        }
    });

    let mut pipeline = Pipeline::new();
    let outcome = Arc::new(Mutex::new(None));
    let o = outcome.clone();
    pipeline.add_with_callback(
        Call::get(&format!("http://{}/hop/0", addr)).unwrap(),
        move |c| {
            *o.lock().unwrap() = Some((c.status().clone(), c.redirect_count()));
        },
    );
    pipeline.run().await.unwrap();

    let guard = outcome.lock().unwrap();
    let (status, redirects) = guard.as_ref().unwrap();
    assert_eq!(
        *status,
        CondensedStatus::ProtocolError(NetError::TooManyRedirections)
    );
    // The default budget allows five follows.
    assert_eq!(*redirects, 5);
}

#[tokio::test]
async fn test_redirect_not_followed_for_post_by_default() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (addr, _) = spawn_server(listener, |mut stream| async move {
        let mut buf = Vec::new();
        // The POST carries a body; drain head plus body loosely.
        if read_request_head(&mut stream, &mut buf).await.is_some() {
            stream
                .write_all(
                    b"HTTP/1.1 302 Found\r\nLocation: /elsewhere\r\nContent-Length: 4\r\n\r\ngone",
                )
                .await
                .ok();
        }
    });

    let mut pipeline = Pipeline::new();
    let mut call = Call::post(&format!("http://{}/form", addr)).unwrap();
    call.set_request_body("a=1");
    let outcome = Arc::new(Mutex::new(None));
    let o = outcome.clone();
    pipeline.add_with_callback(call, move |c| {
        *o.lock().unwrap() = Some((
            c.status().clone(),
            c.response_status().map(|s| s.as_u16()),
            c.response_body().map(|b| b.to_vec()),
        ));
    });
    pipeline.run().await.unwrap();

    let guard = outcome.lock().unwrap();
    let (status, code, body) = guard.as_ref().unwrap();
    // Delivered verbatim: non-idempotent calls do not follow by default.
    assert_eq!(*status, CondensedStatus::Redirection);
    assert_eq!(*code, Some(302));
    assert_eq!(body.as_deref(), Some(&b"gone"[..]));
}

#[tokio::test]
async fn test_post_follows_when_redirect_mode_always() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (addr, _) = spawn_server(listener, |mut stream| async move {
        let mut buf = Vec::new();
        while let Some(head) = read_request_head(&mut stream, &mut buf).await {
            if head.starts_with("POST /form ") {
                // 303 rewrites the method to GET.
                stream
                    .write_all(
                        b"HTTP/1.1 303 See Other\r\nLocation: /done\r\nContent-Length: 0\r\n\r\n",
                    )
                    .await
                    .ok();
            } else {
                assert!(head.starts_with("GET /done "));
                stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                    .await
                    .ok();
            }
        }
    });

    let mut pipeline = Pipeline::new();
    let mut call = Call::post(&format!("http://{}/form", addr)).unwrap();
    call.set_request_body("a=1");
    call.set_redirect_mode(RedirectMode::Always);
    let outcome = Arc::new(Mutex::new(None));
    let o = outcome.clone();
    pipeline.add_with_callback(call, move |c| {
        *o.lock().unwrap() = Some((c.status().clone(), c.method_name().to_string()));
    });
    pipeline.run().await.unwrap();

    let guard = outcome.lock().unwrap();
    let (status, method) = guard.as_ref().unwrap();
    assert_eq!(*status, CondensedStatus::Successful);
    assert_eq!(method, "GET");
}

#[tokio::test]
async fn test_malformed_location_is_url_syntax_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (addr, _) = spawn_server(listener, |mut stream| async move {
        let mut buf = Vec::new();
        if read_request_head(&mut stream, &mut buf).await.is_some() {
            stream
                .write_all(
                    b"HTTP/1.1 302 Found\r\nLocation: mailto:nobody\r\nContent-Length: 0\r\n\r\n",
                )
                .await
                .ok();
        }
    });

    let mut pipeline = Pipeline::new();
    let outcome = Arc::new(Mutex::new(None));
    let o = outcome.clone();
    pipeline.add_with_callback(
        Call::get(&format!("http://{}/away", addr)).unwrap(),
        move |c| {
            *o.lock().unwrap() = Some(c.status().clone());
        },
    );
    pipeline.run().await.unwrap();

    assert!(matches!(
        outcome.lock().unwrap().as_ref(),
        Some(CondensedStatus::ProtocolError(NetError::UrlSyntax(_)))
    ));
}
