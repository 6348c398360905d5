//! Proxy routing: absolute-form targets, credentials, `no_proxy` bypass.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use pipenet::{Call, CondensedStatus, Pipeline, ProxyConfig};
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

fn spawn_recording_server(
    listener: TcpListener,
    body: &'static str,
) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let addr = listener.local_addr().unwrap();
    let heads = Arc::new(Mutex::new(Vec::new()));
    let log = heads.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { break };
            let log = log.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                while let Some(head) = read_request_head(&mut stream, &mut buf).await {
                    log.lock().unwrap().push(head);
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    stream.write_all(resp.as_bytes()).await.ok();
                }
            });
        }
    });
    (addr, heads)
}

#[tokio::test]
async fn test_proxied_call_uses_absolute_form_and_credentials() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (proxy_addr, heads) = spawn_recording_server(listener, "via-proxy");

    let mut pipeline = Pipeline::new();
    pipeline.set_proxy(
        ProxyConfig::new(proxy_addr.ip().to_string(), proxy_addr.port()).with_auth("u", "p"),
    );

    let outcome = Arc::new(Mutex::new(None));
    let o = outcome.clone();
    pipeline.add_with_callback(
        Call::get("http://upstream.example/data?q=1").unwrap(),
        move |c| {
            *o.lock().unwrap() = Some((
                c.status().clone(),
                c.response_body().map(|b| b.to_vec()),
            ));
        },
    );
    pipeline.run().await.unwrap();

    let guard = outcome.lock().unwrap();
    let (status, body) = guard.as_ref().unwrap();
    assert_eq!(*status, CondensedStatus::Successful);
    assert_eq!(body.as_deref(), Some(&b"via-proxy"[..]));

    let heads = heads.lock().unwrap();
    assert_eq!(heads.len(), 1);
    let head = &heads[0];
    // Proxy-mode requests carry the absolute request target.
    assert!(
        head.starts_with("GET http://upstream.example/data?q=1 HTTP/1.1"),
        "got: {}",
        head
    );
    assert!(head
        .lines()
        .any(|l| l.to_lowercase().starts_with("proxy-authorization: basic dtpw")));
    assert!(head
        .lines()
        .any(|l| l.to_lowercase() == "host: upstream.example"));
}

#[tokio::test]
async fn test_no_proxy_rule_bypasses_proxy() {
    // The "proxy" would fail the test if contacted at all.
    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (proxy_addr, proxy_heads) = spawn_recording_server(proxy_listener, "wrong-path");

    let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (origin_addr, origin_heads) = spawn_recording_server(origin_listener, "direct");

    let mut pipeline = Pipeline::new();
    pipeline.set_proxy(
        ProxyConfig::new(proxy_addr.ip().to_string(), proxy_addr.port())
            .with_no_proxy("127.0.0.1"),
    );

    let outcome = Arc::new(Mutex::new(None));
    let o = outcome.clone();
    pipeline.add_with_callback(
        Call::get(&format!("http://{}/local", origin_addr)).unwrap(),
        move |c| {
            *o.lock().unwrap() = Some((
                c.status().clone(),
                c.response_body().map(|b| b.to_vec()),
            ));
        },
    );
    pipeline.run().await.unwrap();

    let guard = outcome.lock().unwrap();
    let (status, body) = guard.as_ref().unwrap();
    assert_eq!(*status, CondensedStatus::Successful);
    assert_eq!(body.as_deref(), Some(&b"direct"[..]));

    assert!(proxy_heads.lock().unwrap().is_empty());
    let origin = origin_heads.lock().unwrap();
    assert_eq!(origin.len(), 1);
    // Direct calls use the origin-form target.
    assert!(origin[0].starts_with("GET /local HTTP/1.1"), "got: {}", origin[0]);
}

#[tokio::test]
async fn test_per_call_proxy_opt_out() {
    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (proxy_addr, proxy_heads) = spawn_recording_server(proxy_listener, "proxied");

    let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (origin_addr, origin_heads) = spawn_recording_server(origin_listener, "direct");

    let mut pipeline = Pipeline::new();
    pipeline.set_proxy(ProxyConfig::new(
        proxy_addr.ip().to_string(),
        proxy_addr.port(),
    ));

    let mut call = Call::get(&format!("http://{}/mine", origin_addr)).unwrap();
    call.set_proxy_enabled(false);
    let outcome = Arc::new(Mutex::new(None));
    let o = outcome.clone();
    pipeline.add_with_callback(call, move |c| {
        *o.lock().unwrap() = Some(c.status().clone());
    });
    pipeline.run().await.unwrap();

    assert_eq!(
        outcome.lock().unwrap().as_ref(),
        Some(&CondensedStatus::Successful)
    );
    assert!(proxy_heads.lock().unwrap().is_empty());
    assert_eq!(origin_heads.lock().unwrap().len(), 1);
}
