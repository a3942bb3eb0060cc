#![allow(dead_code)]

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// a request head as the upstream received it, header names lowercased
#[derive(Debug)]
pub struct SeenRequest {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
}

impl SeenRequest {
    pub fn path(&self) -> &str {
        self.request_line.split(' ').nth(1).unwrap_or("")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

pub struct Upstream {
    pub port: u16,
    pub requests: mpsc::UnboundedReceiver<SeenRequest>,
}

/// plain http/1.1 server on 127.0.0.1 that answers every request with `respond`, keep-alive included
pub async fn spawn_upstream<F>(respond: F) -> Upstream
where
    F: Fn(&SeenRequest) -> Vec<u8> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, requests) = mpsc::unbounded_channel();
    let respond = Arc::new(respond);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_connection(stream, tx.clone(), respond.clone()));
        }
    });

    Upstream { port, requests }
}

/// a port nothing is listening on
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub fn http_response(status: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut head = format!("HTTP/1.1 {}\r\n", status);
    for (name, value) in headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str(&format!("content-length: {}\r\n\r\n", body.len()));

    let mut response = head.into_bytes();
    response.extend_from_slice(body);
    response
}

async fn serve_connection<F>(
    mut stream: TcpStream,
    tx: mpsc::UnboundedSender<SeenRequest>,
    respond: Arc<F>,
) where
    F: Fn(&SeenRequest) -> Vec<u8> + Send + Sync + 'static,
{
    let mut buffered = Vec::new();

    while let Some(request) = read_request(&mut stream, &mut buffered).await {
        let response = (*respond)(&request);
        let _ = tx.send(request);
        if stream.write_all(&response).await.is_err() {
            return;
        }
    }
}

// heads only, none of the requests we send upstream in tests carry a body
async fn read_request(stream: &mut TcpStream, buffered: &mut Vec<u8>) -> Option<SeenRequest> {
    loop {
        if let Some(end) = buffered.windows(4).position(|w| w == b"\r\n\r\n") {
            let head: Vec<u8> = buffered.drain(..end + 4).collect();
            let head = String::from_utf8_lossy(&head).into_owned();
            let mut lines = head.split("\r\n").filter(|l| !l.is_empty());

            let request_line = lines.next()?.to_string();
            let headers = lines
                .filter_map(|l| l.split_once(':'))
                .map(|(n, v)| (n.trim().to_ascii_lowercase(), v.trim().to_string()))
                .collect();

            return Some(SeenRequest {
                request_line,
                headers,
            });
        }

        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buffered.extend_from_slice(&chunk[..n]);
    }
}
