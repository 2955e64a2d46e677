use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::{header, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};

/// First bytes of an HTTP/2 prior-knowledge connection
const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0";

/// A request as seen by the loopback server
#[derive(Debug, Clone)]
pub struct CapturedRequest {
	pub method: String,
	pub target: String,
	pub headers: Vec<(String, String)>,
	pub body: Vec<u8>,
}

impl CapturedRequest {
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.iter()
			.find(|(k, _)| k.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}

	/// DNS message carried by a DoH GET or POST
	pub fn dns_message(&self) -> Message {
		let wire = if self.method == "GET" {
			let encoded = self.target.split("dns=").nth(1).unwrap();
			URL_SAFE_NO_PAD.decode(encoded).unwrap()
		} else {
			self.body.clone()
		};
		Message::from_vec(&wire).unwrap()
	}
}

pub struct CannedResponse {
	pub status: u16,
	pub body: Vec<u8>,
}

/// Answer the DoH query in `request` with one A record per address.
pub fn answer_with(request: &CapturedRequest, addrs: &[Ipv4Addr]) -> CannedResponse {
	let query = request.dns_message();
	let name = query.queries()[0].name().clone();
	let mut response = Message::new();
	response.set_id(query.id());
	response.set_message_type(MessageType::Response);
	response.add_query(query.queries()[0].clone());
	for addr in addrs {
		response.add_answer(Record::from_rdata(name.clone(), 60, RData::A(A::from(*addr))));
	}
	CannedResponse { status: 200, body: response.to_vec().unwrap() }
}

type Handler = Arc<dyn Fn(&CapturedRequest) -> CannedResponse + Send + Sync>;

/// HTTP/1.1-only hyper server on 127.0.0.1 answering every request through a
/// handler. HTTP/2 prior-knowledge prefaces are counted and dropped.
pub struct LoopbackServer {
	pub addr: SocketAddr,
	requests: Arc<Mutex<Vec<CapturedRequest>>>,
	h2_attempts: Arc<AtomicUsize>,
}

impl LoopbackServer {
	pub async fn start<F>(handler: F) -> Self
	where
		F: Fn(&CapturedRequest) -> CannedResponse + Send + Sync + 'static,
	{
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let requests = Arc::new(Mutex::new(Vec::new()));
		let h2_attempts = Arc::new(AtomicUsize::new(0));
		let handler: Handler = Arc::new(handler);

		let (reqs, h2) = (requests.clone(), h2_attempts.clone());
		tokio::spawn(async move {
			loop {
				let Ok((stream, _)) = listener.accept().await else { break };
				let (handler, reqs, h2) = (handler.clone(), reqs.clone(), h2.clone());
				tokio::spawn(async move {
					serve(stream, handler, reqs, h2).await;
				});
			}
		});

		Self { addr, requests, h2_attempts }
	}

	/// Serve the same status and body to every request
	pub async fn fixed(status: u16, body: Vec<u8>) -> Self {
		Self::start(move |_| CannedResponse { status, body: body.clone() }).await
	}

	pub fn requests(&self) -> Vec<CapturedRequest> {
		self.requests.lock().unwrap().clone()
	}

	pub fn h2_attempts(&self) -> usize {
		self.h2_attempts.load(Ordering::SeqCst)
	}
}

async fn handle(
	req: Request<Incoming>,
	handler: Handler,
	requests: Arc<Mutex<Vec<CapturedRequest>>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
	let method = req.method().to_string();
	let target = req.uri().to_string();
	let headers = req.headers().iter()
		.map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
		.collect();
	let body = match req.into_body().collect().await {
		Ok(collected) => collected.to_bytes().to_vec(),
		Err(_) => Vec::new(),
	};

	let request = CapturedRequest { method, target, headers, body };
	let canned = handler(&request);
	requests.lock().unwrap().push(request);

	let response = Response::builder()
		.status(canned.status)
		.header(header::CONTENT_TYPE, "application/octet-stream")
		.body(Full::new(Bytes::from(canned.body)))
		.unwrap();
	Ok(response)
}

async fn serve(
	stream: TcpStream,
	handler: Handler,
	requests: Arc<Mutex<Vec<CapturedRequest>>>,
	h2_attempts: Arc<AtomicUsize>,
) {
	let mut head = [0u8; 14];
	if let Ok(n) = stream.peek(&mut head).await {
		if n >= 3 && head[..n] == H2_PREFACE[..n] {
			h2_attempts.fetch_add(1, Ordering::SeqCst);
			return;
		}
	}

	let service = hyper::service::service_fn(move |req| {
		handle(req, handler.clone(), requests.clone())
	});
	let _ = http1::Builder::new()
		.keep_alive(false)
		.serve_connection(TokioIo::new(stream), service)
		.await;
}
