mod common;

use common::{setup_logger, EchoServer, PASSWORD};
use std::net::SocketAddr;
use tiny_ss_lib::{Method, ShadowsocksSettingsBuilder, Tunnel};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpListener, TcpStream},
	runtime::Runtime,
};

const REMOTE_ADDR: &str = "example.com";
const REMOTE_PORT: &str = "443";

async fn spawn_tunnel(method: Method, server: SocketAddr) -> SocketAddr {
	let settings = ShadowsocksSettingsBuilder {
		remote_addr: REMOTE_ADDR.into(),
		remote_port: REMOTE_PORT.into(),
		password: PASSWORD.into(),
		method: method.as_str().into(),
		internal_buffer_size: 0,
		server: Some(server.to_string()),
	}
	.build()
	.unwrap();
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let tunnel = Tunnel::new(settings);
	tokio::spawn(async move { tunnel.serve_listener(listener).await });
	addr
}

async fn echo_through(tunnel_addr: SocketAddr, data: &[u8]) -> Vec<u8> {
	let mut stream = TcpStream::connect(tunnel_addr).await.unwrap();
	stream.write_all(data).await.unwrap();
	stream.shutdown().await.unwrap();
	let mut echoed = Vec::new();
	stream.read_to_end(&mut echoed).await.unwrap();
	echoed
}

fn test_data(len: usize) -> Vec<u8> {
	"What is the meaning of this? "
		.bytes()
		.cycle()
		.take(len)
		.collect()
}

#[test]
fn test_integration_tunnel() {
	setup_logger();
	Runtime::new().unwrap().block_on(async {
		for method in Method::ALL.iter().copied() {
			log::warn!("Testing tunnel with method {}", method);
			let server = EchoServer::spawn(method).await.unwrap();
			let tunnel_addr = spawn_tunnel(method, server.addr).await;

			let data = test_data(1000);
			assert_eq!(echo_through(tunnel_addr, &data).await, data, "{}", method);

			let dsts = server.destinations.lock().unwrap();
			assert_eq!(dsts.len(), 1);
			assert_eq!(dsts[0].to_string(), format!("{}:{}", REMOTE_ADDR, REMOTE_PORT));
		}
	});
}

#[test]
fn test_integration_large_payload() {
	setup_logger();
	Runtime::new().unwrap().block_on(async {
		for method in [Method::Aes128Gcm, Method::ChaCha20Ietf] {
			let server = EchoServer::spawn(method).await.unwrap();
			let tunnel_addr = spawn_tunnel(method, server.addr).await;

			let data = test_data(100 * 1024);
			assert_eq!(echo_through(tunnel_addr, &data).await, data, "{}", method);
		}
	});
}

#[test]
fn test_integration_multiple_connections() {
	setup_logger();
	Runtime::new().unwrap().block_on(async {
		let method = Method::ChaCha20IetfPoly1305;
		let server = EchoServer::spawn(method).await.unwrap();
		let tunnel_addr = spawn_tunnel(method, server.addr).await;

		let tasks = (0..8_usize)
			.map(|i| {
				tokio::spawn(async move {
					let data = test_data(100 + i * 1000);
					assert_eq!(echo_through(tunnel_addr, &data).await, data);
				})
			})
			.collect::<Vec<_>>();
		for task in tasks {
			task.await.unwrap();
		}
		assert_eq!(server.destinations.lock().unwrap().len(), 8);
	});
}

#[test]
fn test_integration_server_unreachable() {
	setup_logger();
	Runtime::new().unwrap().block_on(async {
		// Bind and drop to get a port nobody listens on.
		let server_addr = {
			let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
			listener.local_addr().unwrap()
		};
		let tunnel_addr = spawn_tunnel(Method::Aes256Gcm, server_addr).await;

		let mut stream = TcpStream::connect(tunnel_addr).await.unwrap();
		let mut buf = Vec::new();
		// The tunnel drops the local connection, which may show up as a reset.
		let _ = stream.read_to_end(&mut buf).await;
		assert!(buf.is_empty());
	});
}
