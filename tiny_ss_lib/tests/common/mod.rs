use log::{debug, error};
use rand::{rngs::OsRng, RngCore};
use std::{
	error::Error as StdErr,
	net::SocketAddr,
	sync::{Arc, Mutex},
};
use tiny_ss_lib::{
	protocol::SocksAddr,
	proxy::shadowsocks::{password_to_key, Method, Primitive},
	utils::codec::{Reader, Writer, MAX_PACKET_SIZE},
};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpListener, TcpStream},
};

type BoxStdErr = Box<dyn StdErr + Send + Sync>;

pub const PASSWORD: &str = "integration-test-password";

pub fn setup_logger() {
	let _ = env_logger::builder().is_test(true).try_init();
}

/// A Shadowsocks server that sends back the payload of each request.
///
/// The request is read until the client shuts down its write side.
pub struct EchoServer {
	pub addr: SocketAddr,
	/// Destinations requested by clients, in order.
	pub destinations: Arc<Mutex<Vec<SocksAddr>>>,
}

impl EchoServer {
	pub async fn spawn(method: Method) -> Result<Self, BoxStdErr> {
		let listener = TcpListener::bind("127.0.0.1:0").await?;
		let addr = listener.local_addr()?;
		let destinations = Arc::new(Mutex::new(Vec::new()));
		let key = password_to_key(method.key_len(), PASSWORD);

		let records = destinations.clone();
		tokio::spawn(async move {
			loop {
				let (stream, peer) = match listener.accept().await {
					Ok(s) => s,
					Err(e) => {
						error!("Echo server cannot accept connection ({})", e);
						return;
					}
				};
				let key = key.clone();
				let records = records.clone();
				tokio::spawn(async move {
					match serve_connection(stream, method, &key, &records).await {
						Ok(()) => debug!("Echo server finished request from {}", peer),
						Err(e) => error!("Echo server error on connection from {} ({})", peer, e),
					}
				});
			}
		});

		Ok(Self { addr, destinations })
	}
}

async fn serve_connection(
	mut stream: TcpStream,
	method: Method,
	key: &[u8],
	records: &Mutex<Vec<SocksAddr>>,
) -> Result<(), BoxStdErr> {
	let (mut r, mut w) = stream.split();

	let mut salt = vec![0_u8; method.salt_len()];
	r.read_exact(&mut salt).await?;
	let mut request = Vec::new();
	match method.new_primitive(key, &salt)? {
		Primitive::Aead(cipher) => {
			let mut reader = Reader::new(&mut r, cipher, MAX_PACKET_SIZE);
			reader.write_to(&mut request).await?;
		}
		Primitive::Stream(mut cipher) => {
			r.read_to_end(&mut request).await?;
			cipher.apply_keystream(&mut request);
		}
	}
	let (dst, len) = SocksAddr::read_from_bytes(&request)?;
	let payload = &request[usize::from(len.get())..];
	debug!("Echo server received request to {}", dst);
	records.lock().unwrap().push(dst);

	let mut resp_salt = vec![0_u8; method.salt_len()];
	OsRng.fill_bytes(&mut resp_salt);
	match method.new_primitive(key, &resp_salt)? {
		Primitive::Aead(cipher) => {
			w.write_all(&resp_salt).await?;
			let mut writer = Writer::new(&mut w, cipher, MAX_PACKET_SIZE);
			writer.write(payload).await?;
			writer.shutdown().await?;
		}
		Primitive::Stream(mut cipher) => {
			let mut response = payload.to_vec();
			cipher.apply_keystream(&mut response);
			w.write_all(&resp_salt).await?;
			w.write_all(&response).await?;
			w.shutdown().await?;
		}
	}
	Ok(())
}
