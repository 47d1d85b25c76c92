/**********************************************************************

Copyright (C) 2021 by reddal

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

**********************************************************************/

/*!
Destination address header of a shadowsocks request,
which uses the [SOCKS5 address format].

[SOCKS5 address format]: https://tools.ietf.org/html/rfc1928#section-5
*/

use crate::{prelude::*, utils::ReadInt};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use smol_str::SmolStr;
use std::{
	fmt::{self, Display},
	io,
	num::NonZeroU16,
};

const EMPTY_STRING: &str = "empty string";

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AddrType {
	Ipv4 = 1_u8,
	Name = 3_u8,
	Ipv6 = 4_u8,
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
	#[error("str is not utf8 ({0})")]
	StrNotUtf8(std::str::Utf8Error),
	#[error("unknown address type {0}")]
	UnknownAddressType(u8),
	#[error("invalid domain ({0})")]
	InvalidDomain(BoxStdErr),
	#[error("invalid port ({0})")]
	InvalidPort(BoxStdErr),
	#[error("invalid address ({0})")]
	InvalidAddress(BoxStdErr),
	#[error("IO error ({0})")]
	Io(#[from] io::Error),
}

// -------------------------------------------------------
//                     SocksDestination
// -------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SocksDestination {
	/// Must be a valid domain name.
	Name(DomainName),
	Ip(IpAddr),
}

impl SocksDestination {
	#[inline]
	#[must_use]
	pub fn atyp(&self) -> AddrType {
		match self {
			SocksDestination::Name(_) => AddrType::Name,
			SocksDestination::Ip(IpAddr::V4(_)) => AddrType::Ipv4,
			SocksDestination::Ip(IpAddr::V6(_)) => AddrType::Ipv6,
		}
	}

	/// Read a destination of type `atyp` from `r`.
	///
	/// - [`AddrType::Ipv4`]: | 4 bytes |
	/// - [`AddrType::Ipv6`]: | 16 bytes |
	/// - [`AddrType::Name`]: | n, 1 byte | n bytes |
	///
	/// # Errors
	///
	/// Returns [`ReadError`] if `r` fails or contains an invalid domain.
	pub fn read_from_atyp<R>(r: &mut R, atyp: AddrType) -> Result<Self, ReadError>
	where
		R: std::io::Read,
	{
		Ok(match atyp {
			AddrType::Ipv4 => Ipv4Addr::from(r.read_arr::<4>()?).into(),
			AddrType::Ipv6 => Ipv6Addr::from(r.read_arr::<16>()?).into(),
			AddrType::Name => {
				let len = usize::from(r.read_u8()?);
				if len == 0 {
					return Err(ReadError::InvalidDomain(EMPTY_STRING.into()));
				}
				let mut buffer = [0_u8; 255];
				let buffer = &mut buffer[..len];
				r.read_exact(buffer)?;
				let name = std::str::from_utf8(buffer).map_err(ReadError::StrNotUtf8)?;
				SocksDestination::Name(DomainName::from_str(name)?)
			}
		})
	}

	/// Write the destination without ATYP into `buf`.
	pub fn write_to_no_atyp(&self, buf: &mut impl BufMut) {
		match self {
			SocksDestination::Name(name) => {
				buf.put_u8(name.len());
				buf.put_slice(name.as_bytes());
			}
			SocksDestination::Ip(IpAddr::V4(ip)) => buf.put_slice(&ip.octets()),
			SocksDestination::Ip(IpAddr::V6(ip)) => buf.put_slice(&ip.octets()),
		}
	}

	/// Length of the serialized destination, ATYP included.
	#[inline]
	#[must_use]
	pub fn serialized_len_atyp(&self) -> usize {
		1 + match self {
			SocksDestination::Ip(IpAddr::V4(_)) => 4,
			SocksDestination::Ip(IpAddr::V6(_)) => 16,
			SocksDestination::Name(name) => 1 + usize::from(name.len()),
		}
	}
}

impl FromStr for SocksDestination {
	type Err = ReadError;

	/// Parse an IP or a domain.
	///
	/// IPv6 may be wrapped in brackets like `[::1]`.
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.is_empty() {
			return Err(ReadError::InvalidAddress(EMPTY_STRING.into()));
		}
		let ip_str = s
			.strip_prefix('[')
			.and_then(|s| s.strip_suffix(']'))
			.unwrap_or(s);
		if let Ok(ip) = IpAddr::from_str(ip_str) {
			return Ok(Self::Ip(ip));
		}
		DomainName::from_str(s).map(Self::Name)
	}
}

impl From<DomainName> for SocksDestination {
	#[inline]
	fn from(domain: DomainName) -> Self {
		Self::Name(domain)
	}
}

impl From<Ipv4Addr> for SocksDestination {
	#[inline]
	fn from(ip: Ipv4Addr) -> Self {
		Self::Ip(ip.into())
	}
}

impl From<Ipv6Addr> for SocksDestination {
	#[inline]
	fn from(ip: Ipv6Addr) -> Self {
		Self::Ip(ip.into())
	}
}

impl From<IpAddr> for SocksDestination {
	#[inline]
	fn from(ip: IpAddr) -> Self {
		Self::Ip(ip)
	}
}

impl Display for SocksDestination {
	#[inline]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Ip(ip) => ip.fmt(f),
			Self::Name(name) => name.fmt(f),
		}
	}
}

// -------------------------------------------------------
//                       SocksAddr
// -------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SocksAddr {
	pub dest: SocksDestination,
	pub port: u16,
}

impl SocksAddr {
	#[inline]
	#[must_use]
	pub fn new(dest: SocksDestination, port: u16) -> Self {
		Self { dest, port }
	}

	/// Create an address from separated host and port strings,
	/// as found in configuration files.
	///
	/// # Errors
	///
	/// Returns [`ReadError`] if `host` is not an IP or a valid domain,
	/// or `port` is not a valid port number.
	pub fn from_host_port(host: &str, port: &str) -> Result<Self, ReadError> {
		let dest = SocksDestination::from_str(host)?;
		if port.is_empty() {
			return Err(ReadError::InvalidPort(EMPTY_STRING.into()));
		}
		let port = port
			.parse::<u16>()
			.map_err(|e| ReadError::InvalidPort(e.into()))?;
		Ok(Self { dest, port })
	}

	/// Read an address from `r` in the following format:
	/// ```not_rust
	/// +------+----------------+----------------+
	/// | ATYP |  Destination   |     Port       |
	/// +------+----------------+----------------+
	/// | u8   | various bytes  |   2 bytes      |
	/// |      |                | big endian u16 |
	/// +------+----------------+----------------+
	/// ```
	///
	/// # Errors
	///
	/// Returns [`ReadError`] if `r` fails or contains invalid data.
	pub fn read_from<R>(r: &mut R) -> Result<Self, ReadError>
	where
		R: std::io::Read,
	{
		let atyp_num = r.read_u8()?;
		let atyp =
			AddrType::try_from(atyp_num).map_err(|_| ReadError::UnknownAddressType(atyp_num))?;
		let dest = SocksDestination::read_from_atyp(r, atyp)?;
		let port = r.read_u16()?;
		Ok(Self::new(dest, port))
	}

	/// Read an address from the front of `buf`.
	///
	/// Returns the address and the number of bytes it takes.
	///
	/// # Errors
	///
	/// Returns the same error as [`Self::read_from`].
	pub fn read_from_bytes(buf: &[u8]) -> Result<(Self, NonZeroU16), ReadError> {
		let mut cur = std::io::Cursor::new(buf);
		let addr = Self::read_from(&mut cur)?;
		// A serialized address takes at least 7 and at most 259 bytes.
		let n = u16::try_from(cur.position())
			.ok()
			.and_then(NonZeroU16::new)
			.ok_or_else(|| ReadError::InvalidAddress("invalid serialized length".into()))?;
		Ok((addr, n))
	}

	/// Number of bytes it takes to store the serialized address.
	#[inline]
	#[must_use]
	pub fn serialized_len_atyp(&self) -> usize {
		self.dest.serialized_len_atyp() + 2
	}

	/// Write the address into `buf` in the format
	/// described in [`Self::read_from`].
	#[inline]
	pub fn write_to<B: BufMut>(&self, buf: &mut B) {
		buf.put_u8(self.dest.atyp().into());
		self.dest.write_to_no_atyp(buf);
		buf.put_u16(self.port);
	}

	/// Parse a string like `host:port`, `[ipv6]:port`, or `host` when
	/// `default_port` is given.
	///
	/// # Errors
	///
	/// Returns [`ReadError`] if the string is invalid or has no port
	/// while `default_port` is [`None`].
	pub fn parse_str(s: &str, default_port: Option<u16>) -> Result<Self, ReadError> {
		if let Ok(addr) = s.parse::<SocketAddr>() {
			return Ok(addr.into());
		}
		if s.is_empty() {
			return Err(ReadError::InvalidAddress(EMPTY_STRING.into()));
		}
		match s.rsplit_once(':') {
			// Colons inside a bare IPv6 are not port separators.
			Some((host, port)) if !host.contains(':') || host.ends_with(']') => {
				if port.is_empty() {
					return Err(ReadError::InvalidAddress("missing port".into()));
				}
				Self::from_host_port(host, port)
			}
			_ => {
				let port =
					default_port.ok_or_else(|| ReadError::InvalidAddress("missing port".into()))?;
				Ok(Self::new(SocksDestination::from_str(s)?, port))
			}
		}
	}
}

impl FromStr for SocksAddr {
	type Err = ReadError;

	#[inline]
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse_str(s, None)
	}
}

impl Display for SocksAddr {
	#[inline]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.dest {
			SocksDestination::Name(name) => write!(f, "{}:{}", name, self.port),
			SocksDestination::Ip(ip) => SocketAddr::new(*ip, self.port).fmt(f),
		}
	}
}

impl From<SocketAddr> for SocksAddr {
	#[inline]
	fn from(addr: SocketAddr) -> Self {
		Self {
			dest: addr.ip().into(),
			port: addr.port(),
		}
	}
}

// -------------------------------------------------------
//                     DomainName
// -------------------------------------------------------

/// An ASCII domain that's guaranteed to be at most 255 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainName(SmolStr);

impl DomainName {
	#[inline]
	#[must_use]
	pub fn as_str(&self) -> &str {
		self.0.as_str()
	}

	#[inline]
	#[must_use]
	pub fn as_bytes(&self) -> &[u8] {
		self.0.as_bytes()
	}

	#[allow(clippy::cast_possible_truncation)]
	#[inline]
	#[must_use]
	pub fn len(&self) -> u8 {
		// Length is checked when created.
		self.0.len() as u8
	}

	#[inline]
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl FromStr for DomainName {
	type Err = ReadError;

	fn from_str(v: &str) -> Result<Self, ReadError> {
		if v.is_empty() {
			return Err(ReadError::InvalidDomain(EMPTY_STRING.into()));
		}
		// Remove the final dot '.' if possible.
		let v = v.strip_suffix('.').unwrap_or(v);
		let name =
			idna::domain_to_ascii_strict(v).map_err(|e| ReadError::InvalidDomain(e.into()))?;
		if name.len() > 255 {
			return Err(ReadError::InvalidDomain("too long".into()));
		}
		Ok(Self(SmolStr::new(&name)))
	}
}

impl Display for DomainName {
	#[inline]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		Display::fmt(&self.0, f)
	}
}
