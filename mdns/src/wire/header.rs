//! The 12-byte DNS message header (RFC 1035 §4.1.1), cast directly onto the wire bytes
//! the same way a toy DNS resolver's own `Header`/`RR` structs get cast onto wire bytes.

use bilge::prelude::*;
use utils::bytes::Cast;
use utils::endian::{b, u16be};

#[bitsize(4)]
#[derive(FromBits, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
	/// A standard query.
	Query = 0,
	/// An inverse query.
	IQuery = 1,
	/// A server status request.
	Status = 2,
	#[fallback]
	Reserved,
}

#[bitsize(4)]
#[derive(FromBits, Clone, Copy, PartialEq, Eq)]
pub enum Rcode {
	Ok = 0,
	FormatErr = 1,
	ServerFailure = 2,
	NameErr = 3,
	NotImplemented = 4,
	Refused = 5,
	#[fallback]
	Reserved,
}

/// The flag bits of the DNS header, in their wire bit order (RFC 1035 §4.1.1).
#[bitsize(16)]
#[derive(FromBits, Clone, Copy)]
pub struct Flags {
	/// Response code; meaningful only in responses.
	pub rcode: Rcode,
	/// Reserved; must be zero.
	pub z: u3,
	/// Recursion available (unused by mDNS, carried for wire compliance).
	pub ra: bool,
	/// Recursion desired (unused by mDNS, carried for wire compliance).
	pub rd: bool,
	/// TC: this message was truncated (§6, fragmentation).
	pub tc: bool,
	/// AA: authoritative answer.
	pub aa: bool,
	pub opcode: Opcode,
	/// QR: 0 for a query, 1 for a response.
	pub qr: bool,
}

#[derive(Cast)]
#[repr(C)]
pub struct Header {
	pub id: u16,
	pub flags: b<Flags>,
	pub qdcount: u16be,
	pub ancount: u16be,
	pub nscount: u16be,
	pub arcount: u16be,
}

pub const HEADER_LEN: usize = core::mem::size_of::<Header>();
