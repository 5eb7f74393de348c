//! The wire codec (C1): DNS/mDNS message parsing and serialization, including name
//! compression and MTU-bounded fragmentation of outgoing queries.
//!
//! Fixed-width fields (the header, and the type/class/ttl/rdlength that trail a name)
//! are read and written through `utils::bytes::Cast`, cast directly onto the wire
//! bytes the same way a toy DNS resolver casts its own `Header`/`RR`. Names,
//! being variable-length and possibly compressed, are walked by hand.

mod header;
mod rr;

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use bilge::prelude::u3;
pub use header::{Flags, Header, Opcode, Rcode, HEADER_LEN};
pub use rr::{RRType, CLASS_FLAG_BIT, CLASS_IN};
use utils::bytes::{cast, Cast};

use crate::error::{ParseError, ParseErrorKind};
use crate::name::{upper, Name};

/// A parsed question (§4.1, RFC 1035 §4.1.2).
#[derive(Debug, Clone)]
pub struct Question {
	pub name: Name,
	pub rrtype: RRType,
	/// The QU bit: whether a unicast reply is requested (§6).
	pub unicast_response: bool,
}

/// One TXT-record string (§3): `key` or `key=value`, stored as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtEntry(pub Vec<u8>);

impl TxtEntry {
	pub fn key(&self) -> &[u8] {
		match self.0.iter().position(|&b| b == b'=') {
			Some(idx) => &self.0[..idx],
			None => &self.0,
		}
	}

	pub fn value(&self) -> Option<&[u8]> {
		self.0.iter().position(|&b| b == b'=').map(|idx| &self.0[idx + 1..])
	}
}

/// The decoded RDATA of a record (§3).
#[derive(Debug, Clone)]
pub enum RData {
	A(Ipv4Addr),
	Aaaa(Ipv6Addr),
	Ptr(Name),
	Srv { priority: u16, weight: u16, port: u16, target: Name },
	/// Ordered TXT entries; a single zero-length entry is equivalent to none (§3).
	Txt(Vec<TxtEntry>),
	Nsec { next: Name, types: Vec<RRType> },
	/// A record type this codec doesn't interpret; kept for known-answer bookkeeping.
	Other(Vec<u8>),
}

/// A fully decoded resource record (§3).
#[derive(Debug, Clone)]
pub struct Record {
	pub name: Name,
	pub rrtype: RRType,
	pub class: u16,
	/// The high bit of RRCLASS (§3, §6).
	pub cache_flush: bool,
	pub ttl: u32,
	pub data: RData,
}

/// The four record sections plus header metadata (§4.1).
#[derive(Debug, Clone, Default)]
pub struct Packet {
	pub id: u16,
	pub response: bool,
	pub truncated: bool,
	pub authoritative: bool,
	pub questions: Vec<Question>,
	pub answers: Vec<Record>,
	pub authorities: Vec<Record>,
	pub additionals: Vec<Record>,
}

impl Packet {
	pub fn new_query(id: u16) -> Packet {
		Packet { id, ..Default::default() }
	}

	pub fn new_response(id: u16) -> Packet {
		Packet { id, response: true, ..Default::default() }
	}
}

// ---------------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------------

struct Reader<'a> {
	buf: &'a [u8],
	pos: usize,
}

impl<'a> Reader<'a> {
	fn new(buf: &'a [u8]) -> Self {
		Reader { buf, pos: 0 }
	}

	fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
		let end = self.pos.checked_add(n).ok_or(ParseError(ParseErrorKind::Eof))?;
		let slice = self.buf.get(self.pos..end).ok_or(ParseError(ParseErrorKind::Eof))?;
		self.pos = end;
		Ok(slice)
	}

	fn cast_ref<T: Cast>(&mut self) -> Result<&'a T, ParseError> {
		let bytes = self.take(core::mem::size_of::<T>())?;
		Ok(cast(bytes))
	}

	/// Decode a (possibly compressed) name starting at the current position, per
	/// RFC 1035 §4.1.4. The pointer-following budget is bounded by the packet length,
	/// per §4.1's `label_pointer_loop` contract.
	fn name(&mut self) -> Result<Name, ParseError> {
		let mut labels = Vec::new();
		let mut pos = self.pos;
		let mut jumped = false;
		let mut hops = self.buf.len();
		let mut total_len = 0usize;

		loop {
			let len = *self.buf.get(pos).ok_or(ParseError(ParseErrorKind::Eof))?;

			match len & 0xC0 {
				0x00 if len == 0 => {
					pos += 1;
					if !jumped {
						self.pos = pos;
					}
					break;
				}
				0x00 => {
					let l = len as usize;
					let start = pos + 1;
					let end = start.checked_add(l).ok_or(ParseError(ParseErrorKind::Eof))?;
					let label = self.buf.get(start..end).ok_or(ParseError(ParseErrorKind::Eof))?;

					labels.push(Box::<[u8]>::from(label));

					total_len += l + 1;
					if total_len > 255 {
						return Err(ParseError(ParseErrorKind::BadLength));
					}

					pos = end;
					if !jumped {
						self.pos = pos;
					}
				}
				0xC0 => {
					let lo = *self.buf.get(pos + 1).ok_or(ParseError(ParseErrorKind::Eof))?;
					let target = (((len & 0x3F) as usize) << 8) | lo as usize;

					if !jumped {
						self.pos = pos + 2;
						jumped = true;
					}

					if hops == 0 || target >= pos {
						return Err(ParseError(ParseErrorKind::LabelPointerLoop));
					}

					hops -= 1;
					pos = target;
				}
				_ => return Err(ParseError(ParseErrorKind::MalformedName)),
			}
		}

		Ok(Name::from_labels(labels))
	}

	fn record(&mut self) -> Result<Record, ParseError> {
		let name = self.name()?;
		let tail: &rr::RecordTail = self.cast_ref()?;

		let rrtype = RRType::from(tail.rtype.get());
		let rclass = tail.rclass.get();
		let class = rclass & !CLASS_FLAG_BIT;
		let cache_flush = rclass & CLASS_FLAG_BIT != 0;
		let ttl = tail.ttl.get();
		let rdlength = tail.rdlength.get() as usize;

		let rdata = self.take(rdlength)?;
		let data = self.rdata(rrtype, rdata)?;

		Ok(Record { name, rrtype, class, cache_flush, ttl, data })
	}

	fn rdata(&self, rrtype: RRType, rdata: &'a [u8]) -> Result<RData, ParseError> {
		Ok(match rrtype {
			RRType::A => {
				if rdata.len() != 4 {
					return Err(ParseError(ParseErrorKind::BadLength));
				}
				RData::A(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]))
			}
			RRType::Aaaa => {
				let arr: [u8; 16] = rdata.try_into().map_err(|_| ParseError(ParseErrorKind::BadLength))?;
				RData::Aaaa(Ipv6Addr::from(arr))
			}
			RRType::Ptr => {
				let mut r = Reader { buf: self.buf, pos: self.pos - rdata.len() };
				RData::Ptr(r.name()?)
			}
			RRType::Srv => {
				if rdata.len() < 6 {
					return Err(ParseError(ParseErrorKind::BadLength));
				}
				let priority = u16::from_be_bytes([rdata[0], rdata[1]]);
				let weight = u16::from_be_bytes([rdata[2], rdata[3]]);
				let port = u16::from_be_bytes([rdata[4], rdata[5]]);

				let mut r = Reader { buf: self.buf, pos: self.pos - rdata.len() + 6 };
				let target = r.name()?;

				RData::Srv { priority, weight, port, target }
			}
			RRType::Txt => {
				let mut entries = Vec::new();
				let mut p = 0;

				while p < rdata.len() {
					let len = rdata[p] as usize;
					let start = p + 1;
					let end = start.checked_add(len).ok_or(ParseError(ParseErrorKind::BadLength))?;

					if end > rdata.len() {
						return Err(ParseError(ParseErrorKind::BadLength));
					}

					if len > 0 {
						entries.push(TxtEntry(rdata[start..end].to_vec()));
					}

					p = end;
				}

				RData::Txt(entries)
			}
			RRType::Nsec => {
				let mut r = Reader { buf: self.buf, pos: self.pos - rdata.len() };
				let next = r.name()?;

				let bitmap_start = r.pos - (self.pos - rdata.len());
				let bitmap = &rdata[bitmap_start..];

				let mut types = Vec::new();
				let mut p = 0;

				while p + 2 <= bitmap.len() {
					let window = bitmap[p];
					let block_len = bitmap[p + 1] as usize;
					let start = p + 2;
					let end = start.checked_add(block_len).ok_or(ParseError(ParseErrorKind::BadLength))?;

					if end > bitmap.len() {
						return Err(ParseError(ParseErrorKind::BadLength));
					}

					for (byte_idx, &byte) in bitmap[start..end].iter().enumerate() {
						for bit in 0..8 {
							if byte & (0x80 >> bit) != 0 {
								let code = window as u16 * 256 + (byte_idx as u16 * 8 + bit as u16);
								types.push(RRType::from(code));
							}
						}
					}

					p = end;
				}

				RData::Nsec { next, types }
			}
			RRType::Other(_) => RData::Other(rdata.to_vec()),
		})
	}
}

/// Decode any structurally valid DNS message (query or response). Used directly by
/// the codec round-trip test; response-specific validation lives in [`parse_packet`].
pub fn decode(bytes: &[u8]) -> Result<Packet, ParseError> {
	let mut r = Reader::new(bytes);

	let header: &Header = r.cast_ref()?;
	let flags = header.flags.get();

	let qdcount = header.qdcount.get() as usize;
	let ancount = header.ancount.get() as usize;
	let nscount = header.nscount.get() as usize;
	let arcount = header.arcount.get() as usize;

	let mut questions = Vec::with_capacity(qdcount);

	for _ in 0..qdcount {
		let name = r.name()?;
		let tail: &rr::QuestionTail = r.cast_ref()?;
		let qclass = tail.qclass.get();

		questions.push(Question {
			name,
			rrtype: RRType::from(tail.qtype.get()),
			unicast_response: qclass & CLASS_FLAG_BIT != 0,
		});
	}

	let mut answers = Vec::with_capacity(ancount);
	for _ in 0..ancount {
		answers.push(r.record()?);
	}

	let mut authorities = Vec::with_capacity(nscount);
	for _ in 0..nscount {
		authorities.push(r.record()?);
	}

	let mut additionals = Vec::with_capacity(arcount);
	for _ in 0..arcount {
		additionals.push(r.record()?);
	}

	Ok(Packet {
		id: header.id,
		response: flags.qr(),
		truncated: flags.tc(),
		authoritative: flags.aa(),
		questions,
		answers,
		authorities,
		additionals,
	})
}

/// Decode an inbound datagram as an mDNS response (§4.1's public `parse_packet`
/// contract): rejects non-responses and responses carrying no records at all.
pub fn parse_packet(bytes: &[u8]) -> Result<Packet, ParseError> {
	let packet = decode(bytes)?;

	if !packet.response {
		return Err(ParseError(ParseErrorKind::NotAResponse));
	}

	if packet.answers.is_empty() && packet.authorities.is_empty() && packet.additionals.is_empty() {
		return Err(ParseError(ParseErrorKind::NoAnswers));
	}

	Ok(packet)
}

// ---------------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------------

/// Tracks previously written names so later names can compress against them, per
/// RFC 1035 §4.1.4. Keyed by the DNS-case-insensitive canonical form of the suffix.
#[derive(Default)]
struct NameWriter {
	offsets: HashMap<String, u16>,
}

fn suffix_key(labels: &[Box<[u8]>], start: usize) -> String {
	labels[start..]
		.iter()
		.map(|l| l.iter().map(|&b| upper(b) as char).collect::<String>())
		.collect::<Vec<_>>()
		.join(".")
}

impl NameWriter {
	fn write(&mut self, buf: &mut Vec<u8>, name: &Name) {
		let labels = name.labels();
		let n = labels.len();

		let mut matched = None;

		for start in 0..n {
			if let Some(&offset) = self.offsets.get(&suffix_key(labels, start)) {
				matched = Some((start, offset));
				break;
			}
		}

		let limit = matched.map_or(n, |(start, _)| start);

		for i in 0..limit {
			let offset = buf.len();

			if offset < 0x4000 {
				self.offsets.entry(suffix_key(labels, i)).or_insert(offset as u16);
			}

			let label = &labels[i];
			buf.push(label.len() as u8);
			buf.extend_from_slice(label);
		}

		match matched {
			Some((_, offset)) => {
				buf.push(0xC0 | (offset >> 8) as u8);
				buf.push((offset & 0xFF) as u8);
			}
			None => buf.push(0),
		}
	}
}

fn push_cast<T: Cast>(buf: &mut Vec<u8>, value: &T) {
	let bytes = utils::bytes::as_slice::<u8, T>(value);
	buf.extend_from_slice(bytes);
}

fn write_header(buf: &mut Vec<u8>, packet: &Packet) {
	let flags = Flags::new(
		Rcode::Ok,
		u3::new(0),
		false,
		false,
		packet.truncated,
		packet.authoritative,
		Opcode::Query,
		packet.response,
	);

	let header = Header {
		id: packet.id,
		flags: flags.into(),
		qdcount: (packet.questions.len() as u16).into(),
		ancount: (packet.answers.len() as u16).into(),
		nscount: (packet.authorities.len() as u16).into(),
		arcount: (packet.additionals.len() as u16).into(),
	};

	push_cast(buf, &header);
}

fn write_question(buf: &mut Vec<u8>, names: &mut NameWriter, q: &Question) {
	names.write(buf, &q.name);

	let qclass = CLASS_IN | if q.unicast_response { CLASS_FLAG_BIT } else { 0 };

	let tail = rr::QuestionTail { qtype: q.rrtype.code().into(), qclass: qclass.into() };
	push_cast(buf, &tail);
}

fn write_rdata(buf: &mut Vec<u8>, names: &mut NameWriter, data: &RData) {
	match data {
		RData::A(addr) => buf.extend_from_slice(&addr.octets()),
		RData::Aaaa(addr) => buf.extend_from_slice(&addr.octets()),
		RData::Ptr(name) => names.write(buf, name),
		RData::Srv { priority, weight, port, target } => {
			buf.extend_from_slice(&priority.to_be_bytes());
			buf.extend_from_slice(&weight.to_be_bytes());
			buf.extend_from_slice(&port.to_be_bytes());
			names.write(buf, target);
		}
		RData::Txt(entries) => {
			if entries.is_empty() {
				buf.push(0);
			} else {
				for entry in entries {
					buf.push(entry.0.len() as u8);
					buf.extend_from_slice(&entry.0);
				}
			}
		}
		RData::Nsec { next, types } => {
			names.write(buf, next);

			let max_code = types.iter().map(|t| t.code()).max().unwrap_or(0);
			let window = (max_code / 256) as u8;
			let in_window: Vec<u16> = types.iter().map(|t| t.code()).filter(|&c| c / 256 == window as u16).collect();
			let block_len = in_window.iter().map(|&c| c % 256).max().map_or(0, |m| m / 8 + 1) as usize;

			let mut block = vec![0u8; block_len];
			for code in in_window {
				let bit = (code % 256) as usize;
				block[bit / 8] |= 0x80 >> (bit % 8);
			}

			buf.push(window);
			buf.push(block_len as u8);
			buf.extend_from_slice(&block);
		}
		RData::Other(raw) => buf.extend_from_slice(raw),
	}
}

fn write_record(buf: &mut Vec<u8>, names: &mut NameWriter, r: &Record) {
	names.write(buf, &r.name);

	let rclass = r.class | if r.cache_flush { CLASS_FLAG_BIT } else { 0 };

	let mut rdata = Vec::new();
	write_rdata(&mut rdata, names, &r.data);

	let tail = rr::RecordTail {
		rtype: r.rrtype.code().into(),
		rclass: rclass.into(),
		ttl: r.ttl.into(),
		rdlength: (rdata.len() as u16).into(),
	};

	push_cast(buf, &tail);
	buf.extend_from_slice(&rdata);
}

/// Serialize `packet` into `buf`, returning the number of bytes written (§4.1).
pub fn write_packet(packet: &Packet, buf: &mut Vec<u8>) -> usize {
	let start = buf.len();

	write_header(buf, packet);

	let mut names = NameWriter::default();

	for q in &packet.questions {
		write_question(buf, &mut names, q);
	}

	for r in &packet.answers {
		write_record(buf, &mut names, r);
	}

	for r in &packet.authorities {
		write_record(buf, &mut names, r);
	}

	for r in &packet.additionals {
		write_record(buf, &mut names, r);
	}

	buf.len() - start
}

fn encoded_len(packet: &Packet) -> usize {
	let mut scratch = Vec::new();
	write_packet(packet, &mut scratch)
}

/// Split `packet` across one or more datagrams, each no larger than `mtu`, setting the
/// TC bit on every datagram but the last (§4.1, §6, §8's fragmentation property).
///
/// Splits only at question/answer boundaries — a single record is never split across
/// datagrams; if one doesn't fit alone, this fails with `packet_too_large`.
pub fn write_query_packets(packet: &Packet, mtu: usize) -> Result<Vec<Vec<u8>>, ParseError> {
	if encoded_len(packet) <= mtu {
		let mut buf = Vec::new();
		write_packet(packet, &mut buf);
		return Ok(vec![buf]);
	}

	let mut datagrams = Vec::new();
	let mut current = Packet::new_query(packet.id);
	current.response = packet.response;

	let mut questions = packet.questions.iter();
	let mut answers = packet.answers.iter();

	// Drive two interleaved cursors so a datagram always carries at least one record
	// if either section still has items left.
	loop {
		let mut advanced = false;

		if let Some(q) = questions.clone().next() {
			let mut candidate = current.clone();
			candidate.questions.push(q.clone());

			if encoded_len(&candidate) <= mtu {
				current = candidate;
				questions.next();
				advanced = true;
			} else if current.questions.is_empty() && current.answers.is_empty() {
				return Err(ParseError(ParseErrorKind::PacketTooLarge));
			}
		}

		if let Some(a) = answers.clone().next() {
			let mut candidate = current.clone();
			candidate.answers.push(a.clone());

			if encoded_len(&candidate) <= mtu {
				current = candidate;
				answers.next();
				advanced = true;
			} else if current.questions.is_empty() && current.answers.is_empty() {
				return Err(ParseError(ParseErrorKind::PacketTooLarge));
			}
		}

		if !advanced {
			if current.questions.is_empty() && current.answers.is_empty() {
				break;
			}

			current.truncated = true;
			let mut buf = Vec::new();
			write_packet(&current, &mut buf);
			datagrams.push(buf);

			current = Packet::new_query(packet.id);
			current.response = packet.response;

			if questions.clone().next().is_none() && answers.clone().next().is_none() {
				break;
			}
		}
	}

	if !current.questions.is_empty() || !current.answers.is_empty() {
		current.truncated = false;
		let mut buf = Vec::new();
		write_packet(&current, &mut buf);
		datagrams.push(buf);
	}

	if let Some(last) = datagrams.last_mut() {
		// The final datagram must not have TC set; re-encode without it if needed.
		if let Ok(mut p) = decode(last) {
			if p.truncated {
				p.truncated = false;
				let mut buf = Vec::new();
				write_packet(&p, &mut buf);
				*last = buf;
			}
		}
	}

	Ok(datagrams)
}

#[cfg(test)]
mod tests {
	use std::net::Ipv4Addr;

	use super::*;

	fn sample_packet() -> Packet {
		let mut p = Packet::new_response(0x1234);

		p.answers.push(Record {
			name: Name::from_ascii("_testtype._tcp.local"),
			rrtype: RRType::Ptr,
			class: CLASS_IN,
			cache_flush: false,
			ttl: 120,
			data: RData::Ptr(Name::from_ascii("inst._testtype._tcp.local")),
		});

		p.answers.push(Record {
			name: Name::from_ascii("inst._testtype._tcp.local"),
			rrtype: RRType::Srv,
			class: CLASS_IN,
			cache_flush: true,
			ttl: 120,
			data: RData::Srv {
				priority: 0,
				weight: 0,
				port: 8009,
				target: Name::from_ascii("h.local"),
			},
		});

		p.answers.push(Record {
			name: Name::from_ascii("inst._testtype._tcp.local"),
			rrtype: RRType::Txt,
			class: CLASS_IN,
			cache_flush: true,
			ttl: 120,
			data: RData::Txt(vec![TxtEntry(b"id=1".to_vec())]),
		});

		p.answers.push(Record {
			name: Name::from_ascii("h.local"),
			rrtype: RRType::A,
			class: CLASS_IN,
			cache_flush: true,
			ttl: 120,
			data: RData::A(Ipv4Addr::new(10, 0, 0, 5)),
		});

		p
	}

	#[test]
	fn round_trip_structurally_equal() {
		let p = sample_packet();

		let mut buf = Vec::new();
		write_packet(&p, &mut buf);

		let decoded = decode(&buf).unwrap();

		assert_eq!(decoded.id, p.id);
		assert_eq!(decoded.response, p.response);
		assert_eq!(decoded.answers.len(), p.answers.len());

		for (a, b) in decoded.answers.iter().zip(&p.answers) {
			assert_eq!(a.name, b.name);
			assert_eq!(a.rrtype, b.rrtype);
			assert_eq!(a.ttl, b.ttl);
			assert_eq!(a.cache_flush, b.cache_flush);
		}
	}

	#[test]
	fn compression_shrinks_repeated_suffix() {
		let mut p = Packet::new_query(1);

		p.questions.push(Question {
			name: Name::from_ascii("a._testtype._tcp.local"),
			rrtype: RRType::Ptr,
			unicast_response: false,
		});

		p.questions.push(Question {
			name: Name::from_ascii("b._testtype._tcp.local"),
			rrtype: RRType::Ptr,
			unicast_response: false,
		});

		let mut compressed = Vec::new();
		write_packet(&p, &mut compressed);

		// The second question's "._testtype._tcp.local" suffix must have compressed to
		// a 2-byte pointer rather than being spelled out again.
		let uncompressed_second = 1 + 1 + "_testtype._tcp.local".len() + "._tcp".len();
		assert!(compressed.len() < HEADER_LEN + (1 + 1 + "a".len()) * 2 + uncompressed_second * 2);

		let decoded = decode(&compressed).unwrap();
		assert_eq!(decoded.questions[1].name, p.questions[1].name);
	}

	#[test]
	fn pointer_loop_is_rejected() {
		let mut buf = vec![0u8; HEADER_LEN];
		buf[4..6].copy_from_slice(&1u16.to_be_bytes()); // qdcount = 1

		// A name whose only label is a pointer to itself.
		let name_off = buf.len() as u16;
		buf.push(0xC0 | (name_off >> 8) as u8);
		buf.push((name_off & 0xFF) as u8);
		buf.extend_from_slice(&[0, 1, 0, 1]); // qtype/qclass

		let err = decode(&buf).unwrap_err();
		assert_eq!(err.kind(), ParseErrorKind::LabelPointerLoop);
	}

	#[test]
	fn parse_packet_rejects_queries() {
		let p = Packet::new_query(7);
		let mut buf = Vec::new();
		write_packet(&p, &mut buf);

		let err = parse_packet(&buf).unwrap_err();
		assert_eq!(err.kind(), ParseErrorKind::NotAResponse);
	}

	#[test]
	fn fragmentation_splits_at_record_boundaries() {
		let mut p = Packet::new_query(9);

		for i in 0..60u8 {
			p.questions.push(Question {
				name: Name::from_labels(vec![
					format!("q{i:02}-0123456789012345678901").into_bytes().into_boxed_slice(),
					b"_testtype"[..].into(),
					b"_tcp"[..].into(),
					b"local"[..].into(),
				]),
				rrtype: RRType::Ptr,
				unicast_response: false,
			});
		}

		let datagrams = write_query_packets(&p, 500).unwrap();
		assert!(datagrams.len() >= 2);

		for (i, d) in datagrams.iter().enumerate() {
			assert!(d.len() <= 500);

			let decoded = decode(d).unwrap();

			if i + 1 < datagrams.len() {
				assert!(decoded.truncated);
			} else {
				assert!(!decoded.truncated);
			}
		}

		let total: usize = datagrams.iter().map(|d| decode(d).unwrap().questions.len()).sum();
		assert_eq!(total, 60);
	}
}
