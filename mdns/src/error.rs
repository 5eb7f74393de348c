//! Error taxonomy (§7). Recoverable decode failures get a real enum so
//! callers can forward the diagnostic code to listeners; everything else
//! follows the `utils::error::Result<T, E = ()>` idiom, where the reason has
//! already been logged at the point of failure.

use std::fmt;

pub use utils::error::Result;

/// The seven recoverable wire-decode failure kinds (§4.1, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseErrorKind {
	/// The packet did not have the DNS response flag set.
	NotAResponse,
	/// The packet had no records in any section.
	NoAnswers,
	/// The buffer ended before a length-prefixed field could be read in full.
	Eof,
	/// A name's label length byte was neither a length nor a compression pointer tag.
	MalformedName,
	/// Following compression pointers would not terminate within the packet.
	LabelPointerLoop,
	/// A declared length (RDLENGTH, a label length, a section count) didn't fit the buffer.
	BadLength,
	/// A single record (or the packet as a whole) cannot fit within the requested MTU.
	PacketTooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParseError(pub ParseErrorKind);

impl ParseError {
	pub fn kind(&self) -> ParseErrorKind {
		self.0
	}
}

impl fmt::Display for ParseError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		use ParseErrorKind::*;

		f.write_str(match self.0 {
			NotAResponse => "packet is not a response",
			NoAnswers => "packet carries no records",
			Eof => "buffer ended before a field could be read",
			MalformedName => "malformed name encoding",
			LabelPointerLoop => "name compression pointer chain did not terminate",
			BadLength => "declared length does not fit the buffer",
			PacketTooLarge => "record does not fit within the requested MTU",
		})
	}
}

impl std::error::Error for ParseError {}

/// Failures that can only happen at `start_discovery` time or due to a programmer mistake
/// (§7): both are surfaced to the caller rather than just logged and swallowed.
#[derive(Debug)]
pub enum StartError {
	/// A fatal error binding or joining multicast groups on the underlying transport.
	Io(std::io::Error),
	/// The caller asked for behavior the transport cannot provide, e.g. a specific
	/// network on a transport with no per-network routing.
	InvalidArgument(&'static str),
}

impl fmt::Display for StartError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StartError::Io(err) => write!(f, "I/O error starting discovery: {err}"),
			StartError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
		}
	}
}

impl std::error::Error for StartError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			StartError::Io(err) => Some(err),
			StartError::InvalidArgument(_) => None,
		}
	}
}

impl From<std::io::Error> for StartError {
	fn from(err: std::io::Error) -> Self {
		StartError::Io(err)
	}
}
