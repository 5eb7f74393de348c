//! DNS names and RFC 6762 §7.1 subtype encoding (§3).
//!
//! Comparison is DNS-case-insensitive over ASCII A-Z/a-z only; bytes with the high bit
//! set retain their case, matching §3's "Name" paragraph and the §8 case-insensitivity
//! property.

use std::fmt;
use std::hash::{Hash, Hasher};

const SUB_LABEL: &[u8] = b"_sub";

/// An ordered sequence of DNS labels, stored as raw bytes (labels are not guaranteed to
/// be valid UTF-8, though in practice service-discovery names always are).
#[derive(Debug, Clone, Default)]
pub struct Name(Vec<Box<[u8]>>);

#[inline]
pub(crate) fn upper(b: u8) -> u8 {
	if b.is_ascii_lowercase() {
		b - (b'a' - b'A')
	} else {
		b
	}
}

fn label_eq(a: &[u8], b: &[u8]) -> bool {
	a.len() == b.len() && a.iter().zip(b).all(|(&x, &y)| upper(x) == upper(y))
}

impl Name {
	pub fn root() -> Name {
		Name(Vec::new())
	}

	pub fn from_labels(labels: Vec<Box<[u8]>>) -> Name {
		Name(labels)
	}

	/// Parse a dotted ASCII name such as `_testtype._tcp.local`. Does not unescape
	/// backslash sequences; service-type and instance names in this engine never carry
	/// them in practice.
	pub fn from_ascii(text: &str) -> Name {
		Name(text.split('.').filter(|s| !s.is_empty()).map(|s| s.as_bytes().into()).collect())
	}

	pub fn labels(&self) -> &[Box<[u8]>] {
		&self.0
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// The wire length of this name if written uncompressed: each label is a length
	/// octet plus its bytes, terminated by a zero-length root label.
	pub fn wire_len(&self) -> usize {
		self.0.iter().map(|l| 1 + l.len()).sum::<usize>() + 1
	}

	pub fn eq_dns(&self, other: &Name) -> bool {
		self.0.len() == other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| label_eq(a, b))
	}

	/// Whether `self` is `suffix`, or ends with it — used for the PTR-owner-matches-
	/// tracked-type-or-subtype rule in §4.2's augmentation algorithm.
	pub fn ends_with(&self, suffix: &Name) -> bool {
		if suffix.0.len() > self.0.len() {
			return false;
		}

		let off = self.0.len() - suffix.0.len();

		self.0[off..].iter().zip(&suffix.0).all(|(a, b)| label_eq(a, b))
	}

	/// If this name is of the form `<sub>._sub.<base>`, split it into the subtype label
	/// and the base service type (RFC 6763 §7.1).
	pub fn strip_subtype(&self) -> Option<(Box<[u8]>, Name)> {
		if self.0.len() >= 2 && label_eq(&self.0[1], SUB_LABEL) {
			Some((self.0[0].clone(), Name(self.0[2..].to_vec())))
		} else {
			None
		}
	}

	/// Build `<sub>._sub.<base>` for the wire (RFC 6763 §7.1).
	pub fn with_subtype(base: &Name, sub: &[u8]) -> Name {
		let mut labels = Vec::with_capacity(base.0.len() + 2);
		labels.push(sub.into());
		labels.push(SUB_LABEL.into());
		labels.extend(base.0.iter().cloned());
		Name(labels)
	}

	/// A canonical ASCII-uppercased dotted string, suitable as a cache/map key — the
	/// `upper(service-type)` half of the §4.3 `CacheKey`.
	pub fn upper_key(&self) -> String {
		self.0
			.iter()
			.map(|l| l.iter().map(|&b| upper(b) as char).collect::<String>())
			.collect::<Vec<_>>()
			.join(".")
	}
}

impl PartialEq for Name {
	fn eq(&self, other: &Self) -> bool {
		self.eq_dns(other)
	}
}

impl Eq for Name {}

impl Hash for Name {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.upper_key().hash(state);
	}
}

impl fmt::Display for Name {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.0.is_empty() {
			return f.write_str(".");
		}

		for (i, label) in self.0.iter().enumerate() {
			if i > 0 {
				f.write_str(".")?;
			}

			f.write_str(&String::from_utf8_lossy(label))?;
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn case_insensitive_equality() {
		let a = Name::from_ascii("_HTTP._tcp.LOCAL");
		let b = Name::from_ascii("_http._TCP.local");
		assert_eq!(a, b);
	}

	#[test]
	fn high_bit_bytes_preserve_case() {
		let a = Name::from_labels(vec![vec![0xE9].into_boxed_slice()]);
		let b = Name::from_labels(vec![vec![0xE9].into_boxed_slice()]);
		assert_eq!(a, b);

		let c = Name::from_labels(vec![vec![0x69].into_boxed_slice()]);
		assert_ne!(a, c);
	}

	#[test]
	fn subtype_suffix_matches_base_type() {
		let base = Name::from_ascii("_printer._tcp.local");
		let color = Name::with_subtype(&base, b"_color");

		assert!(color.ends_with(&base));

		let (sub, stripped) = color.strip_subtype().unwrap();
		assert_eq!(&*sub, b"_color");
		assert_eq!(stripped, base);
	}

	#[test]
	fn ends_with_rejects_non_suffix() {
		let a = Name::from_ascii("_laser._sub._printer._tcp.local");
		let base = Name::from_ascii("_printer._tcp.local");
		assert!(a.ends_with(&base));
		assert!(!a.eq_dns(&base));
	}
}
