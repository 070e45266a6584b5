//! CMUX framer/deframer: `3GPP TS 27.010` single-byte-length framing.
//!
//! A frame is kept as a single owned byte vector (`SOF, address, control,
//! length, payload.., fcs, SOF`) rather than parsed into a struct-of-fields;
//! [`Frame`] only provides accessors over that layout, preserving a
//! "single byte array" data model and avoiding an allocation-per-field
//! intermediate representation.

use crate::crc;
use crate::error::{Error, Result};

/// Start-of-frame marker.
pub const SOF: u8 = 0xF9;
/// Extended-address bit in the address field; only the single-byte length
/// encoding (EA=1) is supported.
const EA: u8 = 0x01;
/// Command/response bit in the address field.
const CR: u8 = 0x02;
/// Poll/Final bit in the control field.
pub const PF: u8 = 0x10;

/// CMUX frame type codes (control field, without PF).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
	/// Set Asynchronous Balanced Mode (channel establishment request).
	Sabm,
	/// Unnumbered Acknowledgement (establishment/teardown ack).
	Ua,
	/// Disconnected Mode (establishment refusal / not-connected response).
	Dm,
	/// Disconnect (channel teardown request).
	Disc,
	/// Unnumbered Information with header check (data-carrying frame).
	Uih,
}

impl FrameType {
	const fn code(self) -> u8 {
		match self {
			FrameType::Sabm => 0x2F,
			FrameType::Ua => 0x63,
			FrameType::Dm => 0x0F,
			FrameType::Disc => 0x43,
			FrameType::Uih => 0xEF,
		}
	}

	/// Maps a raw control byte (PF bit already masked off) back to a type,
	/// if it is one of the five this core understands.
	pub fn from_code(code: u8) -> Option<Self> {
		match code {
			0x2F => Some(FrameType::Sabm),
			0x63 => Some(FrameType::Ua),
			0x0F => Some(FrameType::Dm),
			0x43 => Some(FrameType::Disc),
			0xEF => Some(FrameType::Uih),
			_ => None,
		}
	}
}

/// DLCI 0: the CMUX control channel (establish/teardown).
pub const DLCI_CONTROL: u8 = 0;
/// DLCI 1: the data channel (PPP bytes once in PPP mode; also the initial
/// `CONNECT` text).
pub const DLCI_DATA: u8 = 1;
/// DLCI 2: the AT-command channel.
pub const DLCI_AT: u8 = 2;

/// Maximum payload length the single-byte length encoding can express.
pub const MAX_PAYLOAD_LEN: usize = 127;

/// A complete, encoded CMUX frame, owned as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Vec<u8>);

impl Frame {
	/// Wraps an already-framed byte sequence without validating it. Used
	/// internally by the deframer, which has already checked the positional
	/// SOF...SOF structure before constructing a `Frame`.
	fn from_raw(bytes: Vec<u8>) -> Self {
		Self(bytes)
	}

	/// The full encoded byte sequence, `SOF ..= SOF`.
	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	/// The logical channel this frame belongs to.
	pub fn dlci(&self) -> u8 {
		self.0[1] >> 2
	}

	/// The raw control byte, PF bit included.
	pub fn control(&self) -> u8 {
		self.0[2]
	}

	/// The control byte with the PF bit masked off.
	pub fn frame_type_code(&self) -> u8 {
		self.0[2] & !PF
	}

	/// Whether the poll/final bit is set.
	pub fn pf(&self) -> bool {
		self.0[2] & PF != 0
	}

	/// The decoded frame type, if the control byte (PF masked off) is one
	/// this core recognizes.
	pub fn frame_type(&self) -> Option<FrameType> {
		FrameType::from_code(self.frame_type_code())
	}

	/// The payload bytes (offsets `4..4+L`).
	pub fn payload(&self) -> &[u8] {
		let len = self.payload_len();
		&self.0[4..4 + len]
	}

	fn payload_len(&self) -> usize {
		(self.0[3] >> 1) as usize
	}

	/// The FCS byte as received/encoded.
	pub fn fcs_byte(&self) -> u8 {
		let len = self.payload_len();
		self.0[4 + len]
	}

	/// Optional hardening check: verifies the FCS against the header this
	/// frame carries. Not called anywhere on the normal decode/dispatch
	/// path (the deframer's framing check is purely positional).
	pub fn fcs_valid(&self) -> bool {
		crc::fcs_valid(&self.0[1..4], self.fcs_byte())
	}
}

/// Builds the address byte for `dlci` (EA and CR both set; only single-byte
/// addressing is supported).
fn address_byte(dlci: u8) -> u8 {
	(dlci << 2) | CR | EA
}

/// Encodes a frame for `dlci` with the given raw control byte (type,
/// optionally OR'd with [`PF`]) and payload.
///
/// This is the single encoding path in the crate: [`build_sabm`] and
/// [`build_uih`] are both thin callers of this function. A zero-length
/// payload already produces the exact 6-byte SABM layout named in the
/// design notes (`F9 addr 0x2F 0x01 <FCS> F9`); there is no special
/// case needed for it.
pub fn encode(dlci: u8, control: u8, payload: &[u8]) -> Result<Vec<u8>> {
	if payload.len() > MAX_PAYLOAD_LEN {
		return Err(Error::PayloadTooLarge(payload.len()));
	}
	let address = address_byte(dlci);
	let length = ((payload.len() as u8) << 1) | EA;
	let header = [address, control, length];
	let check = crc::fcs(&header);

	let mut out = Vec::with_capacity(6 + payload.len());
	out.push(SOF);
	out.extend_from_slice(&header);
	out.extend_from_slice(payload);
	out.push(check);
	out.push(SOF);
	Ok(out)
}

/// Builds a SABM frame requesting establishment of `dlci`, PF set, empty
/// payload.
pub fn build_sabm(dlci: u8) -> Vec<u8> {
	encode(dlci, FrameType::Sabm.code() | PF, &[])
		.expect("empty payload never exceeds MAX_PAYLOAD_LEN")
}

/// Builds a UIH frame carrying `payload` on `dlci`.
pub fn build_uih(dlci: u8, payload: &[u8]) -> Result<Vec<u8>> {
	encode(dlci, FrameType::Uih.code(), payload)
}

/// Strips the modem's CRLF prefix (`offset` bytes, normally 2) from a
/// DLCI 1/2 payload before it is treated as response text.
pub fn strip_line_prefix(payload: &[u8], offset: usize) -> &[u8] {
	&payload[offset.min(payload.len())..]
}

/// Builds the CMUX close-down sequence emitted at DTE init: an escape
/// prefix followed by a UIH frame on DLCI 0 carrying the multiplexer
/// control "Cld" (close-down) command, `[0xC3, 0x01]`.
pub fn teardown_sequence() -> Vec<u8> {
	let mut out = b"+++".to_vec();
	out.extend(encode(DLCI_CONTROL, FrameType::Uih.code(), &[0xC3, 0x01]).expect("a 2-byte payload never exceeds MAX_PAYLOAD_LEN"));
	out
}

/// Streaming CMUX deframer: owns the reassembly buffer and extracts
/// complete frames as bytes arrive, in arbitrary chunk sizes (P3).
///
/// Invariant I2: while the buffer is non-empty, its first byte is `SOF` or
/// it is mid-resync. [`Deframer::feed`] restores this invariant itself;
/// callers never need to inspect the buffer directly.
pub struct Deframer {
	buf: Vec<u8>,
}

impl Deframer {
	pub fn new() -> Self {
		Self { buf: Vec::new() }
	}

	/// The number of bytes currently buffered (exposed for diagnostics and
	/// tests; not part of the decode contract).
	pub fn buffered_len(&self) -> usize {
		self.buf.len()
	}

	/// Appends `bytes` to the reassembly buffer and extracts every complete
	/// frame now available, in arrival order.
	///
	/// Resync: if the buffer does not start with [`SOF`], this searches
	/// forward for the next `SOF` byte and discards everything before it.
	/// This is the mechanism behind P4 ("any prefix of garbage not beginning with
	/// `SOF` is silently discarded once new bytes arrive that restart at an
	/// `SOF`"). A bad trailing SOF (length implies a frame end that isn't
	/// actually `SOF`) is logged and left in the buffer untouched; it is
	/// only cleared once further bytes cause a resync or a correct frame to
	/// be found at that position.
	pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
		self.buf.extend_from_slice(bytes);
		let mut frames = Vec::new();

		loop {
			if self.buf.first() != Some(&SOF) {
				match self.buf.iter().skip(1).position(|&b| b == SOF) {
					Some(offset) => {
						let drop_n = offset + 1;
						tracing::warn!(dropped = drop_n, "cmux: resyncing, discarding garbage prefix");
						self.buf.drain(..drop_n);
					}
					None => {
						// No SOF anywhere in the buffer; nothing extractable
						// yet, wait for more bytes.
						return frames;
					}
				}
			}

			if self.buf.len() < 5 {
				return frames; // not enough to read the length field yet
			}

			let payload_len = (self.buf[3] >> 1) as usize;
			let frame_total = payload_len + 6;

			if self.buf.len() < frame_total {
				return frames; // truncated, wait for more bytes
			}

			if self.buf[frame_total - 1] != SOF {
				tracing::warn!("cmux: bad trailing SOF, framing error, holding buffer for resync");
				return frames;
			}

			let frame_bytes: Vec<u8> = self.buf.drain(..frame_total).collect();
			frames.push(Frame::from_raw(frame_bytes));

			if self.buf.len() < 5 {
				return frames;
			}
			// otherwise loop: another frame may already be in the buffer
		}
	}
}

impl Default for Deframer {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sabm_encode_matches_known_byte_sequence() {
		let f = build_sabm(0);
		let header = [0x03u8, 0x2F, 0x01];
		let fcs = crc::fcs(&header);
		assert_eq!(f, vec![0xF9, 0x03, 0x2F, 0x01, fcs, 0xF9]);
	}

	#[test]
	fn at_command_framing_matches_known_byte_sequence() {
		let f = build_uih(DLCI_AT, b"AT\r").unwrap();
		let header = [0x09u8, 0xEF, 0x07];
		let fcs = crc::fcs(&header);
		assert_eq!(f, [&[0xF9u8, 0x09, 0xEF, 0x07][..], b"AT\r", &[fcs, 0xF9]].concat());
	}

	#[test]
	fn payload_over_127_bytes_is_rejected() {
		let payload = vec![0u8; 128];
		assert!(matches!(build_uih(DLCI_DATA, &payload), Err(Error::PayloadTooLarge(128))));
	}

	#[test]
	fn two_concatenated_frames_decode_to_two_frames() {
		let mut d = Deframer::new();
		let f1 = build_uih(DLCI_AT, b"AT\r").unwrap();
		let f2 = build_uih(DLCI_AT, b"AT+CFUN?\r").unwrap();
		let mut combined = f1.clone();
        combined.extend_from_slice(&f2);
		let out = d.feed(&combined);
		assert_eq!(out.len(), 2);
		assert_eq!(out[0].payload(), b"AT\r");
		assert_eq!(out[1].payload(), b"AT+CFUN?\r");
		assert_eq!(d.buffered_len(), 0);
	}

	#[test]
	fn truncated_frame_waits_then_dispatches_once_complete() {
		let mut d = Deframer::new();
		let full = build_uih(DLCI_AT, b"AT\r").unwrap();
		let out = d.feed(&full[..5]);
		assert!(out.is_empty());
		let out = d.feed(&full[5..]);
		assert_eq!(out.len(), 1);
	}

	#[test]
	fn bad_trailing_sof_holds_buffer_then_resyncs_on_next_valid_frame() {
		crate::test_support::init_tracing();
		let mut d = Deframer::new();
		let mut bad = build_uih(DLCI_AT, b"AT\r").unwrap();
		let last = bad.len() - 1;
		bad[last] = 0x00; // corrupt trailing SOF
		let out = d.feed(&bad);
		assert!(out.is_empty());

		// A fresh, valid frame arrives appended after the corrupted one.
		let good = build_uih(DLCI_AT, b"AT+CGMR\r").unwrap();
		let out = d.feed(&good);
		assert_eq!(out.len(), 1);
		assert_eq!(out[0].payload(), b"AT+CGMR\r");
	}

	#[test]
	fn garbage_prefix_without_sof_is_discarded_once_sof_arrives() {
		crate::test_support::init_tracing();
		let mut d = Deframer::new();
		let out = d.feed(b"garbage-not-a-frame");
		assert!(out.is_empty());
		let good = build_uih(DLCI_AT, b"AT\r").unwrap();
		let out = d.feed(&good);
		assert_eq!(out.len(), 1);
	}

	proptest::proptest! {
		#[test]
		fn p2_round_trip_any_dlci_type_and_payload(
			dlci in 0u8..64,
			type_idx in 0usize..5,
			pf in proptest::bool::ANY,
			payload in proptest::collection::vec(proptest::num::u8::ANY, 0..=127),
		) {
			let types = [FrameType::Sabm, FrameType::Ua, FrameType::Dm, FrameType::Disc, FrameType::Uih];
			let t = types[type_idx];
			let control = t.code() | if pf { PF } else { 0 };
			let encoded = encode(dlci, control, &payload).unwrap();
			let mut d = Deframer::new();
			let frames = d.feed(&encoded);
			proptest::prop_assert_eq!(frames.len(), 1);
			proptest::prop_assert_eq!(frames[0].dlci(), dlci);
			proptest::prop_assert_eq!(frames[0].frame_type(), Some(t));
			proptest::prop_assert_eq!(frames[0].pf(), pf);
			proptest::prop_assert_eq!(frames[0].payload(), payload.as_slice());
		}

		#[test]
		fn p3_arbitrary_chunking_yields_same_dispatch_sequence(
			payloads in proptest::collection::vec(proptest::collection::vec(proptest::num::u8::ANY, 0..=40), 1..=5),
			chunk_size in 1usize..7,
		) {
			let mut whole = Vec::new();
			for p in &payloads {
				whole.extend(build_uih(DLCI_AT, p).unwrap());
			}

			let mut whole_decoder = Deframer::new();
			let whole_frames = whole_decoder.feed(&whole);

			let mut chunked_decoder = Deframer::new();
			let mut chunked_frames = Vec::new();
			for chunk in whole.chunks(chunk_size) {
				chunked_frames.extend(chunked_decoder.feed(chunk));
			}

			proptest::prop_assert_eq!(whole_frames.len(), payloads.len());
			proptest::prop_assert_eq!(chunked_frames.len(), payloads.len());
			for (w, c) in whole_frames.iter().zip(chunked_frames.iter()) {
				proptest::prop_assert_eq!(w.payload(), c.payload());
			}
		}
	}
}
