//! The single reader thread: drains the UART event queue and dispatches
//! Command-mode lines and CMUX/PPP-mode bytes to the bound DCE.
//!
//! Invariant I4: a [`crate::dte::Dte`] spawns exactly one of these threads
//! for its lifetime, and joins it on drop. Everything here is a free
//! function operating on a [`ReaderContext`] rather than a method on a
//! struct, since the thread's closure is the only caller and there is no
//! benefit to a type that exists for one call site.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::dce::{Dce, PendingRequest};
use crate::event::{EventKind, EventPayload, EventSink};
use crate::frame::{self, Deframer, Frame};
use crate::mode::Mode;
use crate::uart::{UartEvent, UartPort};

/// How long a single `recv_timeout` on the event queue blocks for before
/// re-checking the shutdown flag.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared state and collaborators a reader thread needs for its lifetime.
pub struct ReaderContext {
	pub uart: Arc<Mutex<Box<dyn UartPort>>>,
	pub events: Receiver<UartEvent>,
	pub mode: Arc<Mutex<Mode>>,
	pub dce: Arc<dyn Dce>,
	pub rendezvous: Arc<crate::rendezvous::Rendezvous>,
	pub event_sink: Arc<EventSink>,
	pub last_line: Arc<Mutex<Option<String>>>,
	pub last_frame: Arc<Mutex<Option<Frame>>>,
	pub line_buffer_size: usize,
	pub cmux_line_offset: usize,
	pub shutdown: Arc<AtomicBool>,
}

/// Runs the reader loop until the shutdown flag is set or the event queue
/// disconnects. Intended to be the body of the one reader thread a `Dte`
/// spawns.
pub fn run(ctx: ReaderContext) {
	let mut line_buf: Vec<u8> = Vec::new();
	let mut deframer = Deframer::new();

	loop {
		if ctx.shutdown.load(Ordering::Relaxed) {
			return;
		}

		match ctx.events.recv_timeout(EVENT_POLL_INTERVAL) {
			Ok(event) => handle_event(&ctx, event, &mut line_buf, &mut deframer),
			Err(RecvTimeoutError::Timeout) => continue,
			Err(RecvTimeoutError::Disconnected) => return,
		}
	}
}

fn handle_event(ctx: &ReaderContext, event: UartEvent, line_buf: &mut Vec<u8>, deframer: &mut Deframer) {
	match event {
		UartEvent::Data => handle_data(ctx, deframer),
		UartEvent::PatternDetected => handle_pattern(ctx, line_buf),
		UartEvent::FifoOverflow | UartEvent::BufferFull => {
			tracing::warn!(?event, "uart: overflow, flushing and resetting reassembly state");
			if let Err(e) = ctx.uart.lock().unwrap().flush_input() {
				tracing::warn!(error = %e, "uart: flush after overflow failed");
			}
			line_buf.clear();
			*deframer = Deframer::new();
		}
		UartEvent::Break | UartEvent::ParityError | UartEvent::FrameError => {
			tracing::warn!(?event, "uart: line condition reported");
		}
	}
}

fn handle_data(ctx: &ReaderContext, deframer: &mut Deframer) {
	let mode = *ctx.mode.lock().unwrap();
	let bytes = match drain_available(&ctx.uart) {
		Ok(bytes) => bytes,
		Err(e) => {
			tracing::warn!(error = %e, "uart: read failed on DATA event");
			return;
		}
	};
	if bytes.is_empty() {
		return;
	}

	match mode {
		Mode::Command => {
			// Command mode dispatches on PATTERN_DETECTED only; stray DATA
			// events with no pattern byte configured carry nothing the
			// line scanner can use.
		}
		Mode::Ppp => ctx.dce.receive_ppp(&bytes),
		Mode::Cmux => {
			for frame in deframer.feed(&bytes) {
				dispatch_frame(ctx, &frame);
			}
		}
	}
}

fn drain_available(uart: &Arc<Mutex<Box<dyn UartPort>>>) -> io::Result<Vec<u8>> {
	let mut guard = uart.lock().unwrap();
	let available = guard.buffered_len();
	if available == 0 {
		return Ok(Vec::new());
	}
	let mut buf = vec![0u8; available];
	let n = guard.read_timeout(&mut buf, Duration::from_millis(0))?;
	buf.truncate(n);
	Ok(buf)
}

/// Command-mode line terminator; matches the byte every `ModeController`
/// transition into Command mode arms pattern detection with.
const LINE_TERMINATOR: u8 = b'\n';

fn handle_pattern(ctx: &ReaderContext, line_buf: &mut Vec<u8>) {
	{
		let mut guard = ctx.uart.lock().unwrap();
		if guard.pop_pattern_pos().is_none() {
			tracing::warn!("uart: PATTERN_DETECTED with no queued position");
			return;
		}
	}

	// The queued position only signals that a terminator is somewhere in
	// the buffered input; a burst can contain several lines (and several
	// queued positions) before the reader looks at any of them, which
	// would make a stale numeric offset unreliable. Reading byte-by-byte
	// until the terminator is seen sidesteps that entirely.
	let chunk = {
		let mut guard = ctx.uart.lock().unwrap();
		match read_until(&mut **guard, LINE_TERMINATOR, Duration::from_millis(200)) {
			Ok(chunk) => chunk,
			Err(e) => {
				tracing::warn!(error = %e, "uart: read failed on PATTERN_DETECTED");
				return;
			}
		}
	};

	line_buf.extend_from_slice(&chunk);
	if line_buf.len() > ctx.line_buffer_size {
		tracing::warn!(len = line_buf.len(), cap = ctx.line_buffer_size, "command line exceeded buffer, truncating");
		let excess = line_buf.len() - ctx.line_buffer_size;
		line_buf.drain(..excess);
	}

	let raw = std::mem::take(line_buf);
	let trimmed = String::from_utf8_lossy(&raw);
	let trimmed = trimmed.trim_end_matches(['\r', '\n']);

	// P6: a line whose content is only CR/LF bytes is never forwarded.
	if trimmed.is_empty() {
		return;
	}

	dispatch_line(ctx, trimmed);
}

/// Reads one byte at a time until `terminator` is seen or `deadline`
/// elapses, returning everything read so far (terminator included if
/// found).
fn read_until(uart: &mut dyn UartPort, terminator: u8, deadline: Duration) -> io::Result<Vec<u8>> {
	let mut out = Vec::new();
	let start = Instant::now();
	loop {
		let remaining = deadline.checked_sub(start.elapsed()).unwrap_or(Duration::ZERO);
		if remaining.is_zero() {
			return Ok(out);
		}
		let mut byte = [0u8; 1];
		let n = uart.read_timeout(&mut byte, remaining)?;
		if n == 0 {
			return Ok(out);
		}
		out.push(byte[0]);
		if byte[0] == terminator {
			return Ok(out);
		}
	}
}

fn dispatch_line(ctx: &ReaderContext, line: &str) {
	match ctx.dce.take_pending() {
		PendingRequest::AwaitLine => {
			*ctx.last_line.lock().unwrap() = Some(line.to_string());
			ctx.rendezvous.signal();
		}
		other @ PendingRequest::AwaitFrame(_) => {
			// A line arrived while the caller is waiting on a frame; not a
			// match for the pending request, restore it and fall through
			// to the reusable handler.
			ctx.dce.set_pending(other);
			reusable_line(ctx, line);
		}
		PendingRequest::Idle => reusable_line(ctx, line),
	}
}

fn reusable_line(ctx: &ReaderContext, line: &str) {
	if !ctx.dce.handle_line(line) {
		ctx.event_sink.publish(EventKind::UnknownLine, EventPayload::Text(line.to_string()));
	}
}

/// Dispatches a decoded CMUX frame against the one-shot request slot, then
/// (if it wasn't a match) the reusable rules.
///
/// Rule order:
/// 1. A pending [`PendingRequest::AwaitFrame`] for this DLCI resolves the
///    rendezvous (covers both the DLCI 0 establishment handshake and the
///    post-dial `CONNECT` text on DLCI 1; the caller interprets the raw
///    frame it gets back).
/// 2. DLCI 1, UIH, non-empty payload: PPP bytes, delivered via
///    `receive_ppp` (the one-shot CONNECT case above already consumed the
///    dial response, so anything reaching here is data).
/// 3. DLCI 2, UIH, payload (after stripping the CRLF prefix) longer than 2
///    bytes: AT-channel text, delivered via `handle_line`.
/// 4. DLCI 0 with no match: no action (the control channel's only traffic
///    is the establishment handshake, fully covered by rule 1).
/// 5. Anything else: logged and dropped.
fn dispatch_frame(ctx: &ReaderContext, frame: &Frame) {
	let dlci = frame.dlci();

	match ctx.dce.take_pending() {
		PendingRequest::AwaitFrame(expected) if expected == dlci => {
			*ctx.last_frame.lock().unwrap() = Some(frame.clone());
			ctx.rendezvous.signal();
			return;
		}
		other => ctx.dce.set_pending(other),
	}

	let is_uih = matches!(frame.frame_type(), Some(crate::frame::FrameType::Uih));

	if is_uih && dlci == frame::DLCI_DATA && !frame.payload().is_empty() {
		ctx.dce.receive_ppp(frame.payload());
		return;
	}

	if is_uih && dlci == frame::DLCI_AT {
		let text = frame::strip_line_prefix(frame.payload(), ctx.cmux_line_offset);
		if text.len() > 2 {
			ctx.dce.handle_line(&String::from_utf8_lossy(text));
			return;
		}
	}

	if dlci != frame::DLCI_CONTROL {
		tracing::warn!(dlci, "cmux: unknown dispatch state, dropping frame");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dce::NullDce;
	use crate::uart::LoopbackUart;
	use std::sync::mpsc;
	use std::thread;

	fn make_ctx(mode: Mode, dce: Arc<dyn Dce>) -> (ReaderContext, crate::uart::LoopbackHandle, Arc<AtomicBool>) {
		let mut uart = LoopbackUart::new(16);
		if mode == Mode::Command {
			uart.enable_pattern_detection(b'\n').unwrap();
		}
		let handle = uart.handle();
		let events = uart.take_events();
		let shutdown = Arc::new(AtomicBool::new(false));
		let ctx = ReaderContext {
			uart: Arc::new(Mutex::new(Box::new(uart))),
			events,
			mode: Arc::new(Mutex::new(mode)),
			dce,
			rendezvous: Arc::new(crate::rendezvous::Rendezvous::new()),
			event_sink: Arc::new(EventSink::new()),
			last_line: Arc::new(Mutex::new(None)),
			last_frame: Arc::new(Mutex::new(None)),
			line_buffer_size: 256,
			cmux_line_offset: 2,
			shutdown: shutdown.clone(),
		};
		(ctx, handle, shutdown)
	}

	#[test]
	fn command_mode_line_with_no_pending_goes_to_reusable_handler() {
		let dce = Arc::new(NullDce::new());
		let (ctx, handle, shutdown) = make_ctx(Mode::Command, dce.clone());

		let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
		let c = count.clone();
		ctx.event_sink.subscribe(EventKind::UnknownLine, move |payload| {
			if let EventPayload::Text(text) = payload {
				assert_eq!(text, "OK");
			}
			c.fetch_add(1, Ordering::SeqCst);
		});

		let (tx, rx) = mpsc::channel::<()>();
		let t = thread::spawn(move || {
			run(ctx);
			let _ = tx.send(());
		});

		// The bare "\n" line before "OK" is CR/LF-only and dropped, so
		// exactly one UNKNOWN_LINE publish is expected: for "OK".
		handle.inject(b"\nOK\r\n");
		thread::sleep(Duration::from_millis(50));
		shutdown.store(true, Ordering::Relaxed);
		rx.recv_timeout(Duration::from_secs(2)).unwrap();
		t.join().unwrap();

		assert_eq!(count.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn await_line_resolves_rendezvous_with_captured_text() {
		let dce = Arc::new(NullDce::new());
		dce.set_pending(PendingRequest::AwaitLine);
		let (ctx, handle, shutdown) = make_ctx(Mode::Command, dce.clone());
		let rendezvous = ctx.rendezvous.clone();
		let last_line = ctx.last_line.clone();
		let t = thread::spawn(move || run(ctx));

		handle.inject(b"+CSQ: 20,99\r\n");
		assert!(rendezvous.wait_timeout(Duration::from_secs(2)));
		assert_eq!(last_line.lock().unwrap().as_deref(), Some("+CSQ: 20,99"));

		shutdown.store(true, Ordering::Relaxed);
		t.join().unwrap();
	}

	#[test]
	fn cmux_frame_on_awaited_dlci_resolves_rendezvous() {
		let dce = Arc::new(NullDce::new());
		dce.set_pending(PendingRequest::AwaitFrame(frame::DLCI_AT));
		let (ctx, handle, shutdown) = make_ctx(Mode::Cmux, dce.clone());
		let rendezvous = ctx.rendezvous.clone();
		let last_frame = ctx.last_frame.clone();
		let t = thread::spawn(move || run(ctx));

		let encoded = frame::build_uih(frame::DLCI_AT, b"OK\r").unwrap();
		handle.inject(&encoded);
		assert!(rendezvous.wait_timeout(Duration::from_secs(2)));
		assert_eq!(last_frame.lock().unwrap().as_ref().unwrap().payload(), b"OK\r");

		shutdown.store(true, Ordering::Relaxed);
		t.join().unwrap();
	}

	#[test]
	fn reusable_at_frame_strips_crlf_prefix_and_calls_handle_line() {
		struct RecordingDce {
			seen: Mutex<Vec<String>>,
		}
		impl Dce for RecordingDce {
			fn set_working_mode(&self, _mode: Mode) {}
			fn setup_cmux(&self) {}
			fn handle_line(&self, line: &str) -> bool {
				self.seen.lock().unwrap().push(line.to_string());
				true
			}
			fn hang_up(&self) {}
			fn receive_ppp(&self, _bytes: &[u8]) {}
			fn define_pdp_context(&self, _cid: u8, _apn: &str) -> bool {
				false
			}
			fn take_pending(&self) -> PendingRequest {
				PendingRequest::Idle
			}
			fn set_pending(&self, _req: PendingRequest) {}
		}

		let dce = Arc::new(RecordingDce { seen: Mutex::new(Vec::new()) });
		let (ctx, handle, shutdown) = make_ctx(Mode::Cmux, dce.clone());
		let t = thread::spawn(move || run(ctx));

		let encoded = frame::build_uih(frame::DLCI_AT, b"\r\nOK").unwrap();
		handle.inject(&encoded);
		thread::sleep(Duration::from_millis(50));
		shutdown.store(true, Ordering::Relaxed);
		t.join().unwrap();

		assert_eq!(dce.seen.lock().unwrap().as_slice(), ["OK"]);
	}

	#[test]
	fn reusable_at_frame_too_short_after_prefix_strip_is_dropped() {
		let dce = Arc::new(NullDce::new());
		let (ctx, handle, shutdown) = make_ctx(Mode::Cmux, dce.clone());
		let t = thread::spawn(move || run(ctx));

		// "\r\nOK" stripped of its 2-byte prefix leaves "OK" (len 2, not >2).
		let encoded = frame::build_uih(frame::DLCI_AT, b"\r\nOK").unwrap();
		handle.inject(&encoded);
		thread::sleep(Duration::from_millis(50));
		shutdown.store(true, Ordering::Relaxed);
		t.join().unwrap();
	}

	#[test]
	fn reusable_dlci1_frame_with_payload_is_ppp_data() {
		struct RecordingDce {
			seen: Mutex<Vec<u8>>,
		}
		impl Dce for RecordingDce {
			fn set_working_mode(&self, _mode: Mode) {}
			fn setup_cmux(&self) {}
			fn handle_line(&self, _line: &str) -> bool {
				false
			}
			fn hang_up(&self) {}
			fn receive_ppp(&self, bytes: &[u8]) {
				self.seen.lock().unwrap().extend_from_slice(bytes);
			}
			fn define_pdp_context(&self, _cid: u8, _apn: &str) -> bool {
				false
			}
			fn take_pending(&self) -> PendingRequest {
				PendingRequest::Idle
			}
			fn set_pending(&self, _req: PendingRequest) {}
		}

		let dce = Arc::new(RecordingDce { seen: Mutex::new(Vec::new()) });
		let (ctx, handle, shutdown) = make_ctx(Mode::Cmux, dce.clone());
		let t = thread::spawn(move || run(ctx));

		let encoded = frame::build_uih(frame::DLCI_DATA, &[0x7E, 0x01, 0x02, 0x7E]).unwrap();
		handle.inject(&encoded);
		thread::sleep(Duration::from_millis(50));
		shutdown.store(true, Ordering::Relaxed);
		t.join().unwrap();

		assert_eq!(&*dce.seen.lock().unwrap(), &[0x7E, 0x01, 0x02, 0x7E]);
	}

	#[test]
	fn ppp_mode_data_goes_straight_to_receive_ppp() {
		struct RecordingDce {
			seen: Mutex<Vec<u8>>,
		}
		impl Dce for RecordingDce {
			fn set_working_mode(&self, _mode: Mode) {}
			fn setup_cmux(&self) {}
			fn handle_line(&self, _line: &str) -> bool {
				false
			}
			fn hang_up(&self) {}
			fn receive_ppp(&self, bytes: &[u8]) {
				self.seen.lock().unwrap().extend_from_slice(bytes);
			}
			fn define_pdp_context(&self, _cid: u8, _apn: &str) -> bool {
				false
			}
			fn take_pending(&self) -> PendingRequest {
				PendingRequest::Idle
			}
			fn set_pending(&self, _req: PendingRequest) {}
		}

		let dce = Arc::new(RecordingDce { seen: Mutex::new(Vec::new()) });
		let (ctx, handle, shutdown) = make_ctx(Mode::Ppp, dce.clone());
		let t = thread::spawn(move || run(ctx));

		handle.inject(&[0x7E, 0x01, 0x02, 0x7E]);
		thread::sleep(Duration::from_millis(50));
		shutdown.store(true, Ordering::Relaxed);
		t.join().unwrap();

		assert_eq!(&*dce.seen.lock().unwrap(), &[0x7E, 0x01, 0x02, 0x7E]);
	}
}
