//! The public entry point: ties the UART, reader thread, mode controller,
//! rendezvous, and bound DCE together behind a blocking send surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::DteConfig;
use crate::dce::{Dce, PendingRequest};
use crate::error::{Error, Result};
use crate::event::{EventKind, EventPayload, EventSink};
use crate::frame::{self, Frame};
use crate::mode::{Mode, ModeController};
use crate::reader::{self, ReaderContext};
use crate::rendezvous::Rendezvous;
use crate::uart::UartPort;

/// A bound DTE instance: one UART port, one reader thread, one DCE.
///
/// Every blocking send (`send_cmd`, `send_cmux_cmd`, `send_sabm`,
/// `send_wait`) takes `send_lock` first. Invariant I3 ("the rendezvous
/// signal is held by at most one caller at a time") is enforced here, not
/// inside [`Rendezvous`] itself, which is a plain signal.
pub struct Dte {
	uart: Arc<Mutex<Box<dyn UartPort>>>,
	mode: Arc<Mutex<Mode>>,
	mode_controller: Mutex<ModeController>,
	dce: Arc<dyn Dce>,
	rendezvous: Arc<Rendezvous>,
	event_sink: Arc<EventSink>,
	last_line: Arc<Mutex<Option<String>>>,
	last_frame: Arc<Mutex<Option<Frame>>>,
	config: DteConfig,
	send_lock: Mutex<()>,
	shutdown: Arc<AtomicBool>,
	reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dte {
	/// Binds `uart` and `dce` together: arms pattern detection on `\n`,
	/// emits the CMUX close-down sequence (returning a previously-muxed
	/// modem to plain AT mode), and spawns the one reader thread this
	/// instance will have for its lifetime.
	pub fn new(mut uart: Box<dyn UartPort>, dce: Arc<dyn Dce>, config: DteConfig) -> Result<Self> {
		uart.enable_pattern_detection(b'\n').map_err(Error::UartInit)?;
		let events = uart.take_events();
		uart.write(&frame::teardown_sequence()).map_err(Error::Write)?;

		let uart = Arc::new(Mutex::new(uart));
		let mode = Arc::new(Mutex::new(Mode::Command));
		let rendezvous = Arc::new(Rendezvous::new());
		let event_sink = Arc::new(EventSink::new());
		let last_line = Arc::new(Mutex::new(None));
		let last_frame = Arc::new(Mutex::new(None));
		let shutdown = Arc::new(AtomicBool::new(false));

		let ctx = ReaderContext {
			uart: uart.clone(),
			events,
			mode: mode.clone(),
			dce: dce.clone(),
			rendezvous: rendezvous.clone(),
			event_sink: event_sink.clone(),
			last_line: last_line.clone(),
			last_frame: last_frame.clone(),
			line_buffer_size: config.line_buffer_size,
			cmux_line_offset: config.cmux_line_offset,
			shutdown: shutdown.clone(),
		};
		let reader_handle = thread::spawn(move || reader::run(ctx));

		Ok(Self {
			uart,
			mode,
			mode_controller: Mutex::new(ModeController::new()),
			dce,
			rendezvous,
			event_sink,
			last_line,
			last_frame,
			config,
			send_lock: Mutex::new(()),
			shutdown,
			reader_handle: Mutex::new(Some(reader_handle)),
		})
	}

	/// The mode this instance currently believes it is in.
	pub fn mode(&self) -> Mode {
		*self.mode.lock().unwrap()
	}

	/// The event sink asynchronous `UNKNOWN_LINE` / `PPP_START` / `PPP_STOP`
	/// notifications are published to.
	pub fn events(&self) -> &Arc<EventSink> {
		&self.event_sink
	}

	/// Runs the mode transition table against the bound UART and DCE, then
	/// publishes `PPP_START`/`PPP_STOP` on a Command<->PPP transition.
	pub fn change_mode(&self, new_mode: Mode) -> Result<()> {
		let _guard = self.send_lock.lock().unwrap();
		let old_mode = self.mode();
		let mut uart = self.uart.lock().unwrap();
		let mut controller = self.mode_controller.lock().unwrap();
		controller.change_mode(new_mode, &mut **uart, &*self.dce)?;
		*self.mode.lock().unwrap() = new_mode;
		drop(controller);
		drop(uart);
		if old_mode != Mode::Ppp && new_mode == Mode::Ppp {
			self.event_sink.publish(EventKind::PppStart, EventPayload::None);
		} else if old_mode == Mode::Ppp && new_mode != Mode::Ppp {
			self.event_sink.publish(EventKind::PppStop, EventPayload::None);
		}
		Ok(())
	}

	/// `send_cmd` using [`DteConfig::command_timeout`] as the wait bound,
	/// for callers that don't need a per-call override.
	pub fn send_cmd_default(&self, text: &str) -> Result<String> {
		self.send_cmd(text, self.config.command_timeout)
	}

	/// Command-mode send: writes `text` raw and blocks for the next decoded
	/// line.
	pub fn send_cmd(&self, text: &str, timeout: Duration) -> Result<String> {
		let _guard = self.send_lock.lock().unwrap();
		self.dce.set_pending(PendingRequest::AwaitLine);
		self.rendezvous.reset();

		let write_result = self.uart.lock().unwrap().write(text.as_bytes()).map_err(Error::Write);

		let outcome = write_result.and_then(|_| {
			if self.rendezvous.wait_timeout(timeout) {
				self.last_line.lock().unwrap().take().ok_or(Error::ReaderGone)
			} else {
				Err(Error::Timeout(timeout))
			}
		});

		// I5: the one-shot request is cleared on every return path.
		self.dce.take_pending();
		outcome
	}

	/// CMUX-mode send: frames `text` as a UIH on the AT channel (or the
	/// data channel, for a dial command), writes it, sleeps 100 ms, then
	/// blocks for the matching response frame.
	pub fn send_cmux_cmd(&self, text: &str, timeout: Duration) -> Result<String> {
		let _guard = self.send_lock.lock().unwrap();
		let dlci = if (self.config.is_dial_command)(text) {
			frame::DLCI_DATA
		} else {
			frame::DLCI_AT
		};

		let outcome = (|| {
			let encoded = frame::build_uih(dlci, text.as_bytes())?;
			self.dce.set_pending(PendingRequest::AwaitFrame(dlci));
			self.rendezvous.reset();
			self.uart.lock().unwrap().write(&encoded).map_err(Error::Write)?;
			thread::sleep(Duration::from_millis(100));

			if self.rendezvous.wait_timeout(timeout) {
				let frame = self.last_frame.lock().unwrap().take().ok_or(Error::ReaderGone)?;
				let text = frame::strip_line_prefix(frame.payload(), self.config.cmux_line_offset);
				Ok(String::from_utf8_lossy(text).into_owned())
			} else {
				Err(Error::Timeout(timeout))
			}
		})();

		self.dce.take_pending();
		outcome
	}

	/// Writes a SABM frame for `dlci` and blocks for the UA/DM response.
	pub fn send_sabm(&self, dlci: u8, timeout: Duration) -> Result<Frame> {
		let _guard = self.send_lock.lock().unwrap();
		self.dce.set_pending(PendingRequest::AwaitFrame(dlci));
		self.rendezvous.reset();

		let write_result = self.uart.lock().unwrap().write(&frame::build_sabm(dlci)).map_err(Error::Write);

		let outcome = write_result.and_then(|_| {
			if self.rendezvous.wait_timeout(timeout) {
				self.last_frame.lock().unwrap().take().ok_or(Error::ReaderGone)
			} else {
				Err(Error::Timeout(timeout))
			}
		});

		self.dce.take_pending();
		outcome
	}

	/// Raw write, used in unmultiplexed PPP mode. Returns bytes written.
	pub fn send_data(&self, bytes: &[u8]) -> Result<usize> {
		self.uart.lock().unwrap().write(bytes).map_err(Error::Write)
	}

	/// Fragments `bytes` into UIH frames of at most
	/// [`frame::MAX_PAYLOAD_LEN`] bytes on the data channel and writes them
	/// sequentially. Returns `bytes.len()` (P8).
	pub fn send_cmux_data(&self, bytes: &[u8]) -> Result<usize> {
		let mut uart = self.uart.lock().unwrap();
		for chunk in bytes.chunks(frame::MAX_PAYLOAD_LEN) {
			let encoded = frame::build_uih(frame::DLCI_DATA, chunk)?;
			uart.write(&encoded).map_err(Error::Write)?;
		}
		Ok(bytes.len())
	}

	/// Disables pattern detection, writes `bytes`, reads back
	/// `prompt.len()` bytes and compares against `prompt`, then re-enables
	/// pattern detection on every exit path.
	pub fn send_wait(&self, bytes: &[u8], prompt: &[u8], timeout: Duration) -> Result<()> {
		let _guard = self.send_lock.lock().unwrap();
		let mut uart = self.uart.lock().unwrap();
		uart.disable_pattern_detection().map_err(Error::UartInit)?;

		let result: Result<()> = (|| {
			uart.write(bytes).map_err(Error::Write)?;
			let mut buf = vec![0u8; prompt.len()];
			let n = uart.read_timeout(&mut buf, timeout).map_err(Error::Read)?;
			buf.truncate(n);
			if buf == prompt {
				Ok(())
			} else {
				Err(Error::PromptMismatch { expected: prompt.to_vec(), got: buf })
			}
		})();

		uart.enable_pattern_detection(b'\n').map_err(Error::UartInit)?;
		result
	}
}

impl Drop for Dte {
	fn drop(&mut self) {
		self.shutdown.store(true, Ordering::Relaxed);
		if let Some(handle) = self.reader_handle.lock().unwrap().take() {
			let _ = handle.join();
		}
	}
}
