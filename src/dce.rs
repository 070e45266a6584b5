//! DCE binding: the modem-side collaborator this crate dispatches to.
//!
//! The DCE is out of scope as an implementation (it models the physical
//! modem, AT-command semantics, and PDP/IP handling) but its dispatch
//! surface is very much in scope: every decoded line or CMUX frame the
//! reader thread produces has to go somewhere. [`Dce`] is that surface.
//!
//! The original one-shot response handler was a raw nullable function
//! pointer the send path installed and the reader path called-then-cleared.
//! Here it is a typed [`PendingRequest`] slot instead: the send path sets it
//! before waiting on the rendezvous, the reader atomically takes it back out
//! when a matching line or frame arrives. A slot can't be "installed twice"
//! or left dangling the way a raw pointer could.

use std::sync::Mutex;

use crate::mode::Mode;

/// What kind of one-shot response the send surface is currently waiting
/// for, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingRequest {
	/// No outstanding one-shot request; lines/frames dispatch to the DCE's
	/// reusable handlers only.
	Idle,
	/// Waiting for the next decoded Command-mode line (e.g. an AT command's
	/// final response).
	AwaitLine,
	/// Waiting for the next CMUX frame on the given DLCI.
	AwaitFrame(u8),
}

/// The modem-side collaborator a [`crate::dte::Dte`] is bound to.
///
/// All methods take `&self` rather than `&mut self`: a `Dce` is shared
/// between the caller thread (which sets up a [`PendingRequest`] before a
/// send) and the reader thread (which consumes decoded lines/frames and
/// resolves that request), so any mutable state an implementation needs
/// must use interior mutability.
pub trait Dce: Send + Sync {
	/// Notifies the DCE that the mode controller has entered `mode`. Called
	/// on every leg of a mode transition, before the transition is
	/// considered complete.
	fn set_working_mode(&self, mode: Mode);

	/// Runs DCE-side CMUX bring-up (DLCI 0 SABM, channel numbering
	/// agreement) once the UART side of a Command -> CMUX transition is
	/// configured.
	fn setup_cmux(&self);

	/// Offers a decoded Command-mode line, or CMUX AT-channel response
	/// text, to the DCE's reusable line handler. Returns `true` if it was
	/// recognized and handled.
	///
	/// Not consulted while a [`PendingRequest::AwaitLine`] is outstanding
	/// (the reader resolves the one-shot wait first and only falls through
	/// to this reusable path if `take_pending` returned `Idle`).
	fn handle_line(&self, line: &str) -> bool;

	/// Tears down the active call/context (DTR drop or `ATH` equivalent).
	fn hang_up(&self);

	/// Delivers raw PPP bytes received on the data channel (either DLCI 1
	/// payload while CMUX is active, or the whole UART stream while in
	/// unmultiplexed PPP mode).
	fn receive_ppp(&self, bytes: &[u8]);

	/// Requests a PDP context with the given APN, returning `true` if the
	/// DCE accepted the request.
	fn define_pdp_context(&self, cid: u8, apn: &str) -> bool;

	/// Atomically reads and clears the outstanding one-shot request,
	/// returning what it was. Called by the reader thread before it
	/// considers a decoded line or frame for dispatch.
	fn take_pending(&self) -> PendingRequest;

	/// Installs a one-shot request, replacing whatever was there. Called by
	/// the send surface immediately before it begins a rendezvous wait.
	fn set_pending(&self, req: PendingRequest);
}

/// A `Dce` that does nothing and records nothing beyond the mode-controller
/// interactions [`crate::mode::ModeController`]'s own tests check.
pub struct NullDce {
	state: Mutex<NullDceState>,
}

struct NullDceState {
	setup_cmux_calls: usize,
	working_mode: Option<Mode>,
	pending: PendingRequest,
}

impl NullDce {
	pub fn new() -> Self {
		Self {
			state: Mutex::new(NullDceState {
				setup_cmux_calls: 0,
				working_mode: None,
				pending: PendingRequest::Idle,
			}),
		}
	}

	pub fn setup_cmux_calls(&self) -> usize {
		self.state.lock().unwrap().setup_cmux_calls
	}

	pub fn working_mode(&self) -> Option<Mode> {
		self.state.lock().unwrap().working_mode
	}
}

impl Default for NullDce {
	fn default() -> Self {
		Self::new()
	}
}

impl Dce for NullDce {
	fn set_working_mode(&self, mode: Mode) {
		self.state.lock().unwrap().working_mode = Some(mode);
	}

	fn setup_cmux(&self) {
		self.state.lock().unwrap().setup_cmux_calls += 1;
	}

	fn handle_line(&self, _line: &str) -> bool {
		false
	}

	fn hang_up(&self) {}

	fn receive_ppp(&self, _bytes: &[u8]) {}

	fn define_pdp_context(&self, _cid: u8, _apn: &str) -> bool {
		false
	}

	fn take_pending(&self) -> PendingRequest {
		let mut state = self.state.lock().unwrap();
		std::mem::replace(&mut state.pending, PendingRequest::Idle)
	}

	fn set_pending(&self, req: PendingRequest) {
		self.state.lock().unwrap().pending = req;
	}
}
