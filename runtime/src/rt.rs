use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant, SystemTime};

use stakker::Stakker;

static EXIT: AtomicBool = AtomicBool::new(false);

pub fn init() -> Stakker {
	// Get both a monotonic and an absolute representation of the time.
	let now = Instant::now();
	let now_sys = SystemTime::now();
	// Initialise Stakker with the monotonic time.
	let mut s = Stakker::new(now);
	// Set the Stakker systime to the start time.
	s.set_systime(Some(now_sys));
	s
}

/// Drive a `Stakker` scheduler to completion.
///
/// Unlike a conventional reactor, this loop never itself blocks on socket I/O: the only
/// thing that wakes it between timer deadlines is `wake`, fed by whatever external
/// collaborator posts cross-thread calls or decoded datagrams into the scheduler (see
/// the two-phase construct/bind_thread handle in the caller). `wake`'s payload is
/// ignored; it exists purely to interrupt the blocking wait.
pub fn exec(stakker: &mut Stakker, wake: &Receiver<()>, exit_fn: impl FnOnce()) {
	let _ = ctrlc::set_handler(|| EXIT.store(true, Ordering::Relaxed));

	let mut t = Instant::now();
	let mut idle_pending = stakker.run(t, false);

	while stakker.not_shutdown() {
		// Break out of the loop if an exit is requested.
		if EXIT.load(Ordering::Relaxed) {
			// Call the exit function, which should defer the cleanup of remaining objects.
			exit_fn();
			// Execute the deferral queue to cleanup the application state.
			stakker.run(t, false);
			break;
		};

		let timeout = if idle_pending {
			// Don't block if there are items left in the idle queue.
			Some(Duration::ZERO)
		} else {
			// Otherwise, wait for the next timer deadline.
			stakker.next_wait(t)
		};

		log::trace!("idle_pending: {}, timeout: {:?}", idle_pending, timeout);

		match timeout {
			Some(d) if d.is_zero() => {
				let _ = wake.try_recv();
			}
			Some(d) => {
				let _ = wake.recv_timeout(d);
			}
			// No timer pending and nothing left in the idle queue: nothing further can
			// happen until an external wake arrives.
			None => {
				let _ = wake.recv();
			}
		}

		t = Instant::now();
		idle_pending = stakker.run(t, idle_pending);
	}
}
