use esmbt_runtime::CancelToken;
use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Route Ctrl-C to `cancel`. A second Ctrl-C exits immediately.
pub fn install_signal_handler(cancel: CancelToken) {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.swap(true, Ordering::SeqCst) {
            std::process::exit(1);
        }
        cancel.cancel();
        eprintln!("\ninterrupt received, stopping after the current step (Ctrl-C again to abort)...");
    });
}
