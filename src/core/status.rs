use std::sync::atomic::{AtomicBool, Ordering};

/// Set once every plan is compiled and the listeners are configured.
///
/// The readiness probe reports 503 until then.
static READY: AtomicBool = AtomicBool::new(false);

pub fn mark_ready(plans: usize) {
    READY.store(true, Ordering::SeqCst);
    log::info!("{plans} aggregation plans loaded, service is ready");
}

pub fn is_ready() -> bool {
    READY.load(Ordering::SeqCst)
}

#[allow(dead_code)]
pub fn reset() {
    READY.store(false, Ordering::SeqCst);
    log::debug!("Readiness status reset");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // readiness is process-wide, serialize the tests touching it
    pub(crate) static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_initial_state_not_ready() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        assert!(!is_ready());
    }

    #[test]
    fn test_mark_ready() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        mark_ready(3);
        assert!(is_ready());
        mark_ready(3);
        assert!(is_ready());
    }
}
