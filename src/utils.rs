use std::any::Any;

use tracing::{info, warn};

/// Best-effort text of a caught panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Pin the calling thread to the given CPU core
pub fn pin_current_thread(core: usize) -> bool {
    let Some(core_id) = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == core))
    else {
        warn!("CPU core {} not available, thread stays unpinned", core);
        return false;
    };

    let pinned = core_affinity::set_for_current(core_id);
    if pinned {
        info!("Pinned thread to CPU core {}", core);
    } else {
        warn!("Failed to pin thread to CPU core {}", core);
    }
    pinned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_from_payloads() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload = std::panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "code 7");

        let payload: Box<dyn Any + Send> = Box::new(5u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }

    #[test]
    fn pinning_to_missing_core_fails() {
        assert!(!pin_current_thread(usize::MAX));
    }
}
