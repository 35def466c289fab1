//! Port allocation with loopback bind-probing and a per-process issued set.

use std::net::{TcpListener, SocketAddr};

use parking_lot::Mutex;

use crate::error::{EngineError, Result};

/// Allocates TCP ports on the loopback interface, preferring a caller's
/// requested port and falling back to a scan of a configured range.
pub struct PortAllocator {
    low: u16,
    high: u16,
    issued: Mutex<std::collections::HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: (u16, u16)) -> Self {
        Self {
            low: range.0,
            high: range.1,
            issued: Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Choose a port: `preferred` if given, non-zero, and free; otherwise
    /// the first free port found scanning the configured range upward.
    pub fn allocate(&self, preferred: Option<u16>) -> Result<u16> {
        let mut issued = self.issued.lock();

        if let Some(port) = preferred {
            if port != 0 && !issued.contains(&port) && Self::is_free(port) {
                issued.insert(port);
                return Ok(port);
            }
        }

        for port in self.low..=self.high {
            if !issued.contains(&port) && Self::is_free(port) {
                issued.insert(port);
                return Ok(port);
            }
        }

        Err(EngineError::NoFreePort {
            low: self.low,
            high: self.high,
        })
    }

    /// Release a previously issued port from the bookkeeping set. This is
    /// pure bookkeeping; the OS, not this set, is the real availability
    /// authority once the owning process has exited.
    pub fn release(&self, port: u16) {
        self.issued.lock().remove(&port);
    }

    fn is_free(port: u16) -> bool {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        TcpListener::bind(addr).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_preferred_when_free() {
        let allocator = PortAllocator::new((20000, 20100));
        let port = allocator.allocate(Some(20050)).unwrap();
        assert_eq!(port, 20050);
    }

    #[test]
    fn falls_back_to_scan_on_collision() {
        let allocator = PortAllocator::new((20100, 20200));
        let first = allocator.allocate(Some(20150)).unwrap();
        let second = allocator.allocate(Some(20150)).unwrap();
        assert_eq!(first, 20150);
        assert_ne!(second, 20150);
    }

    #[test]
    fn exhausted_range_errors() {
        let allocator = PortAllocator::new((20300, 20300));
        let first = allocator.allocate(None).unwrap();
        assert_eq!(first, 20300);
        let err = allocator.allocate(None).unwrap_err();
        assert!(matches!(err, EngineError::NoFreePort { .. }));
    }

    #[test]
    fn release_allows_reissue() {
        let allocator = PortAllocator::new((20400, 20400));
        let port = allocator.allocate(None).unwrap();
        allocator.release(port);
        let again = allocator.allocate(None).unwrap();
        assert_eq!(again, port);
    }
}
