use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use crate::am::config::PortRange;
use crate::am::daemon::am_event;

const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Finds a free TCP port by probing local connectability.
///
/// A port is considered free when a loopback connect attempt fails. There is
/// an unavoidable window between this probe and the child actually binding;
/// another process can claim the port in between. Accepted limitation.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    ranges: Vec<PortRange>,
}

impl PortAllocator {
    pub fn new(ranges: Vec<PortRange>) -> Self {
        Self { ranges }
    }

    /// Probe `preferred` first, then scan the configured ranges in order.
    /// `None` means every candidate is taken.
    pub fn allocate(&self, app: &str, preferred: Option<u16>) -> Option<u16> {
        if let Some(p) = preferred {
            if is_free(p) {
                am_event("ports", Some(app), format!("allocated port={p} source=preferred"));
                return Some(p);
            }
            am_event("ports", Some(app), format!("preferred_in_use port={p} decision=scan_ranges"));
        }
        for r in &self.ranges {
            for p in r.start..r.end {
                if is_free(p) {
                    am_event("ports", Some(app), format!("allocated port={p} source=range"));
                    return Some(p);
                }
            }
        }
        am_event("ports", Some(app), "exhausted outcome=no_free_port");
        None
    }
}

fn is_free(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_err()
}
