//! Page-ticketing boundary.
//!
//! An admission layer in front of the copy engine hands out tickets for
//! prefetch requests and later reports the device pages that satisfy them.
//! Only the interface and the ticket counter live here.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::pinned::DevicePtr;

/// Opaque handle for one page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

impl Ticket {
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ticket-{}", self.0)
    }
}

/// A device-resident page handed back by a ready notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PagePtr {
    pub gpu_id: i32,
    pub addr: DevicePtr,
    pub bytes: usize,
}

/// Notification called once a ticket's pages are resident.
pub type PagesReady = Box<dyn Fn(Ticket, &[PagePtr]) + Send + Sync>;

/// Request admission in front of the copy engine.
pub trait PageTicketing: Send + Sync {
    /// Ask for the pages of `layer_ids` under `prefix_id`.
    fn request_pages(&self, prefix_id: u64, layer_ids: &[u32], deadline_ms: i64) -> Ticket;

    /// Install the readiness notification.
    fn on_pages_ready(&self, callback: PagesReady);

    /// Give pages back once the consumer is done with them.
    fn return_pages(&self, pages: &[PagePtr]);
}

/// Monotonic ticket source, starting at 1.
#[derive(Debug)]
pub struct TicketIssuer {
    next: AtomicU64,
}

impl Default for TicketIssuer {
    fn default() -> Self {
        Self::new()
    }
}

impl TicketIssuer {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn issue(&self) -> Ticket {
        Ticket(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Ticket that the next `issue` returns.
    pub fn peek(&self) -> Ticket {
        Ticket(self.next.load(Ordering::Relaxed))
    }
}
