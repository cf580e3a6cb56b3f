//! A stackful coroutine runtime: explicit context switching, a single-
//! threaded cooperative event hub (epoll/kqueue), a ring buffer, a tiered
//! robin-hood hash map, an incremental HTTP/1.x parser, and a DNS
//! resolver/cache.
//!
//! ## Example
//!
//! A task that sleeps ten times, cooperatively yielding to the hub on
//! every iteration:
//!
//! ```no_run
//! use taskhub::hub::{self, Hub};
//! use taskhub::config::HubOpts;
//!
//! let mut hub = Hub::new(HubOpts::default()).unwrap();
//! hub.spawn(|| {
//!     for _ in 0..10 {
//!         hub::sleep(0);
//!     }
//! }).unwrap();
//! hub.run().unwrap();
//! ```
//!
//! ## Platform support
//!
//! Linux (`epoll`) and the BSDs/macOS (`kqueue`) are supported via the
//! [`poll`] backend; context switching has `x86_64` and `aarch64`
//! implementations in [`ctx`].

pub mod clock;
pub mod config;
pub mod ctx;
pub mod dns;
pub mod err;
pub mod hash;
pub mod heap;
pub mod http;
pub mod hub;
pub mod net;
pub mod resolv;
pub mod ring;
pub mod task;

mod poll;
mod value;
