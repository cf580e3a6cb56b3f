//! DNS wire format and a TTL-bounded answer cache, ported from the
//! source's `dns.c`/`dns.h` and `dnsc.c`/`dnsc.h`.

pub mod cache;
pub mod packet;

pub use cache::Cache;
pub use packet::{Header, Item, Packet, Question, RData, Record, RecordType, Section};
