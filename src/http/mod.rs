//! Incremental HTTP/1.x request/response/chunked-body parsing plus header
//! collection, ported from the source's `http.c`/`http.h` and `filter.c`.

mod map;
mod parser;

pub use map::{BlockMode, HeaderMap};
pub use parser::{Event, Parser, Range};
