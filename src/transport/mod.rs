//! HTTP transport implementations.
//!
//! - HTTP/1.1 written and parsed by hand over tokio-boring
//! - HTTP/2 via the h2 crate
//! - HTTP/3 via quiche

pub(crate) mod connector;
pub(crate) mod h1;
pub(crate) mod h2;
pub(crate) mod h3;
