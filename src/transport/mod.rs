//! Thin protocol boundaries: the HTTP surface and the line-framed JSON-RPC
//! stdio surface. Both dispatch into the same router, policy and audit.

pub mod http;
pub mod stdio;

pub use http::{router as http_router, serve_http};
pub use stdio::serve_stdio;
