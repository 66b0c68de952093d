//! The default `/favicon.ico`, served from an embedded byte slice so a
//! fresh deployment never 404s on the browser's implicit request.

/// A minimal single-frame 16x16 ICO. Not meant to be pretty — just present.
pub const FAVICON_BYTES: &[u8] = include_bytes!("favicon.ico");

pub const FAVICON_CONTENT_TYPE: &str = "image/x-icon";
