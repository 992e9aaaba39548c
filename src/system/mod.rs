//! # Host Seams
//!
//! The boundary between the engine and the environment it runs in. In a browser these are the
//! DOM and `document.cookie`; here they are traits with in-process implementations so the
//! engine can run in tests and from the command line.
//!
//! ## Modules
//!
//! - **`document`**: The `Document` trait the engine renders into, and `VirtualDocument`, a
//!   markup-string implementation that understands `#id`, tag and attribute selectors.
//! - **`cookies`**: The `CookieJar` trait behind Permanent memory, with an in-memory jar that
//!   survives simulated reloads and a `bincode` file jar used by the CLI.

pub mod cookies;
pub mod document;
