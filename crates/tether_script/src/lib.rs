//! Tether Script
//!
//! QuickJS engine for the bridge.
//!
//! ## Architecture
//!
//! - **Engine:** one rquickjs context per runtime, created on its JS thread
//! - **Prelude:** script-side glue that builds `<namespace>.modules.<Name>`,
//!   turns pending calls into promises and wraps shared objects
//! - **Handles:** native class instances behind each wrapper; collecting the
//!   last wrapper for an object releases it
//! - **Envelopes:** values cross the boundary as JSON

mod envelope;
mod handle;
pub mod quickjs;

pub use quickjs::QuickJsEngine;
pub use rquickjs;
