//! Convenient re-exports of commonly used types, designed to make crate usage painless.
//!
//! The contents of this module can be used by including the following in any module:
//! ```
//! use basm_link::prelude::*;
//! ```

#[doc(inline)]
pub use crate::link::{link, Error, DEFAULT_ENTRY};
