//! Convenient re-exports of commonly used types, designed to make crate usage painless.
//!
//! The contents of this module can be used by including the following in any module:
//! ```
//! use basm_core::prelude::*;
//! ```

#[doc(inline)]
pub use crate::addr::{PAGE_BITS, PAGE_MASK, PAGE_SIZE, offset_of, page_base, page_of};
#[doc(inline)]
pub use crate::data::{DataCursor, DataCursorMut, DataCursorRef, DataCursorTrait, Endian, SeekFrom};

/// Contains [`data::Error`], used in `Result`s returned by the cursor types.
pub mod data {
    pub use crate::data::Error;
}

pub mod util {
    pub use crate::util::format_size;
}
