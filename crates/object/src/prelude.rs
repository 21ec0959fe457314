//! Convenient re-exports of commonly used types, designed to make crate usage painless.
//!
//! The contents of this module can be used by including the following in any module:
//! ```
//! use basm_object::prelude::*;
//! ```

#[doc(inline)]
pub use crate::archive::StaticLibrary;
#[doc(inline)]
pub use crate::types::{
    Binding, FileType, ObjectHeader, RelocKind, Relocation, Section, SectionFlags, SectionKind, Symbol, MAGIC,
};
#[doc(inline)]
pub use crate::ObjectFile;

pub mod serialize {
    pub use crate::serialize::Error;
}

pub mod archive {
    pub use crate::archive::Error;
}
