//! Convenient re-exports of commonly used types, designed to make crate usage painless.
//!
//! The contents of this module can be used by including the following in any module:
//! ```
//! use basm_asm::prelude::*;
//! ```

#[doc(inline)]
pub use crate::assembler::{assemble, Diagnostic, ErrorKind};
#[doc(inline)]
pub use crate::lexer::{tokenize, IntRadix, Token, TokenKind};

pub mod lexer {
    pub use crate::lexer::Error;
}
