//! Convenient re-exports of commonly used types, designed to make crate usage painless.
//!
//! The contents of this module can be used by including the following in any module:
//! ```
//! use basm_memory::prelude::*;
//! ```

#[doc(inline)]
pub use crate::bus::SystemBus;
#[doc(inline)]
pub use crate::cell::MemoryCell;
#[doc(inline)]
pub use crate::vm::{TLB_CAPACITY, VirtualMemoryUnit};

pub mod bus {
    pub use crate::bus::Error;
}

pub mod cell {
    pub use crate::cell::Error;
}

pub mod vm {
    pub use crate::vm::Error;
}
