//! CLI Command Implementations
//!
//! - `inspect`: Record listing
//! - `verify`: Checksum and layout verification

mod inspect;
mod verify;

pub use inspect::InspectCommand;
pub use verify::{PrefixReport, VerifyCommand, VerifyReport};
