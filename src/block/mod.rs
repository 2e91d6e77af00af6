//! Block storage layer
//!
//! Translates logical (plaintext) file ranges into physical (ciphertext)
//! block I/O on backing files.

mod io;
mod layout;

pub use io::BlockIo;
pub use layout::BlockLayout;
