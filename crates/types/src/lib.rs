pub mod consensus;
pub mod errors;
pub mod rpc;

#[macro_use]
pub mod macros;
