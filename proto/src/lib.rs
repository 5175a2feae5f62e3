//! Protobuf types for the Stratus expander service.
//!
//! The message and client code is vendored (see `expander.proto` for the
//! contract) so the workspace builds without a protoc toolchain. Keep
//! `src/expander.rs` in sync with the proto file when the contract changes.

pub mod expander;
