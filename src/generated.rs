//! Protobuf/tonic bindings generated from `proto/simdesk/v1/exchange.proto`.
//!
//! Committed to the repository so builds do not require `protoc`; see
//! `build.rs` for regeneration instructions.

pub mod simdesk {
    pub mod v1 {
        include!("generated/simdesk.v1.rs");
    }
}
