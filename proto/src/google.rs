//! Subset of the `google.protobuf` well-known types used on the wire.

pub mod protobuf {
    /// Wrapper message for `bytes`, per `google/protobuf/wrappers.proto`.
    ///
    /// Carries the raw ephemeral public key during the handshake.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BytesValue {
        /// The bytes value.
        #[prost(bytes = "vec", tag = "1")]
        pub value: ::prost::alloc::vec::Vec<u8>,
    }
}
