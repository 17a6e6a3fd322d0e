//! Message and client types for the `streamstore.v1` gRPC service,
//! generated from `proto/stream_store.proto` by `build.rs`.

tonic::include_proto!("streamstore.v1");
