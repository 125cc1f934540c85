pub mod agent;
pub mod compute;
pub mod config;
pub mod error;
pub mod grpc;
pub mod http;
pub mod lease;
pub mod node;
pub mod relay;
pub mod session;
pub mod shutdown;
pub mod task_source;
pub mod transport;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("herd");
}
