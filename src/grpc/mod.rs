pub mod agent_service;
pub mod compute_service;
pub mod convert;
pub mod relay_client;
pub mod relay_service;
pub mod server;

pub use relay_client::GrpcPortMappingSource;
pub use server::GrpcServer;
