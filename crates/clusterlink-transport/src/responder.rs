//! Server side of the compression capability check

use clusterlink_proto::controller_cap_service_server::{
    ControllerCapService, ControllerCapServiceServer,
};
use clusterlink_proto::enforcer_cap_service_server::{
    EnforcerCapService, EnforcerCapServiceServer,
};
use clusterlink_proto::{ClusBoolean, RpcVoid};
use tonic::{Request, Response, Status};

/// Answers both capability services
#[derive(Clone, Copy, Debug)]
pub struct CapabilityResponder {
    compressed: bool,
}

impl Default for CapabilityResponder {
    fn default() -> Self {
        Self { compressed: true }
    }
}

impl CapabilityResponder {
    /// Responder answering `compressed`
    pub fn new(compressed: bool) -> Self {
        Self { compressed }
    }

    /// Controller-role capability service
    pub fn controller_service(self) -> ControllerCapServiceServer<Self> {
        ControllerCapServiceServer::new(self)
    }

    /// Enforcer-role capability service
    pub fn enforcer_service(self) -> EnforcerCapServiceServer<Self> {
        EnforcerCapServiceServer::new(self)
    }

    fn answer(&self) -> Response<ClusBoolean> {
        Response::new(ClusBoolean {
            value: self.compressed,
        })
    }
}

#[tonic::async_trait]
impl ControllerCapService for CapabilityResponder {
    async fn is_grpc_compressed(
        &self,
        _request: Request<RpcVoid>,
    ) -> Result<Response<ClusBoolean>, Status> {
        Ok(self.answer())
    }
}

#[tonic::async_trait]
impl EnforcerCapService for CapabilityResponder {
    async fn is_grpc_compressed(
        &self,
        _request: Request<RpcVoid>,
    ) -> Result<Response<ClusBoolean>, Status> {
        Ok(self.answer())
    }
}
