//! Shared test fixtures.

use bifrost::echo::echo_server::Echo;
use bifrost::echo::{EchoRequest, EchoResponse};
use tonic::{Request, Response, Status};

/// Echoes the request message back unchanged.
#[derive(Debug, Default, Clone)]
pub struct EchoService;

#[tonic::async_trait]
impl Echo for EchoService {
    async fn unary_echo(
        &self,
        request: Request<EchoRequest>,
    ) -> Result<Response<EchoResponse>, Status> {
        Ok(Response::new(EchoResponse {
            message: request.into_inner().message,
        }))
    }
}
