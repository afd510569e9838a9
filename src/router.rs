//! Protocol routing between the RPC transport and the HTTP gateway.

use std::convert::Infallible;
use std::task::{Context, Poll};

use axum::Router;
use axum::body::Body;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_REQUEST_METHOD, CONTENT_TYPE, ORIGIN,
};
use axum::http::{HeaderValue, Method, Request, Response, StatusCode, Version};
use axum::response::IntoResponse;
use futures_util::future::BoxFuture;
use tower::{Service, ServiceExt};

/// Content-type prefix that marks a request as belonging to the RPC
/// transport.
const GRPC_CONTENT_TYPE: &[u8] = b"application/grpc";

const ALLOWED_HEADERS: &str = "content-type, accept";
const ALLOWED_METHODS: &str = "GET, HEAD, POST, PUT, DELETE";

/// Combined handler serving the RPC transport and the gateway mux on one
/// socket.
///
/// HTTP/2 requests whose content-type begins with `application/grpc` are
/// dispatched to the RPC router; everything else falls through to the
/// gateway mux with permissive CORS. The gateway is meant for same-origin
/// browser clients behind a separate reverse proxy, so whatever `Origin`
/// the browser sent is reflected back verbatim.
#[derive(Clone)]
pub struct ProtocolRouter {
    rpc: Router,
    web: Router,
}

impl ProtocolRouter {
    /// Combine an RPC router and a fallback HTTP router.
    pub fn new(rpc: Router, web: Router) -> Self {
        Self { rpc, web }
    }

    fn is_rpc<B>(request: &Request<B>) -> bool {
        request.version() == Version::HTTP_2
            && request
                .headers()
                .get(CONTENT_TYPE)
                .is_some_and(|ct| ct.as_bytes().starts_with(GRPC_CONTENT_TYPE))
    }
}

impl Service<Request<Body>> for ProtocolRouter {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        if Self::is_rpc(&request) {
            let rpc = self.rpc.clone();
            return Box::pin(async move { Ok(rpc.oneshot(request).await.into_response()) });
        }

        let origin = request.headers().get(ORIGIN).cloned();
        if let Some(origin) = &origin {
            let preflight = request.method() == Method::OPTIONS
                && request.headers().contains_key(ACCESS_CONTROL_REQUEST_METHOD);
            if preflight {
                return Box::pin(std::future::ready(Ok(preflight_response(origin.clone()))));
            }
        }

        let web = self.web.clone();
        Box::pin(async move {
            let mut response = web.oneshot(request).await.into_response();
            if let Some(origin) = origin {
                response.headers_mut().insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
            }
            Ok(response)
        })
    }
}

/// Answer an OPTIONS preflight without forwarding it.
fn preflight_response(origin: HeaderValue) -> Response<Body> {
    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(ALLOWED_HEADERS));
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(ALLOWED_METHODS));
    response
}

#[cfg(test)]
mod tests {
    use axum::routing::any;

    use super::*;

    fn router() -> ProtocolRouter {
        let rpc = Router::new().fallback(any(|| async { "rpc" }));
        let web = Router::new().fallback(any(|| async { "web" }));
        ProtocolRouter::new(rpc, web)
    }

    async fn body_text(response: Response<Body>) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .expect("body");
        String::from_utf8(bytes.to_vec()).expect("utf-8 body")
    }

    fn request(version: Version, content_type: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/echo.Echo/UnaryEcho")
            .version(version)
            .header(CONTENT_TYPE, content_type)
            .body(Body::empty())
            .expect("request")
    }

    #[tokio::test]
    async fn grpc_requests_reach_the_rpc_handler() {
        let response = router()
            .oneshot(request(Version::HTTP_2, "application/grpc+proto"))
            .await
            .expect("infallible");
        assert_eq!(body_text(response).await, "rpc");
    }

    #[tokio::test]
    async fn plain_requests_reach_the_fallback_handler() {
        let response = router()
            .oneshot(request(Version::HTTP_2, "text/plain"))
            .await
            .expect("infallible");
        assert_eq!(body_text(response).await, "web");
    }

    #[tokio::test]
    async fn http1_grpc_content_type_is_not_rpc() {
        // The RPC transport only speaks HTTP/2; version gates the dispatch.
        let response = router()
            .oneshot(request(Version::HTTP_11, "application/grpc"))
            .await
            .expect("infallible");
        assert_eq!(body_text(response).await, "web");
    }

    #[tokio::test]
    async fn origin_is_reflected_on_forwarded_requests() {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/v1/things")
            .header(ORIGIN, "http://example.com")
            .body(Body::empty())
            .expect("request");

        let response = router().oneshot(request).await.expect("infallible");
        assert_eq!(
            response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).expect("header"),
            "http://example.com"
        );
        assert_eq!(body_text(response).await, "web");
    }

    #[tokio::test]
    async fn preflight_is_answered_without_forwarding() {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/v1/things")
            .header(ORIGIN, "http://example.com")
            .header(ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .expect("request");

        let response = router().oneshot(request).await.expect("infallible");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).expect("header"),
            "http://example.com"
        );
        assert_eq!(
            response.headers().get(ACCESS_CONTROL_ALLOW_METHODS).expect("header"),
            ALLOWED_METHODS
        );
        assert_eq!(
            response.headers().get(ACCESS_CONTROL_ALLOW_HEADERS).expect("header"),
            ALLOWED_HEADERS
        );
        // Not forwarded: the fallback body never runs.
        assert_eq!(body_text(response).await, "");
    }

    #[tokio::test]
    async fn options_without_request_method_is_forwarded() {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/v1/things")
            .header(ORIGIN, "http://example.com")
            .body(Body::empty())
            .expect("request");

        let response = router().oneshot(request).await.expect("infallible");
        assert_eq!(body_text(response).await, "web");
    }
}
