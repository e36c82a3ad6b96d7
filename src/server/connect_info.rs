//! Peer address extraction that tolerates routers built without connect info.

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use std::convert::Infallible;
use std::net::SocketAddr;

/// Remote address of the client, when the server was started with
/// `into_make_service_with_connect_info`. In-process test routers leave it
/// empty instead of rejecting the request.
#[derive(Debug, Clone, Copy)]
pub struct MaybeConnectInfo(pub Option<SocketAddr>);

impl<S> FromRequestParts<S> for MaybeConnectInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeConnectInfo(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[tokio::test]
    async fn test_missing_connect_info_is_none() {
        let (mut parts, _) = Request::new(()).into_parts();
        let MaybeConnectInfo(peer) = MaybeConnectInfo::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert!(peer.is_none());
    }

    #[tokio::test]
    async fn test_connect_info_is_read() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let (mut parts, _) = Request::new(()).into_parts();
        parts.extensions.insert(ConnectInfo(addr));
        let MaybeConnectInfo(peer) = MaybeConnectInfo::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert_eq!(peer, Some(addr));
    }
}
