use axum::{Extension, middleware::AddExtension};
use axum_server::{accept::Accept, tls_rustls::RustlsAcceptor};
use futures_util::future::BoxFuture;
use join_structs::binding::{CHANNEL_BINDING_LABEL, CHANNEL_BINDING_LEN};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower::Layer;

/// Per connection TLS facts handed to the handlers.
#[derive(Debug, Clone)]
pub struct TlsData {
    /// Exported keying material both ends can compute
    pub channel_binding: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CustomAcceptor {
    inner: RustlsAcceptor,
}

impl CustomAcceptor {
    pub fn new(inner: RustlsAcceptor) -> Self {
        Self { inner }
    }
}

impl<I, S> Accept<I, S> for CustomAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, TlsData>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();

        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            let server_conn = stream.get_ref().1;
            let channel_binding = server_conn
                .export_keying_material([0u8; CHANNEL_BINDING_LEN], CHANNEL_BINDING_LABEL, None)
                .map_err(io::Error::other)?;
            let tls_data = TlsData {
                channel_binding: channel_binding.to_vec(),
            };
            let service = Extension(tls_data).layer(service);

            Ok((stream, service))
        })
    }
}
