//! HTTPS against a server presenting a self-signed certificate.

use std::sync::Arc;

use modkit_requests::{ApiClient, ClientConfig, HttpError};
use rustls_pki_types::PrivatePkcs8KeyDer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 11\r\nconnection: close\r\n\r\n{\"ok\":true}";

/// Serve every connection with one canned JSON response; returns the port.
async fn spawn_self_signed_server() -> u16 {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let params =
        rcgen::CertificateParams::new(vec!["localhost".to_owned(), "127.0.0.1".to_owned()])
            .unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    let key = PrivatePkcs8KeyDer::from(key_pair.serialize_der());

    let config = rustls::ServerConfig::builder_with_provider(
        modkit_requests::tls::get_crypto_provider(),
    )
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![cert.der().clone()], key.into())
    .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                let mut head = Vec::new();
                let mut chunk = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match tls.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&chunk[..n]),
                    }
                }
                if tls.write_all(RESPONSE).await.is_ok() {
                    tls.shutdown().await.unwrap_or_default();
                }
            });
        }
    });

    port
}

#[tokio::test]
async fn self_signed_certificate_accepted_only_without_verification() {
    let port = spawn_self_signed_server().await;
    let url = format!("https://127.0.0.1:{port}/ok");

    let client = ApiClient::new(ClientConfig::standalone()).unwrap();

    let (status, body): (_, serde_json::Value) = client.get(&url).await.unwrap();
    assert_eq!(status.as_u16(), 200);
    assert_eq!(body["ok"], true);

    client.set_https_verify(true);
    let err = client.get::<serde_json::Value>(&url).await.unwrap_err();
    assert!(matches!(err, HttpError::Tls(_)), "expected Tls, got {err:?}");
    assert!(err.is_transport());
    assert_eq!(err.status(), None);

    client.set_https_verify(false);
    let (status, _): (_, serde_json::Value) = client.get(&url).await.unwrap();
    assert_eq!(status.as_u16(), 200);
}
