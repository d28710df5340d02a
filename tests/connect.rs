use std::sync::Arc;

use quictun::{
    CertificateError, Endpoint, EndpointOptions, Error, Key, SIGSCHEME_ECDSA384, Session,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    task::{JoinHandle, spawn},
};

mod common;
use common::SETUP;

#[tokio::test]
async fn connection() {
    *SETUP;

    let key1 = Key::generate().unwrap();
    let key2 = Key::generate_for(SIGSCHEME_ECDSA384).unwrap();
    let (pub1, pub2) = (key1.public_key(), key2.public_key());

    let end1 = Endpoint::new("[::1]:0", key1, EndpointOptions::default()).unwrap();
    let end2 = Endpoint::new("[::1]:0", key2, EndpointOptions::default()).unwrap();

    let addr = end2.local_addr().unwrap();

    let task: JoinHandle<Result<(u64, Option<quictun::PublicKey>), Error>> =
        spawn(async move {
            let sesh = end2.accept().await.unwrap()?;
            let seen = (sesh.connection_id(), sesh.peer_key());
            sesh.closed().await?;
            Ok(seen)
        });

    let sesh = end1.connect(addr).await.unwrap();
    assert_eq!(sesh.peer_key(), Some(pub2));
    let conn_id = sesh.connection_id();
    sesh.close(0, b"end");

    let (server_conn_id, server_saw) = task.await.unwrap().unwrap();
    assert_eq!(server_conn_id, conn_id);
    assert_eq!(server_saw, Some(pub1));
}

#[tokio::test]
async fn connection_ids_differ() {
    *SETUP;

    let end1 = Endpoint::new("[::1]:0", Key::generate().unwrap(), Default::default()).unwrap();
    let end2 = Endpoint::new("[::1]:0", Key::generate().unwrap(), Default::default()).unwrap();
    let addr = end2.local_addr().unwrap();

    let task: JoinHandle<Result<(), Error>> = spawn(async move {
        while let Some(sesh) = end2.accept().await {
            sesh?;
        }
        Ok(())
    });

    let a = end1.connect(addr).await.unwrap();
    let b = end1.connect(addr).await.unwrap();
    assert_ne!(a.connection_id(), b.connection_id());
    task.abort();
}

#[tokio::test]
async fn bidi() {
    *SETUP;

    let end1 = Endpoint::new("[::1]:0", Key::generate().unwrap(), Default::default()).unwrap();
    let end2 = Endpoint::new("[::1]:0", Key::generate().unwrap(), Default::default()).unwrap();
    let addr = end2.local_addr().unwrap();

    let task: JoinHandle<Result<(), Error>> = spawn(async move {
        if let Some(sesh) = end2.accept().await {
            let sesh = sesh?;
            let (mut s, mut r) = sesh.accept_stream().await?;
            let mut data = [0; 5];
            AsyncReadExt::read_exact(&mut r, &mut data).await?;
            assert_eq!(&data, b"Hello");
            AsyncWriteExt::write_all(&mut s, b"World").await?;
            AsyncWriteExt::shutdown(&mut s).await?;
            sesh.closed().await?;
        }

        Ok(())
    });

    let sesh = end1.connect(addr).await.unwrap();
    let (mut s, mut r) = sesh.open_stream().await.unwrap();
    AsyncWriteExt::write_all(&mut s, b"Hello").await.unwrap();
    let mut data = Vec::new();
    AsyncReadExt::read_to_end(&mut r, &mut data).await.unwrap();
    assert_eq!(data, b"World");
    sesh.close(0, b"end");
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn trust_policy() {
    *SETUP;

    let key1 = Key::generate().unwrap();
    let key2 = Key::generate().unwrap();
    let key3 = Key::generate().unwrap();

    let allowed = vec![key1.public_key(), key2.public_key()];
    let options = EndpointOptions {
        key_trust_policy: Arc::new(move |key| {
            if allowed.contains(key) {
                Ok(())
            } else {
                Err(CertificateError::ApplicationVerificationFailure)
            }
        }),
        ..Default::default()
    };

    let end1 = Endpoint::new("[::1]:0", key1, options.clone()).unwrap();
    let end2 = Endpoint::new("[::1]:0", key2, options.clone()).unwrap();
    let end3 = Endpoint::new("[::1]:0", key3, options).unwrap();

    let addr = end2.local_addr().unwrap();

    let task: JoinHandle<Result<(), Error>> = spawn(async move {
        while let Some(sesh) = end2.accept().await {
            if let Ok(sesh) = sesh {
                sesh.closed().await?;
            }
        }

        Ok(())
    });

    end1.connect(addr).await.unwrap();

    // the server checks the client certificate after the client considers the handshake done
    match end3.connect(addr).await {
        Err(_) => {}
        Ok(sesh) => assert!(sesh.closed().await.is_err()),
    }

    let suspicious = Endpoint::new(
        "[::1]:0",
        Key::generate().unwrap(),
        EndpointOptions {
            key_trust_policy: Arc::new(|_| Err(CertificateError::ApplicationVerificationFailure)),
            ..Default::default()
        },
    )
    .unwrap();
    suspicious.connect(addr).await.unwrap_err();
    task.abort();
}
