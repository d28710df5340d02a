use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use quictun::{
    Error,
    codec::{
        ControlMessage, ControlWarning, Direction, decode_control, decode_control_with,
        decode_datagram, encode_control, encode_datagram, read_datagram, write_datagram,
    },
};
use tokio::io::AsyncWriteExt;

mod common;
use common::SETUP;

#[tokio::test]
async fn local_request_layout() {
    *SETUP;

    let bytes = encode_control(Direction::Local, 42222, 43333, &[127, 0, 0, 1]).unwrap();
    assert_eq!(bytes.len(), 21);
    assert_eq!(&bytes[..5], &[0x01, 19, 0xa9, 0x45, 0x06]);
    assert_eq!(
        &bytes[5..],
        &[0, 0x64, 0xff, 0x9b, 0, 0, 0, 0, 0, 0, 0, 0, 127, 0, 0, 1]
    );

    let decoded = decode_control(&mut &bytes[..]).await.unwrap();
    assert_eq!(
        decoded,
        ControlMessage {
            direction: Direction::Local,
            local_port: 0,
            remote_port: 43333,
            remote_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    );
}

#[tokio::test]
async fn remote_request_carries_both_ports() {
    *SETUP;

    let ip = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 7);
    let bytes = encode_control(Direction::Remote, 8080, 22, &ip.octets()).unwrap();
    assert_eq!(bytes.len(), 23);
    assert_eq!(&bytes[..7], &[0x02, 21, 0x1f, 0x90, 0, 22, 0x06]);

    let decoded = decode_control(&mut &bytes[..]).await.unwrap();
    assert_eq!(decoded.direction, Direction::Remote);
    assert_eq!(decoded.local_port, 8080);
    assert_eq!(decoded.remote_port, 22);
    assert_eq!(decoded.remote_ip, IpAddr::V6(ip));
    assert_eq!(decoded.encode(), bytes);
}

#[tokio::test]
async fn bad_ip_length_is_refused() {
    *SETUP;

    let err = encode_control(Direction::Local, 1, 2, &[1, 2, 3]).unwrap_err();
    assert!(matches!(err, Error::Config(_)), "{err:?}");
}

#[tokio::test]
async fn unknown_type_is_protocol_error() {
    *SETUP;

    let mut bytes = encode_control(Direction::Local, 0, 80, &[10, 0, 0, 1])
        .unwrap()
        .to_vec();
    bytes[0] = 0x07;
    let err = decode_control(&mut &bytes[..]).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "{err:?}");
}

#[tokio::test]
async fn wrong_length_byte_only_warns() {
    *SETUP;

    let mut bytes = encode_control(Direction::Local, 0, 80, &[10, 0, 0, 1])
        .unwrap()
        .to_vec();
    bytes[1] = 42;

    let mut warnings = Vec::new();
    let decoded = decode_control_with(&mut &bytes[..], |w| warnings.push(w))
        .await
        .unwrap();
    assert_eq!(decoded.remote_port, 80);
    assert_eq!(decoded.remote_ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
    assert_eq!(
        warnings,
        vec![ControlWarning {
            direction: Direction::Local,
            expected: 19,
            got: 42,
        }]
    );
}

#[tokio::test]
async fn truncated_control_is_incomplete() {
    *SETUP;

    let bytes = encode_control(Direction::Remote, 1, 2, &[10, 0, 0, 1]).unwrap();
    let err = decode_control(&mut &bytes[..10]).await.unwrap_err();
    assert!(matches!(err, Error::IncompleteRead { .. }), "{err:?}");
}

#[tokio::test]
async fn datagrams_stream_in_order() {
    *SETUP;

    let (mut writer, mut reader) = tokio::io::duplex(1024);
    let payloads: Vec<Vec<u8>> = vec![b"first".to_vec(), vec![0xaa; 3000], b"x".to_vec()];

    let sent = payloads.clone();
    let task = tokio::spawn(async move {
        for payload in &sent {
            write_datagram(&mut writer, payload).await.unwrap();
        }
        writer.shutdown().await.unwrap();
    });

    for payload in &payloads {
        let got = read_datagram(&mut reader).await.unwrap().unwrap();
        assert_eq!(&got[..], &payload[..]);
    }
    assert!(read_datagram(&mut reader).await.unwrap().is_none());
    task.await.unwrap();
}

#[tokio::test]
async fn empty_datagram_is_not_framed() {
    *SETUP;

    assert!(encode_datagram(b"").is_empty());

    let frame = encode_datagram(b"hello");
    assert_eq!(&frame[..], b"\0\0\0\x05hello");
    assert_eq!(&decode_datagram(&mut &frame[..]).await.unwrap()[..], b"hello");
}

#[tokio::test]
async fn empty_datagram_decodes_to_empty() {
    *SETUP;

    let frame = encode_datagram(b"");
    let got = decode_datagram(&mut &frame[..]).await.unwrap();
    assert!(got.is_empty());
}

#[tokio::test]
async fn partial_datagram_is_incomplete() {
    *SETUP;

    let frame = encode_datagram(b"hello world");

    let err = read_datagram(&mut &frame[..2]).await.unwrap_err();
    assert!(
        matches!(err, Error::IncompleteRead { expected: 4, got: 2 }),
        "{err:?}"
    );

    let err = read_datagram(&mut &frame[..8]).await.unwrap_err();
    assert!(matches!(err, Error::IncompleteRead { .. }), "{err:?}");

    let err = decode_datagram(&mut &frame[..3]).await.unwrap_err();
    assert!(
        matches!(err, Error::IncompleteRead { expected: 4, got: 3 }),
        "{err:?}"
    );
}

#[tokio::test]
async fn oversized_datagram_is_refused() {
    *SETUP;

    let prefix = u32::MAX.to_be_bytes();
    let err = read_datagram(&mut &prefix[..]).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "{err:?}");
}
