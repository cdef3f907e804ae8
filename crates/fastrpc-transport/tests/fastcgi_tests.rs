//! FastCGI transport tests: record codec, responder connection, listeners.

use bytes::BytesMut;
use fastrpc_transport::record::{
    self, BeginRequest, ProtocolStatus, ROLE_RESPONDER, Record, RecordType,
};
use std::io;
use std::time::{Duration, Instant};

use fastrpc_transport::{
    Connection, DRAIN_TIMEOUT, FcgiConnection, FcgiListener, ListenAddress, Listener,
    MAX_PARAMS_LEN, TransportError,
};
use tokio::io::{AsyncRead, AsyncWriteExt, duplex};
use tokio::net::UnixStream;

const REQ: u16 = 1;

/// Encode what a web server sends for one responder request.
fn request_bytes(params: &[(&str, &str)], body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    begin(&mut buf, REQ, ROLE_RESPONDER);
    let mut pairs = BytesMut::new();
    for (name, value) in params {
        record::encode_pair(name, value, &mut pairs);
    }
    record::encode_stream(RecordType::Params, REQ, &pairs, &mut buf);
    record::encode_stream_end(RecordType::Params, REQ, &mut buf);
    record::encode_stream(RecordType::Stdin, REQ, body, &mut buf);
    record::encode_stream_end(RecordType::Stdin, REQ, &mut buf);
    buf
}

fn begin(buf: &mut BytesMut, id: u16, role: u16) {
    let body = BeginRequest { role, flags: 0 }.encode();
    Record::new(RecordType::BeginRequest, id, body.to_vec()).encode(buf);
}

async fn read_all_records<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<Record> {
    let mut records = Vec::new();
    while let Some(rec) = record::read_record(stream).await.unwrap() {
        records.push(rec);
    }
    records
}

fn stdout_of(records: &[Record]) -> Vec<u8> {
    records
        .iter()
        .filter(|r| r.record_type() == Some(RecordType::Stdout))
        .flat_map(|r| r.content.iter().copied())
        .collect()
}

fn end_status(records: &[Record]) -> Option<(u16, u8)> {
    records
        .iter()
        .find(|r| r.record_type() == Some(RecordType::EndRequest))
        .map(|r| (r.request_id, r.content[4]))
}

// ─────────────────────────────────────────────────────────────────────────────
// Record codec
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn records_are_padded_to_eight_bytes() {
    let mut buf = BytesMut::new();
    Record::new(RecordType::Stdout, 3, b"hello".to_vec()).encode(&mut buf);
    assert_eq!(buf.len(), record::HEADER_LEN + 8);
    assert_eq!(buf[6], 3, "padding length");

    let mut reader = &buf[..];
    let rec = record::read_record(&mut reader).await.unwrap().unwrap();
    assert_eq!(rec.request_id, 3);
    assert_eq!(&rec.content[..], b"hello");
    assert!(record::read_record(&mut reader).await.unwrap().is_none());
}

#[test]
fn large_streams_are_split() {
    let data = vec![7u8; record::MAX_CONTENT_LEN + 10];
    let mut buf = BytesMut::new();
    record::encode_stream(RecordType::Stdout, 1, &data, &mut buf);
    // first record: full content, no padding needed beyond 1 byte
    let first_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    assert_eq!(first_len, record::MAX_CONTENT_LEN);
}

#[test]
fn pairs_use_long_lengths_above_127_bytes() {
    let long = "x".repeat(300);
    let mut buf = BytesMut::new();
    record::encode_pair("SHORT", &long, &mut buf);
    assert_eq!(buf[0], 5);
    assert_eq!(buf[1] & 0x80, 0x80);

    let pairs = record::decode_pairs(&buf).unwrap();
    assert_eq!(pairs, vec![("SHORT".to_string(), long)]);
}

#[test]
fn truncated_pairs_are_protocol_errors() {
    let err = record::decode_pairs(&[4, 10, b'N', b'A']).unwrap_err();
    assert!(matches!(err, TransportError::Protocol(_)));
}

#[tokio::test]
async fn wrong_version_is_rejected() {
    let bytes = [2u8, 1, 0, 1, 0, 0, 0, 0];
    let err = record::read_record(&mut &bytes[..]).await.unwrap_err();
    assert!(matches!(err, TransportError::Protocol(_)));
}

// ─────────────────────────────────────────────────────────────────────────────
// Responder connection
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_request_cycle() {
    let (mut client, server) = duplex(256 * 1024);
    let mut conn = FcgiConnection::new(server);

    let body = br#"{"jsonrpc":"2.0","method":"ping","params":[],"id":"1"}"#;
    let len = body.len().to_string();
    client
        .write_all(&request_bytes(
            &[("CONTENT_LENGTH", &len), ("REMOTE_ADDR", "10.0.0.7")],
            body,
        ))
        .await
        .unwrap();

    conn.read_preamble().await.unwrap();
    assert_eq!(conn.request_id(), REQ);
    assert_eq!(conn.content_length(), Some(body.len() as i64));
    assert_eq!(conn.remote_addr(), Some("10.0.0.7"));

    let mut buf = vec![0u8; body.len()];
    assert_eq!(conn.read_body(&mut buf).await.unwrap(), body.len());
    assert_eq!(&buf, body);

    conn.write(b"Content-type: text/plain\r\n\r\n").await.unwrap();
    conn.write(b"ok").await.unwrap();
    conn.finish().await.unwrap();

    let records = read_all_records(&mut client).await;
    assert_eq!(stdout_of(&records), b"Content-type: text/plain\r\n\r\nok");
    assert_eq!(
        end_status(&records),
        Some((REQ, ProtocolStatus::RequestComplete as u8))
    );
    // empty STDOUT terminator precedes END_REQUEST
    let terminator = records
        .iter()
        .position(|r| r.record_type() == Some(RecordType::Stdout) && r.content.is_empty());
    let end = records
        .iter()
        .position(|r| r.record_type() == Some(RecordType::EndRequest));
    assert!(terminator.unwrap() < end.unwrap());
}

#[tokio::test]
async fn short_body_is_reported_as_short_read() {
    let (mut client, server) = duplex(64 * 1024);
    let mut conn = FcgiConnection::new(server);
    client
        .write_all(&request_bytes(&[("CONTENT_LENGTH", "10")], b"1234"))
        .await
        .unwrap();

    conn.read_preamble().await.unwrap();
    let mut buf = vec![0u8; 10];
    assert_eq!(conn.read_body(&mut buf).await.unwrap(), 4);
}

#[tokio::test]
async fn body_spanning_several_records_is_reassembled() {
    let (mut client, server) = duplex(64 * 1024);
    let mut conn = FcgiConnection::new(server);

    let mut buf = BytesMut::new();
    begin(&mut buf, REQ, ROLE_RESPONDER);
    record::encode_stream_end(RecordType::Params, REQ, &mut buf);
    record::encode_stream(RecordType::Stdin, REQ, b"abc", &mut buf);
    record::encode_stream(RecordType::Stdin, REQ, b"defg", &mut buf);
    record::encode_stream_end(RecordType::Stdin, REQ, &mut buf);
    client.write_all(&buf).await.unwrap();

    conn.read_preamble().await.unwrap();
    assert_eq!(conn.content_length(), None);
    let mut body = vec![0u8; 7];
    assert_eq!(conn.read_body(&mut body).await.unwrap(), 7);
    assert_eq!(&body, b"abcdefg");
}

#[tokio::test]
async fn get_values_is_answered_before_the_request() {
    let (mut client, server) = duplex(64 * 1024);
    let mut conn = FcgiConnection::new(server).with_max_conns(8);

    let mut buf = BytesMut::new();
    let mut names = BytesMut::new();
    record::encode_pair("FCGI_MAX_CONNS", "", &mut names);
    record::encode_pair("FCGI_MPXS_CONNS", "", &mut names);
    Record::new(RecordType::GetValues, 0, names.freeze()).encode(&mut buf);
    buf.extend_from_slice(&request_bytes(&[], b""));
    client.write_all(&buf).await.unwrap();

    conn.read_preamble().await.unwrap();
    conn.finish().await.unwrap();

    let records = read_all_records(&mut client).await;
    let result = records
        .iter()
        .find(|r| r.record_type() == Some(RecordType::GetValuesResult))
        .unwrap();
    let values = record::decode_pairs(&result.content).unwrap();
    assert!(values.contains(&("FCGI_MAX_CONNS".into(), "8".into())));
    assert!(values.contains(&("FCGI_MPXS_CONNS".into(), "0".into())));
}

#[tokio::test]
async fn unknown_management_type_gets_unknown_type_reply() {
    let (mut client, server) = duplex(64 * 1024);
    let mut conn = FcgiConnection::new(server);

    let mut buf = BytesMut::new();
    Record {
        kind: 42,
        request_id: 0,
        content: Default::default(),
    }
    .encode(&mut buf);
    buf.extend_from_slice(&request_bytes(&[], b""));
    client.write_all(&buf).await.unwrap();

    conn.read_preamble().await.unwrap();
    conn.finish().await.unwrap();

    let records = read_all_records(&mut client).await;
    let reply = records
        .iter()
        .find(|r| r.record_type() == Some(RecordType::UnknownType))
        .unwrap();
    assert_eq!(reply.content[0], 42);
}

#[tokio::test]
async fn non_responder_role_is_refused() {
    let (mut client, server) = duplex(64 * 1024);
    let mut conn = FcgiConnection::new(server);

    let mut buf = BytesMut::new();
    begin(&mut buf, REQ, 2);
    client.write_all(&buf).await.unwrap();

    let err = conn.read_preamble().await.unwrap_err();
    assert!(matches!(err, TransportError::UnsupportedRole(2)));
    conn.finish().await.unwrap();

    let records = read_all_records(&mut client).await;
    assert_eq!(
        end_status(&records),
        Some((REQ, ProtocolStatus::UnknownRole as u8))
    );
    // no REQUEST_COMPLETE after the refusal
    let ends = records
        .iter()
        .filter(|r| r.record_type() == Some(RecordType::EndRequest))
        .count();
    assert_eq!(ends, 1);
}

#[tokio::test]
async fn multiplexed_request_is_refused() {
    let (mut client, server) = duplex(64 * 1024);
    let mut conn = FcgiConnection::new(server);

    let mut buf = BytesMut::new();
    begin(&mut buf, REQ, ROLE_RESPONDER);
    begin(&mut buf, 2, ROLE_RESPONDER);
    record::encode_stream_end(RecordType::Params, REQ, &mut buf);
    client.write_all(&buf).await.unwrap();

    conn.read_preamble().await.unwrap();
    conn.finish().await.unwrap();

    let records = read_all_records(&mut client).await;
    let refused = records
        .iter()
        .find(|r| r.record_type() == Some(RecordType::EndRequest) && r.request_id == 2)
        .unwrap();
    assert_eq!(refused.content[4], ProtocolStatus::CantMpxConn as u8);
}

#[tokio::test]
async fn oversized_params_stream_is_a_protocol_error() {
    let (mut client, server) = duplex(256 * 1024);
    let mut conn = FcgiConnection::new(server);

    let mut buf = BytesMut::new();
    begin(&mut buf, REQ, ROLE_RESPONDER);
    let mut pairs = BytesMut::new();
    record::encode_pair("HTTP_X_FILLER", &"f".repeat(MAX_PARAMS_LEN), &mut pairs);
    record::encode_stream(RecordType::Params, REQ, &pairs, &mut buf);
    record::encode_stream_end(RecordType::Params, REQ, &mut buf);
    client.write_all(&buf).await.unwrap();

    let err = conn.read_preamble().await.unwrap_err();
    assert!(matches!(err, TransportError::Protocol(_)), "{err}");
}

#[tokio::test]
async fn params_up_to_the_cap_are_accepted() {
    let (mut client, server) = duplex(256 * 1024);
    let mut conn = FcgiConnection::new(server);

    let value = "v".repeat(MAX_PARAMS_LEN / 2);
    client
        .write_all(&request_bytes(&[("HTTP_X_FILLER", &value)], b""))
        .await
        .unwrap();

    conn.read_preamble().await.unwrap();
    assert_eq!(conn.param("HTTP_X_FILLER").map(str::len), Some(value.len()));
}

#[tokio::test]
async fn closed_stream_before_begin_is_closed_error() {
    let (client, server) = duplex(1024);
    drop(client);
    let mut conn = FcgiConnection::new(server);
    assert!(matches!(
        conn.read_preamble().await.unwrap_err(),
        TransportError::Closed
    ));
}

// ─────────────────────────────────────────────────────────────────────────────
// Listener
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn listen_address_parsing() {
    assert_eq!(
        ":9000".parse::<ListenAddress>().unwrap(),
        ListenAddress::Tcp("0.0.0.0:9000".parse().unwrap())
    );
    assert_eq!(
        "127.0.0.1:9001".parse::<ListenAddress>().unwrap(),
        ListenAddress::Tcp("127.0.0.1:9001".parse().unwrap())
    );
    assert_eq!(
        "/run/fastrpc.sock".parse::<ListenAddress>().unwrap(),
        ListenAddress::Unix("/run/fastrpc.sock".into())
    );
    assert_eq!(
        "fastrpc.sock".parse::<ListenAddress>().unwrap(),
        ListenAddress::Unix("fastrpc.sock".into())
    );
}

#[tokio::test]
async fn unix_listener_replaces_stale_socket_and_accepts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fcgi.sock");
    // a std listener leaves its socket file behind when dropped
    drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
    assert!(path.exists());

    let mut listener = FcgiListener::bind(&ListenAddress::Unix(path.clone())).unwrap();

    let client = tokio::spawn({
        let path = path.clone();
        async move {
            let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
            stream
                .write_all(&request_bytes(&[("CONTENT_LENGTH", "2")], b"{}"))
                .await
                .unwrap();
            stream
        }
    });

    let mut conn = listener.accept().await.unwrap();
    conn.read_preamble().await.unwrap();
    assert_eq!(conn.content_length(), Some(2));
    let _stream = client.await.unwrap();
}

#[test]
fn unix_listener_refuses_a_path_that_is_not_a_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fcgi.sock");
    std::fs::write(&path, b"keep me").unwrap();

    let err = FcgiListener::bind(&ListenAddress::Unix(path.clone()))
        .err()
        .expect("bind over a regular file");
    assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
}

#[tokio::test]
async fn unix_listener_refuses_a_socket_in_use() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fcgi.sock");
    let address = ListenAddress::Unix(path.clone());
    let first = FcgiListener::bind(&address).unwrap();

    let err = FcgiListener::bind(&address)
        .err()
        .expect("second bind on a live socket");
    assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    assert!(path.exists(), "live socket file must stay");

    drop(first);
    assert!(!path.exists(), "listener removes its socket file on drop");
}

// ─────────────────────────────────────────────────────────────────────────────
// Unread input on a Unix socket
// ─────────────────────────────────────────────────────────────────────────────

/// Read every record the server sends, failing on a connection reset.
async fn read_until_eof(stream: &mut UnixStream) -> io::Result<Vec<Record>> {
    let mut records = Vec::new();
    loop {
        match record::read_record(stream).await {
            Ok(Some(rec)) => records.push(rec),
            Ok(None) => return Ok(records),
            Err(TransportError::Io(e)) => return Err(e),
            Err(e) => panic!("unexpected record error: {e}"),
        }
    }
}

#[tokio::test]
async fn response_survives_unread_stdin_terminator() {
    let (mut client, server) = UnixStream::pair().unwrap();
    let mut conn = FcgiConnection::new(server);

    let body = br#"{"jsonrpc":"2.0","method":"ping","params":[],"id":"1"}"#;
    let len = body.len().to_string();
    client
        .write_all(&request_bytes(&[("CONTENT_LENGTH", &len)], body))
        .await
        .unwrap();

    conn.read_preamble().await.unwrap();
    let mut buf = vec![0u8; body.len()];
    assert_eq!(conn.read_body(&mut buf).await.unwrap(), body.len());
    conn.write(b"Content-type: application/json\r\n\r\n{}").await.unwrap();
    conn.finish().await.unwrap();

    let records = read_until_eof(&mut client).await.expect("connection reset");
    assert_eq!(
        stdout_of(&records),
        b"Content-type: application/json\r\n\r\n{}"
    );
    assert_eq!(
        end_status(&records),
        Some((REQ, ProtocolStatus::RequestComplete as u8))
    );
}

#[tokio::test]
async fn response_survives_an_unread_body() {
    let (client, server) = UnixStream::pair().unwrap();
    let (mut reader, mut writer) = client.into_split();
    let body = vec![b'x'; 512 * 1024];
    let request = request_bytes(&[("CONTENT_LENGTH", &body.len().to_string())], &body);
    let sender = tokio::spawn(async move {
        writer.write_all(&request).await.unwrap();
        writer
    });

    let mut conn = FcgiConnection::new(server);
    conn.read_preamble().await.unwrap();
    conn.write(b"Status: 413\r\n\r\n").await.unwrap();
    conn.finish().await.unwrap();

    let _writer = sender.await.unwrap();
    let mut records = Vec::new();
    while let Some(rec) = record::read_record(&mut reader).await.expect("connection reset") {
        records.push(rec);
    }
    assert_eq!(stdout_of(&records), b"Status: 413\r\n\r\n");
    assert_eq!(
        end_status(&records),
        Some((REQ, ProtocolStatus::RequestComplete as u8))
    );
}

#[tokio::test]
async fn drain_gives_up_when_stdin_never_ends() {
    let (mut client, server) = UnixStream::pair().unwrap();
    let mut conn = FcgiConnection::new(server);

    let mut buf = BytesMut::new();
    begin(&mut buf, REQ, ROLE_RESPONDER);
    record::encode_stream_end(RecordType::Params, REQ, &mut buf);
    record::encode_stream(RecordType::Stdin, REQ, b"partial", &mut buf);
    client.write_all(&buf).await.unwrap();

    conn.read_preamble().await.unwrap();
    let started = Instant::now();
    conn.finish().await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= DRAIN_TIMEOUT, "{elapsed:?}");
    assert!(elapsed < DRAIN_TIMEOUT + Duration::from_secs(2), "{elapsed:?}");

    let records = read_until_eof(&mut client).await.unwrap();
    assert_eq!(
        end_status(&records),
        Some((REQ, ProtocolStatus::RequestComplete as u8))
    );
}
