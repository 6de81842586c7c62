//! End-to-end exchange against a scripted server on loopback: the
//! sans-io session drives a real non-blocking stream through the
//! greeting, authentication and a couple of demultiplexed requests.

use std::collections::HashMap;
use std::io::{IoSliceMut, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use iproto_client::error::ResponseError;
use iproto_client::protocol::{api, codec, IncomingFrame};
use iproto_client::{Config, ConnectOptions, PlainStream, Protocol, Stream, StreamStatus};

const GREETING_SIZE: usize = 128;

fn greeting_bytes(salt: &[u8]) -> Vec<u8> {
    let mut greeting = Vec::with_capacity(GREETING_SIZE);
    greeting.extend_from_slice(b"Tarantool 2.10.0 (Binary) 0d5a-44f7");
    greeting.resize(63, b' ');
    greeting.push(b'\n');
    greeting.extend_from_slice(base64::encode(salt).as_bytes());
    greeting.resize(127, b' ');
    greeting.push(b'\n');
    greeting
}

/// Read one framed request and return its (sync, request type).
fn read_request(peer: &mut TcpStream) -> (u64, u8) {
    let mut preheader = [0u8; 5];
    peer.read_exact(&mut preheader).unwrap();
    assert_eq!(preheader[0], 0xCE);
    let len = u32::from_be_bytes([preheader[1], preheader[2], preheader[3], preheader[4]]);
    let mut payload = vec![0u8; len as usize];
    peer.read_exact(&mut payload).unwrap();

    let mut cur = std::io::Cursor::new(payload.as_slice());
    let map_len = rmp::decode::read_map_len(&mut cur).unwrap();
    let mut sync = 0u64;
    let mut rtype = 0u8;
    for _ in 0..map_len {
        match rmp::decode::read_pfix(&mut cur).unwrap() {
            0x00 => rtype = rmp::decode::read_int(&mut cur).unwrap(),
            0x01 => sync = rmp::decode::read_int(&mut cur).unwrap(),
            key => panic!("client sent an unexpected header key {}", key),
        }
    }
    (sync, rtype)
}

fn ok_response(sync: u64, data_tuples: &[(u32, &str)]) -> Vec<u8> {
    let mut payload = Vec::new();
    rmp::encode::write_map_len(&mut payload, 2).unwrap();
    rmp::encode::write_pfix(&mut payload, 0x00).unwrap();
    rmp::encode::write_uint(&mut payload, 0).unwrap();
    rmp::encode::write_pfix(&mut payload, 0x01).unwrap();
    rmp::encode::write_uint(&mut payload, sync).unwrap();
    if data_tuples.is_empty() {
        rmp::encode::write_map_len(&mut payload, 0).unwrap();
    } else {
        rmp::encode::write_map_len(&mut payload, 1).unwrap();
        rmp::encode::write_pfix(&mut payload, codec::DATA).unwrap();
        rmp::encode::write_array_len(&mut payload, data_tuples.len() as u32).unwrap();
        for (id, name) in data_tuples {
            rmp::encode::write_array_len(&mut payload, 2).unwrap();
            rmp::encode::write_uint(&mut payload, *id as u64).unwrap();
            rmp::encode::write_str(&mut payload, name).unwrap();
        }
    }
    let mut packet = Vec::new();
    rmp::encode::write_u32(&mut packet, payload.len() as u32).unwrap();
    packet.extend_from_slice(&payload);
    packet
}

/// Pump bytes both ways until the condition holds, collecting every
/// demultiplexed response along the way.
fn pump_until(
    stream: &mut PlainStream,
    conn: &mut Protocol,
    taken: &mut HashMap<u64, Result<IncomingFrame, ResponseError>>,
    mut done: impl FnMut(&Protocol, &HashMap<u64, Result<IncomingFrame, ResponseError>>) -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut chunk = [0u8; 4096];
    loop {
        while conn.ready_outgoing_len() > 0 {
            let sent = stream.send(&conn.outgoing_io_slices()).unwrap();
            if sent == 0 {
                break;
            }
            conn.advance_outgoing(sent);
        }
        while let Some(sync) = conn.process_incoming().unwrap() {
            let response = conn.take_response(sync).expect("just announced");
            taken.insert(sync.get(), response);
        }
        if done(conn, taken) {
            return;
        }
        assert!(Instant::now() < deadline, "server went quiet");

        let mut iov = [IoSliceMut::new(&mut chunk)];
        let n = stream.recv(&mut iov).unwrap();
        if n > 0 {
            conn.feed(&chunk[..n]);
        } else {
            assert!(stream.has_status(StreamStatus::NEED_READ_EVENT_FOR_READ));
            thread::sleep(Duration::from_millis(2));
        }
    }
}

#[test]
fn authenticated_select_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let salt: Vec<u8> = (0..32).map(|i| (i * 7 + 3) as u8).collect();

    let server_salt = salt.clone();
    let server = thread::spawn(move || {
        let (mut peer, _) = listener.accept().unwrap();
        peer.write_all(&greeting_bytes(&server_salt)).unwrap();

        // authentication comes first and carries no sync
        let (_, rtype) = read_request(&mut peer);
        assert_eq!(rtype, 7, "expected an auth packet");
        peer.write_all(&ok_response(0, &[])).unwrap();

        // two requests answered in reverse order
        let (first_sync, first_type) = read_request(&mut peer);
        let (second_sync, second_type) = read_request(&mut peer);
        assert_eq!(first_type, 1, "expected select");
        assert_eq!(second_type, 64, "expected ping");
        peer.write_all(&ok_response(second_sync, &[])).unwrap();
        peer.write_all(&ok_response(first_sync, &[(1, "a"), (2, "b")]))
            .unwrap();
    });

    let mut stream = PlainStream::new();
    stream
        .connect(&ConnectOptions {
            address: "127.0.0.1".into(),
            service: port.to_string(),
            ..ConnectOptions::default()
        })
        .unwrap();
    assert!(stream.has_status(StreamStatus::ESTABLISHED));

    let mut conn = Protocol::with_config(Config {
        creds: Some(("admin".into(), "".into())),
    });
    let mut taken = HashMap::new();

    pump_until(&mut stream, &mut conn, &mut taken, |conn, _| conn.is_ready());

    let select_sync = conn
        .send_request(&api::Select {
            space_id: 512,
            index_id: 0,
            limit: u32::MAX,
            offset: 0,
            iterator_type: codec::IteratorType::Eq,
            key: &(42,),
        })
        .unwrap();
    let ping_sync = conn.send_request(&api::Ping).unwrap();
    assert!(ping_sync > select_sync);

    pump_until(&mut stream, &mut conn, &mut taken, |_, taken| {
        taken.contains_key(&select_sync.get()) && taken.contains_key(&ping_sync.get())
    });

    let frame = taken
        .remove(&select_sync.get())
        .unwrap()
        .expect("select must succeed");
    let response = frame.decode().unwrap();
    assert_eq!(response.header.sync, select_sync);
    let data = response.body.data.unwrap();
    assert_eq!(data.dimension, 2);
    assert_eq!(data.tuples[0].field_count, 2);
    assert_eq!(
        data.tuples[0].data(frame.buffer()).unwrap(),
        &[0x92, 0x01, 0xA1, b'a']
    );
    assert_eq!(
        data.tuples[1].data(frame.buffer()).unwrap(),
        &[0x92, 0x02, 0xA1, b'b']
    );

    let ping_frame = taken
        .remove(&ping_sync.get())
        .unwrap()
        .expect("ping must succeed");
    let ping_response = ping_frame.decode().unwrap();
    assert!(ping_response.body.data.is_none());
    assert!(ping_response.body.error_stack.is_none());

    server.join().unwrap();
}
