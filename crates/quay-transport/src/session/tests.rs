//! Session behaviour over loopback TCP, plaintext and secure.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV6, TcpListener};
use std::os::fd::AsRawFd;
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use rstest::{fixture, rstest};

use super::*;
use crate::test_support::TestCertificates;

const PATIENCE: Wait = Wait::Bounded(Duration::from_secs(5));

struct Loopback {
    listener: TcpListener,
    port: u16,
}

#[fixture]
fn loopback() -> Loopback {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind loopback");
    let port = listener.local_addr().expect("local address").port();
    Loopback { listener, port }
}

/// Accepts one plaintext session and hands back the raw client socket.
fn plaintext_pair(loopback: &Loopback) -> (Session, TcpStream) {
    let client = TcpStream::connect((Ipv4Addr::LOCALHOST, loopback.port)).expect("connect");
    let (accepted, _) = loopback.listener.accept().expect("accept");
    let session = Session::accept(accepted, None, None).expect("plaintext session");
    (session, client)
}

#[rstest]
fn read_exact_accumulates_partial_deliveries(loopback: Loopback) {
    let (mut session, mut client) = plaintext_pair(&loopback);
    let writer = thread::spawn(move || {
        for piece in [&b"abc"[..], b"defg", b"hij"] {
            client.write_all(piece).expect("client writes");
            thread::sleep(Duration::from_millis(30));
        }
        client
    });

    let mut record = [0_u8; 10];
    let count = session.read_exact(&mut record, PATIENCE).expect("full record");
    assert_eq!(count, 10);
    assert_eq!(&record, b"abcdefghij");
    drop(writer.join().expect("join writer"));
}

#[rstest]
fn bounded_read_times_out_on_an_idle_peer(loopback: Loopback) {
    let (mut session, _client) = plaintext_pair(&loopback);
    let bound = Duration::from_millis(150);
    let started = Instant::now();
    let error = session
        .read(&mut [0_u8; 8], Wait::Bounded(bound))
        .expect_err("peer is silent");
    let elapsed = started.elapsed();
    assert!(error.is_timeout(), "expected timeout, got {error}");
    assert!(elapsed >= bound, "returned early after {elapsed:?}");
    assert!(elapsed < bound + Duration::from_secs(1), "overshot: {elapsed:?}");
}

#[rstest]
fn zero_wait_returns_immediately(loopback: Loopback) {
    let (mut session, _client) = plaintext_pair(&loopback);
    let started = Instant::now();
    let error = session
        .read(&mut [0_u8; 8], Wait::IMMEDIATE)
        .expect_err("nothing buffered");
    assert!(error.is_timeout());
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[rstest]
fn clean_peer_close_is_reported(loopback: Loopback) {
    let (mut session, client) = plaintext_pair(&loopback);
    drop(client);
    let error = session
        .read(&mut [0_u8; 8], PATIENCE)
        .expect_err("peer closed");
    assert!(error.is_closed(), "expected closed, got {error}");
}

/// Makes closing `stream` abort the connection with a reset.
fn reset_on_close(stream: &TcpStream) {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    let length =
        libc::socklen_t::try_from(std::mem::size_of::<libc::linger>()).expect("linger size");
    // SAFETY: the option value is a live `linger` of the stated length.
    let status = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            std::ptr::from_ref(&linger).cast(),
            length,
        )
    };
    assert_eq!(status, 0, "SO_LINGER: {}", std::io::Error::last_os_error());
}

#[rstest]
fn reset_peer_is_a_system_error(loopback: Loopback) {
    let (mut session, client) = plaintext_pair(&loopback);
    reset_on_close(&client);
    drop(client);
    let error = session
        .read(&mut [0_u8; 8], PATIENCE)
        .expect_err("peer reset the connection");
    assert!(
        matches!(
            error,
            TransportError::System {
                operation: Operation::Read,
                ..
            }
        ),
        "expected a system error, got {error}"
    );
}

#[rstest]
fn closing_twice_is_an_invalid_state(loopback: Loopback) {
    let (mut session, _client) = plaintext_pair(&loopback);
    session.close().expect("first close");
    assert!(!session.is_open());
    assert!(matches!(
        session.close(),
        Err(TransportError::InvalidState(_))
    ));
    assert!(matches!(
        session.read(&mut [0_u8; 1], Wait::IMMEDIATE),
        Err(TransportError::InvalidState(_))
    ));
}

#[rstest]
fn write_exact_outlasts_a_slow_reader(loopback: Loopback) {
    let (mut session, mut client) = plaintext_pair(&loopback);
    let payload: Vec<u8> = (0..=250_u8).cycle().take(4 * 1024 * 1024).collect();
    let expected = payload.clone();
    let reader = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        let mut received = vec![0_u8; expected.len()];
        client.read_exact(&mut received).expect("client reads");
        received == expected
    });

    let sent = session.write_exact(&payload, PATIENCE).expect("full write");
    assert_eq!(sent, payload.len());
    assert!(reader.join().expect("join reader"), "payload corrupted");
}

#[rstest]
fn configured_defaults_apply_to_use_default(loopback: Loopback) {
    let client = TcpStream::connect((Ipv4Addr::LOCALHOST, loopback.port)).expect("connect");
    let (accepted, _) = loopback.listener.accept().expect("accept");
    let config = SessionConfig {
        timeouts: SessionTimeouts {
            read: Some(Duration::from_millis(100)),
            ..SessionTimeouts::default()
        },
        secure: None,
    };
    let mut session = Session::accept(accepted, None, Some(&config)).expect("session");
    let error = session
        .read(&mut [0_u8; 4], Wait::UseDefault)
        .expect_err("peer is silent");
    assert!(error.is_timeout());
    assert_eq!(session.timeouts().write, Some(Duration::from_secs(20)));
    drop(client);
}

#[test]
fn negative_seconds_are_unbounded() {
    assert_eq!(SessionTimeouts::from_seconds(-1, -5, 3), SessionTimeouts {
        read: None,
        write: None,
        connect: Some(Duration::from_secs(3)),
    });
}

#[test]
fn mapped_peer_addresses_are_shown_as_ipv4() {
    let mapped = SocketAddr::V6(SocketAddrV6::new(
        Ipv4Addr::LOCALHOST.to_ipv6_mapped(),
        4242,
        0,
        0,
    ));
    assert_eq!(
        canonical_peer(mapped),
        SocketAddr::from((Ipv4Addr::LOCALHOST, 4242))
    );
}

#[rstest]
fn plaintext_connect_reaches_the_listener(loopback: Loopback) {
    let port = loopback.port;
    let server = thread::spawn(move || {
        let (accepted, _) = loopback.listener.accept().expect("accept");
        let mut session = Session::accept(accepted, None, None).expect("server session");
        let mut greeting = [0_u8; 5];
        session.read_exact(&mut greeting, PATIENCE).expect("greeting");
        greeting
    });
    let mut client = Session::connect("localhost", port, None, Some(&SessionConfig::default()))
        .expect("client session");
    assert!(!client.is_secure());
    client.write_exact(b"hello", PATIENCE).expect("send greeting");
    assert_eq!(&server.join().expect("join server"), b"hello");
}

fn secure_server(
    loopback: Loopback,
    environment: Arc<Environment>,
) -> thread::JoinHandle<Result<Vec<u8>, TransportError>> {
    thread::spawn(move || {
        let (accepted, _) = loopback.listener.accept().expect("accept");
        let config = SessionConfig::default();
        let mut session = Session::accept(accepted, Some(environment), Some(&config))?;
        assert!(session.is_secure());
        let mut received = Vec::new();
        let mut chunk = [0_u8; 4096];
        loop {
            match session.read(&mut chunk, PATIENCE) {
                Ok(count) => {
                    let (data, _) = chunk.split_at(count);
                    received.extend_from_slice(data);
                    session.write_exact(data, PATIENCE)?;
                }
                Err(TransportError::ConnectionClosed) => break,
                Err(other) => return Err(other),
            }
        }
        session.close()?;
        Ok(received)
    })
}

#[rstest]
fn secure_sessions_echo_across_record_boundaries(loopback: Loopback) {
    let certs = TestCertificates::generate().expect("test certificates");
    let environment =
        Arc::new(Environment::open(Some(&certs.acceptor_config())).expect("acceptor environment"));
    let port = loopback.port;
    let server = secure_server(loopback, Arc::clone(&environment));

    let config = SessionConfig {
        secure: Some(certs.initiator_config()),
        ..SessionConfig::default()
    };
    let mut client = Session::connect("localhost", port, None, Some(&config)).expect("client");
    assert!(client.is_secure());

    let payload: Vec<u8> = (0..=238_u8).cycle().take(40_000).collect();
    client.write_exact(&payload, PATIENCE).expect("secure write");
    let mut echoed = vec![0_u8; payload.len()];
    client.read_exact(&mut echoed, PATIENCE).expect("secure read");
    assert_eq!(echoed, payload);
    client.close().expect("close client");

    let received = server.join().expect("join server").expect("server session");
    assert_eq!(received, payload);
    Environment::close(environment).expect("last reference");
}

#[rstest]
fn untrusted_server_fails_the_handshake(loopback: Loopback) {
    let certs = TestCertificates::generate().expect("test certificates");
    let environment =
        Arc::new(Environment::open(Some(&certs.acceptor_config())).expect("acceptor environment"));
    let port = loopback.port;
    let server = secure_server(loopback, environment);

    let config = SessionConfig {
        secure: Some(SecureConfig::initiator()),
        ..SessionConfig::default()
    };
    let error = Session::connect("localhost", port, None, Some(&config))
        .expect_err("self-signed certificate is not trusted");
    assert!(
        matches!(error, TransportError::Tls { .. }),
        "expected TLS failure, got {error}"
    );
    assert!(server.join().expect("join server").is_err());
}

#[rstest]
fn disabling_validation_accepts_any_server(loopback: Loopback) {
    let certs = TestCertificates::generate().expect("test certificates");
    let environment =
        Arc::new(Environment::open(Some(&certs.acceptor_config())).expect("acceptor environment"));
    let port = loopback.port;
    let server = secure_server(loopback, environment);

    let config = SessionConfig {
        secure: Some(SecureConfig::initiator().with_validate_peer(false)),
        ..SessionConfig::default()
    };
    let mut client = Session::connect("localhost", port, None, Some(&config)).expect("client");
    client.write_exact(b"ping", PATIENCE).expect("write");
    let mut reply = [0_u8; 4];
    client.read_exact(&mut reply, PATIENCE).expect("read");
    assert_eq!(&reply, b"ping");
    drop(client);
    assert_eq!(server.join().expect("join server").expect("server"), b"ping");
}

#[rstest]
fn acceptor_environment_cannot_initiate(loopback: Loopback) {
    let certs = TestCertificates::generate().expect("test certificates");
    let environment =
        Arc::new(Environment::open(Some(&certs.acceptor_config())).expect("acceptor environment"));
    let error = Session::connect("127.0.0.1", loopback.port, Some(environment), None)
        .expect_err("wrong role");
    assert!(matches!(
        error,
        TransportError::Config(ConfigError::RoleMismatch { .. })
    ));
}

#[rstest]
fn timed_out_secure_writes_report_what_was_committed(loopback: Loopback) {
    let certs = TestCertificates::generate().expect("test certificates");
    let environment =
        Arc::new(Environment::open(Some(&certs.acceptor_config())).expect("acceptor environment"));
    let port = loopback.port;
    let (start_reading, reading) = mpsc::channel::<()>();
    let server = thread::spawn(move || -> Result<Vec<u8>, TransportError> {
        let (accepted, _) = loopback.listener.accept().expect("accept");
        let config = SessionConfig::default();
        let mut session = Session::accept(accepted, Some(environment), Some(&config))?;
        reading.recv().expect("reader released");
        let mut received = Vec::new();
        let mut chunk = [0_u8; 16 * 1024];
        loop {
            match session.read(&mut chunk, PATIENCE) {
                Ok(count) => {
                    let (data, _) = chunk.split_at(count);
                    received.extend_from_slice(data);
                }
                Err(TransportError::ConnectionClosed) => break,
                Err(other) => return Err(other),
            }
        }
        Ok(received)
    });

    let config = SessionConfig {
        secure: Some(certs.initiator_config()),
        ..SessionConfig::default()
    };
    let mut client = Session::connect("localhost", port, None, Some(&config)).expect("client");
    let payload: Vec<u8> = (0..=250_u8).cycle().take(32 * 1024 * 1024).collect();
    let piece = 16 * 1024;
    let mut reported = 0;
    let mut timed_out = false;
    while reported < payload.len() {
        let (_, rest) = payload.split_at(reported);
        match client.write(capped_ref(rest, piece), Wait::Bounded(Duration::from_millis(200))) {
            Ok(count) => reported += count,
            Err(error) if error.is_timeout() => {
                timed_out = true;
                break;
            }
            Err(error) => panic!("unexpected write failure: {error}"),
        }
    }
    assert!(timed_out, "an unread peer never applied back-pressure");

    start_reading.send(()).expect("release reader");
    let (_, rest) = payload.split_at(reported);
    reported += client
        .write_exact(capped_ref(rest, piece), PATIENCE)
        .expect("retried write");
    client.close().expect("close client");

    let received = server.join().expect("join server").expect("server session");
    assert_eq!(received.len(), reported, "peer and writer disagree");
    assert!(payload.starts_with(&received), "stream corrupted");
}
