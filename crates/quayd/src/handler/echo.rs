//! Built-in handler that writes back whatever the peer sends.

use std::sync::Arc;

use camino::Utf8Path;
use quay_transport::{Session, TransportError, Wait};
use tracing::debug;

use super::{ConnectionHandler, HANDLER_TARGET, HandlerError};

const ECHO_CHUNK: usize = 16 * 1024;

/// Echoes bytes until the peer closes.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl EchoHandler {
    /// Builds the handler; `echo` takes no configuration.
    pub(crate) fn build(config: Option<&Utf8Path>) -> Result<Arc<dyn ConnectionHandler>, HandlerError> {
        match config {
            None => Ok(Arc::new(Self)),
            Some(path) => Err(HandlerError::Rejected {
                name: "echo".to_owned(),
                reason: format!("no configuration is accepted (got '{path}')"),
            }),
        }
    }
}

impl ConnectionHandler for EchoHandler {
    fn handle(&self, session: &mut Session) -> Result<(), HandlerError> {
        let mut buffer = vec![0_u8; ECHO_CHUNK];
        let mut echoed = 0_usize;
        loop {
            let count = match session.read(&mut buffer, Wait::UseDefault) {
                Ok(count) => count,
                Err(TransportError::ConnectionClosed) => break,
                Err(error) => return Err(error.into()),
            };
            let (received, _) = buffer.split_at(count);
            session.write_exact(received, Wait::UseDefault)?;
            echoed += count;
        }
        debug!(
            target: HANDLER_TARGET,
            peer = ?session.peer_addr(),
            bytes = echoed,
            "echo finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, Shutdown, TcpListener, TcpStream};
    use std::thread;

    #[test]
    fn echoes_until_the_peer_closes() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
        let addr = listener.local_addr().expect("address");
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut session = Session::accept(stream, None, None).expect("session");
            EchoHandler.handle(&mut session)
        });

        let mut client = TcpStream::connect(addr).expect("connect");
        client.write_all(b"round trip").expect("write");
        client.shutdown(Shutdown::Write).expect("half close");
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).expect("read echo");

        assert_eq!(reply, b"round trip");
        assert!(server.join().expect("join server").is_ok());
    }

    #[test]
    fn configuration_is_rejected() {
        let error = EchoHandler::build(Some(Utf8Path::new("/etc/quay/echo.toml")))
            .err()
            .expect("echo takes no configuration");
        assert!(matches!(error, HandlerError::Rejected { .. }));
    }
}
