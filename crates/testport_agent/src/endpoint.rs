use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::panic::{self, AssertUnwindSafe};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use testport_core::{decode_request, encode_line, AgentResponse, ErrorCode, UNKNOWN_REQUEST_ID};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dispatch::RequestDispatcher;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("failed to create socket directory {path}: {source}")]
    CreateSocketDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to delete stale socket {path}: {source}")]
    RemoveStaleSocket {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind agent socket {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to start agent accept thread: {0}")]
    SpawnThread(#[source] io::Error),
}

type ConnectionTable = Arc<Mutex<HashMap<u64, UnixStream>>>;

/// Unix socket server that answers one response line per request line.
pub struct AgentEndpoint {
    socket_path: PathBuf,
    running: Arc<AtomicBool>,
    connections: ConnectionTable,
    accept_thread: Option<JoinHandle<()>>,
}

impl AgentEndpoint {
    pub fn bind(socket_path: &Path, dispatcher: RequestDispatcher) -> Result<Self, EndpointError> {
        if let Some(parent) = socket_path.parent() {
            fs::create_dir_all(parent).map_err(|source| EndpointError::CreateSocketDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        match fs::remove_file(socket_path) {
            Ok(()) => debug!(path = %socket_path.display(), "agent_stale_socket_removed"),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(EndpointError::RemoveStaleSocket {
                    path: socket_path.to_path_buf(),
                    source,
                })
            }
        }

        let listener = UnixListener::bind(socket_path).map_err(|source| EndpointError::Bind {
            path: socket_path.to_path_buf(),
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| EndpointError::Bind {
                path: socket_path.to_path_buf(),
                source,
            })?;

        let running = Arc::new(AtomicBool::new(true));
        let connections: ConnectionTable = Arc::default();
        let accept_thread = {
            let running = Arc::clone(&running);
            let connections = Arc::clone(&connections);
            thread::Builder::new()
                .name("testport-agent-accept".to_string())
                .spawn(move || accept_loop(listener, dispatcher, running, connections))
                .map_err(EndpointError::SpawnThread)?
        };

        info!(path = %socket_path.display(), "agent_endpoint_bound");
        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            running,
            connections,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn connection_count(&self) -> usize {
        lock_connections(&self.connections).len()
    }

    /// Stops accepting, hangs up live connections and deletes the socket file.
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(accept_thread) = self.accept_thread.take() {
            if accept_thread.join().is_err() {
                warn!("agent_accept_thread_panicked");
            }
        }
        for (_, stream) in lock_connections(&self.connections).drain() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        match fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => {
                warn!(path = %self.socket_path.display(), error = %error, "agent_socket_delete_failed")
            }
        }
        info!(path = %self.socket_path.display(), "agent_endpoint_stopped");
    }
}

impl Drop for AgentEndpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock_connections(connections: &ConnectionTable) -> MutexGuard<'_, HashMap<u64, UnixStream>> {
    match connections.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn accept_loop(
    listener: UnixListener,
    dispatcher: RequestDispatcher,
    running: Arc<AtomicBool>,
    connections: ConnectionTable,
) {
    let next_id = AtomicU64::new(1);
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                if let Err(error) = start_connection(id, stream, &dispatcher, &connections) {
                    warn!(connection = id, error = %error, "agent_connection_setup_failed");
                }
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(error) => {
                warn!(error = %error, "agent_accept_failed");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

fn start_connection(
    id: u64,
    stream: UnixStream,
    dispatcher: &RequestDispatcher,
    connections: &ConnectionTable,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    let tracked = stream.try_clone()?;
    lock_connections(connections).insert(id, tracked);

    let dispatcher = dispatcher.clone();
    let thread_connections = Arc::clone(connections);
    let spawned = thread::Builder::new()
        .name(format!("testport-agent-conn-{id}"))
        .spawn(move || {
            debug!(connection = id, "agent_connection_opened");
            if let Err(error) = serve_connection(stream, &dispatcher) {
                debug!(connection = id, error = %error, "agent_connection_error");
            }
            lock_connections(&thread_connections).remove(&id);
            debug!(connection = id, "agent_connection_closed");
        });
    if let Err(error) = spawned {
        lock_connections(connections).remove(&id);
        return Err(error);
    }
    Ok(())
}

fn serve_connection(stream: UnixStream, dispatcher: &RequestDispatcher) -> io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        if reader.read_until(b'\n', &mut buffer)? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buffer);
        if line.trim().is_empty() {
            continue;
        }
        let response = guarded_response(&line, |line| dispatcher.handle_line(line));
        let encoded = encode_line(&response).map_err(io::Error::other)?;
        writer.write_all(encoded.as_bytes())?;
        writer.flush()?;
    }
}

/// A panicking handler still answers, so the connection stays usable.
fn guarded_response<F>(line: &str, handle: F) -> AgentResponse
where
    F: FnOnce(&str) -> AgentResponse,
{
    match panic::catch_unwind(AssertUnwindSafe(|| handle(line))) {
        Ok(response) => response,
        Err(_) => {
            let request_id = decode_request(line)
                .map(|request| request.request_id)
                .unwrap_or_else(|_| UNKNOWN_REQUEST_ID.to_string());
            warn!(request_id = %request_id, "agent_request_panicked");
            AgentResponse::error(request_id, ErrorCode::RequestFailed, "Request handler panicked.")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tempfile::TempDir;
    use testport_core::{decode_response, PROTOCOL_VERSION};

    use super::*;
    use crate::config::AgentConfig;
    use crate::main_thread::{main_thread_channel, TickClock};
    use crate::state::AgentState;

    fn dispatcher(socket_path: &Path) -> RequestDispatcher {
        let (handle, _queue) = main_thread_channel::<AgentState>();
        let config = AgentConfig {
            socket_path: socket_path.to_path_buf(),
            auth_token: "secret".to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            expected_agent_sha256: None,
            sync_timeout: Duration::from_millis(50),
        };
        RequestDispatcher::new(config, handle, TickClock::default(), "test".to_string())
    }

    fn exchange(stream: &mut UnixStream, reader: &mut BufReader<UnixStream>, line: &str) -> String {
        stream.write_all(line.as_bytes()).expect("write request");
        stream.flush().expect("flush");
        let mut response = String::new();
        reader.read_line(&mut response).expect("read response");
        response
    }

    #[test]
    fn replaces_stale_socket_and_answers_in_order() {
        let temp = TempDir::new().expect("tempdir");
        let socket_path = temp.path().join("run").join("agent.sock");
        fs::create_dir_all(socket_path.parent().expect("parent")).expect("mkdir");
        fs::write(&socket_path, b"stale").expect("stale file");

        let mut endpoint = AgentEndpoint::bind(&socket_path, dispatcher(&socket_path)).expect("bind");
        let mut stream = UnixStream::connect(&socket_path).expect("connect");
        let mut reader = BufReader::new(stream.try_clone().expect("clone"));

        let first = exchange(
            &mut stream,
            &mut reader,
            "{\"requestId\":\"1\",\"action\":\"GET_SERVER_TICK\"}\n",
        );
        let second = exchange(&mut stream, &mut reader, "garbage\r\n");
        let third = exchange(
            &mut stream,
            &mut reader,
            "{\"requestId\":\"3\",\"action\":\"HANDSHAKE\",\"arguments\":{\"token\":\"bad\"}}\n",
        );

        let first = decode_response(&first).expect("first");
        assert_eq!(first.request_id, "1");
        assert_eq!(first.data_value("tick"), Some("0"));
        let second = decode_response(&second).expect("second");
        assert_eq!(second.request_id, "unknown");
        assert_eq!(second.error_code.as_deref(), Some("INVALID_REQUEST"));
        let third = decode_response(&third).expect("third");
        assert_eq!(third.error_code.as_deref(), Some("AUTH_FAILED"));

        endpoint.shutdown();
        assert!(!socket_path.exists());
        let mut tail = String::new();
        let read = reader.read_line(&mut tail).expect("read after shutdown");
        assert_eq!(read, 0);
    }

    #[test]
    fn connection_table_shrinks_when_clients_leave() {
        let temp = TempDir::new().expect("tempdir");
        let socket_path = temp.path().join("agent.sock");
        let endpoint = AgentEndpoint::bind(&socket_path, dispatcher(&socket_path)).expect("bind");

        let stream = UnixStream::connect(&socket_path).expect("connect");
        let deadline = Instant::now() + Duration::from_secs(2);
        while endpoint.connection_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(endpoint.connection_count(), 1);

        drop(stream);
        while endpoint.connection_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(endpoint.connection_count(), 0);
        drop(endpoint);
        assert!(!socket_path.exists());
    }

    #[test]
    fn panicking_handler_becomes_request_failed() {
        let line = r#"{"requestId":"9","action":"GET_SERVER_TICK","arguments":{}}"#;
        let response = guarded_response(line, |_| panic!("handler blew up"));
        assert_eq!(response.request_id, "9");
        assert!(!response.success);
        assert_eq!(response.error_code.as_deref(), Some("REQUEST_FAILED"));

        let garbage = guarded_response("{not json", |_| panic!("handler blew up"));
        assert_eq!(garbage.request_id, UNKNOWN_REQUEST_ID);
        assert_eq!(garbage.error_code.as_deref(), Some("REQUEST_FAILED"));

        let answered = guarded_response(line, |_| AgentResponse::ok("9", Default::default()));
        assert!(answered.success);
    }
}
