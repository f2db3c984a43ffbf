use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use console::style;
use tungstenite::WebSocket;

type Clients = Arc<Mutex<Vec<WebSocket<TcpStream>>>>;

/// WebSocket server telling connected browsers to reload.
///
/// Clients only listen, the server never reads from them. Dropping the
/// server closes every connection.
pub struct ReloadServer {
    port: u16,
    clients: Clients,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ReloadServer {
    /// Listen on `port`, or on a free port if it's taken.
    pub fn bind(port: u16) -> std::io::Result<Self> {
        let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
            Ok(listener) => listener,
            Err(_) => TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?,
        };
        let port = listener.local_addr()?.port();

        tracing::info!(
            url = %style(format!("ws://localhost:{port}/")).yellow(),
            "starting the live-reload server"
        );

        let clients = Clients::default();
        let stop = Arc::new(AtomicBool::new(false));
        let thread = thread::spawn({
            let clients = clients.clone();
            let stop = stop.clone();
            move || accept(listener, clients, stop)
        });

        Ok(Self {
            port,
            clients,
            stop,
            thread: Some(thread),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn clients(&self) -> usize {
        self.lock().len()
    }

    /// Send `message` to every client, dropping the ones that went away.
    /// Returns how many clients got it.
    pub fn broadcast(&self, message: &str) -> usize {
        let mut clients = self.lock();
        clients.retain_mut(|socket| match socket.send(message.into()) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("dropping live-reload client: {e}");
                false
            }
        });
        clients.len()
    }

    pub fn shutdown(self) {}

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<WebSocket<TcpStream>>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ReloadServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // wake the accept loop up so it can see the flag
        let _ = TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, self.port)));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }

        for mut socket in self.lock().drain(..) {
            let _ = socket.close(None);
            let _ = socket.flush();
        }
        tracing::debug!("live-reload server stopped");
    }
}

fn accept(listener: TcpListener, clients: Clients, stop: Arc<AtomicBool>) {
    for stream in listener.incoming() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!("live-reload connection failed: {e}");
                continue;
            }
        };
        match tungstenite::accept(stream) {
            Ok(socket) => clients.lock().unwrap_or_else(|e| e.into_inner()).push(socket),
            Err(e) => tracing::debug!("live-reload handshake failed: {e}"),
        }
    }
}
