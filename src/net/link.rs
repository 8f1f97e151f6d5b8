//! TCP point-to-point link.
//!
//! Each process listens on its own address. Every inbound connection gets a
//! reader thread that forwards newline-framed bodies to a single inbox. Every
//! peer gets one writer thread owning one outbound connection, so bodies to a
//! given destination leave in send order. Bodies addressed to ourselves skip
//! the socket and go straight to the inbox.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use super::Transport;

/// Delay between connection attempts to a peer that is not up yet.
pub const CONNECT_RETRY: Duration = Duration::from_millis(200);

/// Outbound side of the TCP link.
pub struct TcpLink {
    node_id: u32,
    process_count: u32,
    /// One queue per peer, drained by that peer's writer thread.
    outbound: HashMap<u32, Sender<String>>,
    /// Loopback into our own inbox.
    inbox_tx: Sender<String>,
}

impl TcpLink {
    /// Bind our address and start the reader and writer threads.
    ///
    /// `addresses` lists every process in id order. Returns the link and the
    /// receiver of all inbound bodies.
    pub fn start(node_id: u32, addresses: &[String]) -> io::Result<(TcpLink, Receiver<String>)> {
        let own = addresses.get(node_id as usize).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no address for node {}", node_id),
            )
        })?;

        let listener = TcpListener::bind(own)?;
        info!(target: "dimex::net", node = node_id, addr = %own, "Listening");

        let (inbox_tx, inbox_rx) = unbounded();

        {
            let inbox_tx = inbox_tx.clone();
            thread::Builder::new()
                .name(format!("dimex-accept-{}", node_id))
                .spawn(move || accept_loop(node_id, listener, inbox_tx))?;
        }

        let mut outbound = HashMap::new();
        for (peer, addr) in addresses.iter().enumerate() {
            let peer = peer as u32;
            if peer == node_id {
                continue;
            }
            let (tx, rx) = unbounded::<String>();
            let addr = addr.clone();
            thread::Builder::new()
                .name(format!("dimex-send-{}-{}", node_id, peer))
                .spawn(move || writer_loop(node_id, peer, addr, rx))?;
            outbound.insert(peer, tx);
        }

        let link = TcpLink {
            node_id,
            process_count: addresses.len() as u32,
            outbound,
            inbox_tx,
        };
        Ok((link, inbox_rx))
    }
}

impl Transport for TcpLink {
    fn self_id(&self) -> u32 {
        self.node_id
    }

    fn process_count(&self) -> u32 {
        self.process_count
    }

    fn send_to(&self, target_id: u32, body: String) -> bool {
        if target_id == self.node_id {
            return self.inbox_tx.send(body).is_ok();
        }
        match self.outbound.get(&target_id) {
            Some(tx) => tx.send(body).is_ok(),
            None => false,
        }
    }
}

fn accept_loop(node_id: u32, listener: TcpListener, inbox_tx: Sender<String>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let inbox_tx = inbox_tx.clone();
                let peer_addr = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "?".to_string());
                debug!(target: "dimex::net", node = node_id, peer = %peer_addr, "Accepted connection");
                let spawned = thread::Builder::new()
                    .name(format!("dimex-recv-{}", node_id))
                    .spawn(move || reader_loop(node_id, stream, peer_addr, inbox_tx));
                if let Err(e) = spawned {
                    warn!(target: "dimex::net", node = node_id, error = %e, "Failed to spawn reader");
                }
            }
            Err(e) => {
                warn!(target: "dimex::net", node = node_id, error = %e, "Accept failed");
            }
        }
    }
}

fn reader_loop(node_id: u32, stream: TcpStream, peer_addr: String, inbox_tx: Sender<String>) {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => {
                debug!(target: "dimex::net", node = node_id, peer = %peer_addr, "Connection closed");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(target: "dimex::net", node = node_id, peer = %peer_addr, error = %e, "Connection closed");
                return;
            }
        }

        let body = match String::from_utf8(std::mem::take(&mut line)) {
            Ok(body) => body,
            Err(e) => {
                warn!(target: "dimex::net", node = node_id, peer = %peer_addr, error = %e, "Discarding non-UTF-8 body");
                continue;
            }
        };
        let body = body.trim_end_matches(['\r', '\n']);
        if body.is_empty() {
            continue;
        }
        if inbox_tx.send(body.to_string()).is_err() {
            // Node is gone.
            return;
        }
    }
}

fn connect(node_id: u32, peer: u32, addr: &str) -> BufWriter<TcpStream> {
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                info!(target: "dimex::net", node = node_id, peer, addr, "Connected");
                return BufWriter::new(stream);
            }
            Err(e) => {
                debug!(target: "dimex::net", node = node_id, peer, addr, error = %e, "Connect failed, retrying");
                thread::sleep(CONNECT_RETRY);
            }
        }
    }
}

fn write_line(writer: &mut BufWriter<TcpStream>, body: &str) -> io::Result<()> {
    writer.write_all(body.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}

fn writer_loop(node_id: u32, peer: u32, addr: String, rx: Receiver<String>) {
    let mut writer: Option<BufWriter<TcpStream>> = None;

    // Ends when the link is dropped and the queue drains.
    while let Ok(body) = rx.recv() {
        loop {
            let w = writer.get_or_insert_with(|| connect(node_id, peer, &addr));
            match write_line(w, &body) {
                Ok(()) => break,
                Err(e) => {
                    warn!(target: "dimex::net", node = node_id, peer, error = %e, "Write failed, reconnecting");
                    writer = None;
                }
            }
        }
    }
}
