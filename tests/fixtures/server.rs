//! A scripted in-process server speaking the client's wire protocol.
//!
//! Connections are handled one at a time; the test supplies a handler that
//! reacts to each decoded inbound packet and may send packets, raw bytes,
//! or drop the connection.

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::thread;

use tailstore::client::command::MessageKind;
use tailstore::client::frame::{FrameReader, FrameWriter, MAX_FRAME_BYTES};
use tailstore::client::packet::{Packet, decode_packet, encode_packet};

/// What the handler wants done after a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    Continue,
    /// Drop the current connection; the server goes back to accepting.
    Close,
}

pub struct ServerConn {
    writer: FrameWriter<TcpStream>,
    raw: TcpStream,
}

impl ServerConn {
    pub fn send(&mut self, packet: &Packet) {
        let bytes = encode_packet(packet);
        self.writer.write_frame(&bytes).expect("server write");
    }

    pub fn send_msg(&mut self, kind: MessageKind, correlation: uuid::Uuid, payload: Vec<u8>) {
        self.send(&Packet::new(kind, correlation, payload));
    }

    /// Answer a heartbeat probe; most handlers call this from their default
    /// arm, a liveness test omits it to starve the client.
    pub fn ack_heartbeat(&mut self, packet: &Packet) {
        if packet.kind == MessageKind::HeartbeatRequest {
            self.send(&Packet::heartbeat_response(packet.correlation));
        }
    }

    /// Write bytes straight to the socket, bypassing framing sanity.
    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.raw.write_all(bytes).expect("server raw write");
        self.raw.flush().expect("server raw flush");
    }
}

pub struct ServerHandle {
    pub addr: String,
}

/// Spawn a server; the handler receives `(connection_index, packet, conn)`.
pub fn spawn<H>(mut handler: H) -> ServerHandle
where
    H: FnMut(usize, Packet, &mut ServerConn) -> Control + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind fixture server");
    let addr = listener.local_addr().expect("local addr").to_string();

    thread::spawn(move || {
        for (index, stream) in listener.incoming().enumerate() {
            let Ok(stream) = stream else {
                return;
            };
            let Ok(reader_stream) = stream.try_clone() else {
                continue;
            };
            let Ok(writer_stream) = stream.try_clone() else {
                continue;
            };
            let mut conn = ServerConn {
                writer: FrameWriter::new(writer_stream, MAX_FRAME_BYTES),
                raw: stream,
            };
            let mut reader = FrameReader::new(reader_stream, MAX_FRAME_BYTES);
            loop {
                match reader.read_next() {
                    Ok(Some(frame)) => {
                        let Ok(packet) = decode_packet(&frame) else {
                            break;
                        };
                        match handler(index, packet, &mut conn) {
                            Control::Continue => {}
                            Control::Close => break,
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        }
    });

    ServerHandle { addr }
}
