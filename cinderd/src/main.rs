// cinderd is a cinder daemon serving zero-knowledge file exchanges.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

mod error;
use error::*;

use cinder_common::config::NodeConfig;
use cinder_common::flow::{Exchange, FlowPolicy};
use cinder_common::gate::QuizGate;
use cinder_common::message::{ClientMessage, ServerMessage};
use cinder_common::store::{
    FsFileRepository, FsFileStore, MemoryLimitStore, MemorySessionCache, SystemClock,
};
use cinder_common::{FlowError, PublicError};

use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{process, thread};

use clap::Parser;

/// Default TCP server port. Not officially reserved.
/// 629 is the sum of the ASCII codes for `cinder` and an offset
/// to the 20000 port range.
const DEFAULT_PORT: u16 = 20629;

/// TCP accept poll interval, also used for shutdown checks.
const READ_TIMEOUT: Duration = Duration::from_millis(200);
/// Per-connection read timeout. Idle clients are disconnected.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
/// Background process serving the cinder exchange protocol.
struct Args {
    /// Path of the node configuration file.
    #[arg(short, long, default_value = NodeConfig::PATH)]
    config: PathBuf,
}

fn main() {
    let args = Args::parse();

    match serve(&args) {
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn serve(args: &Args) -> Result<()> {
    let should_exit = Arc::new(AtomicBool::new(false));
    let should_exit2 = Arc::clone(&should_exit);

    ctrlc::set_handler(move || {
        eprintln!("[info] Caught SIGINT, SIGTERM or SIGHUP, exiting");
        should_exit2.store(true, Ordering::SeqCst);
    })?;

    let mut config = NodeConfig::load_from(&args.config)?;

    let vault = Arc::new(config.take_vault()?);
    if !vault.has_successor() {
        eprintln!(
            "[warn] No successor of pepper version {} is staged for rotation",
            vault.active_version()
        );
    }

    let clock = Arc::new(SystemClock);
    let sessions = Arc::new(MemorySessionCache::new(clock.clone()));
    let limits = Arc::new(MemoryLimitStore::new(clock.clone()));
    let repo: Arc<FsFileRepository<QuizGate>> =
        Arc::new(FsFileRepository::new(config.data_dir.join("records"))?);
    let blobs = Arc::new(FsFileStore::new(config.data_dir.join("blobs"))?);

    let exchange = Arc::new(Exchange::new(
        vault,
        sessions,
        limits,
        repo,
        blobs,
        clock,
        FlowPolicy::from_config(&config),
    ));

    let cleanup_interval = Duration::from_secs(config.cleanup_interval_secs.max(1) as u64);
    let sweeper = {
        let exchange = Arc::clone(&exchange);
        let should_exit = Arc::clone(&should_exit);

        thread::spawn(move || {
            let mut elapsed = Duration::ZERO;

            while !should_exit.load(Ordering::SeqCst) {
                thread::sleep(READ_TIMEOUT);
                elapsed += READ_TIMEOUT;

                if elapsed >= cleanup_interval {
                    elapsed = Duration::ZERO;

                    match exchange.cleanup_expired() {
                        Ok(0) => {}
                        Ok(n) => eprintln!("[info] Swept {} expired exchanges", n),
                        Err(e) => eprintln!("[warn] Cleanup sweep failed: {}", e),
                    }
                }
            }
        })
    };

    let client_threads = Arc::new(Mutex::new(0));

    let bind_addr = config.bind_addr.unwrap_or(SocketAddr::new(
        IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        DEFAULT_PORT,
    ));

    let listener = TcpListener::bind(bind_addr)?;

    listener.set_nonblocking(true)?;

    eprintln!("[info] <{}> Listening", bind_addr);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let peer_addr = stream.peer_addr()?;

                *client_threads.lock().unwrap() += 1;

                let exchange = Arc::clone(&exchange);
                let client_threads = Arc::clone(&client_threads);
                thread::spawn(move || {
                    match handle_client(&exchange, stream) {
                        Ok(_) => {
                            eprintln!("[info] <{}> Disconnected", peer_addr)
                        }
                        Err(e) => {
                            eprintln!("[warn] <{}> Cannot handle client: {}", peer_addr, e)
                        }
                    }

                    *client_threads.lock().unwrap() -= 1;
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if should_exit.load(Ordering::SeqCst) {
                    break;
                } else {
                    thread::sleep(READ_TIMEOUT);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    // Wipe order: peppers go last. The vault drops (and wipes) only
    // after every in-flight seal or unseal has finished.
    while *client_threads.lock().unwrap() > 0 {
        thread::sleep(READ_TIMEOUT);
    }
    sweeper.join().ok();

    Ok(())
}

fn handle_client(exchange: &Exchange<QuizGate>, stream: TcpStream) -> Result<()> {
    let peer_addr = stream.peer_addr()?;

    stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;

    loop {
        let message: ClientMessage<QuizGate> = match bincode::deserialize_from(&stream) {
            Ok(message) => message,
            Err(e) => match *e {
                bincode::ErrorKind::Io(io_err)
                    if io_err.kind() == io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(())
                }
                bincode::ErrorKind::Io(io_err)
                    if io_err.kind() == io::ErrorKind::WouldBlock
                        || io_err.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(())
                }
                _ => return Err(FlowError::Record(e).into()),
            },
        };

        let response = dispatch(exchange, peer_addr, message);
        bincode::serialize_into(&stream, &response).map_err(FlowError::Record)?;
    }
}

fn dispatch(
    exchange: &Exchange<QuizGate>,
    peer_addr: SocketAddr,
    message: ClientMessage<QuizGate>,
) -> ServerMessage<QuizGate> {
    match message {
        ClientMessage::InitUpload => match exchange.init_upload() {
            Ok(handshake) => {
                eprintln!(
                    "[info] <{}> Upload session {} opened",
                    peer_addr, handshake.session_id
                );
                ServerMessage::UploadSession(Ok(handshake))
            }
            Err(e) => {
                eprintln!("[warn] <{}> Init upload failed: {}", peer_addr, e);
                ServerMessage::UploadSession(Err(PublicError::from(&e)))
            }
        },
        ClientMessage::Upload(request) => match exchange.upload(&request) {
            Ok(receipt) => {
                eprintln!(
                    "[info] <{}> Exchange {} published, expires {}",
                    peer_addr, receipt.link_id, receipt.expiry_date
                );
                ServerMessage::UploadReceipt(Ok(receipt))
            }
            Err(e) => {
                eprintln!("[warn] <{}> Upload failed: {}", peer_addr, e);
                ServerMessage::UploadReceipt(Err(PublicError::from(&e)))
            }
        },
        ClientMessage::InitDownload(link_id) => match exchange.init_download(&link_id) {
            Ok(handshake) => {
                eprintln!(
                    "[info] <{}> Download session {} opened for {}",
                    peer_addr, handshake.session_id, link_id
                );
                ServerMessage::DownloadSession(Ok(handshake))
            }
            Err(e) => {
                eprintln!(
                    "[warn] <{}> Init download for {} failed: {}",
                    peer_addr, link_id, e
                );
                ServerMessage::DownloadSession(Err(PublicError::from(&e)))
            }
        },
        ClientMessage::Verify(request) => {
            let session_id = request.session_id.clone();

            match exchange.verify_download(&request) {
                Ok(payload) => {
                    eprintln!(
                        "[info] <{}> Session {} verified, payload delivered",
                        peer_addr, session_id
                    );
                    ServerMessage::Payload(Ok(payload))
                }
                Err(e) => {
                    eprintln!(
                        "[warn] <{}> Verify on session {} failed: {}",
                        peer_addr, session_id, e
                    );
                    ServerMessage::Payload(Err(PublicError::from(&e)))
                }
            }
        }
        ClientMessage::Acknowledge(session_id) => match exchange.acknowledge(&session_id) {
            Ok(()) => {
                eprintln!(
                    "[info] <{}> Session {} acknowledged, exchange burned",
                    peer_addr, session_id
                );
                ServerMessage::Acknowledged(Ok(()))
            }
            Err(e) => {
                eprintln!(
                    "[warn] <{}> Acknowledge on session {} failed: {}",
                    peer_addr, session_id, e
                );
                ServerMessage::Acknowledged(Err(PublicError::from(&e)))
            }
        },
    }
}
