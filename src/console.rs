//! Console tunnel: relays a caller's connection to a VM's serial console.
//!
//! ```text
//! caller ──(upgraded HTTP connection)──► ConsoleTunnel ──TCP──► 127.0.0.1:<console>
//! ```
//!
//! The relay is best-effort, like a physical serial line: bytes are read in
//! chunks of at most [`CHUNK_SIZE`] from whichever side is ready and written
//! to the other side once. There is no retry, no buffering beyond one chunk
//! per direction, and no error payload once the stream has started. The
//! tunnel ends as soon as either side closes or errors.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::vm::VirtualMachine;

/// Largest read forwarded in one step, per direction.
pub const CHUNK_SIZE: usize = 1024;

/// Which side ended the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelEnd {
    /// The caller closed its side (EOF).
    CallerClosed,
    /// The console server closed the socket (EOF).
    ConsoleClosed,
    /// A read or write failed on either side.
    IoError,
}

/// Totals reported when a tunnel ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelSummary {
    /// Bytes forwarded caller → console.
    pub to_console: u64,
    /// Bytes forwarded console → caller.
    pub to_caller: u64,
    pub end: TunnelEnd,
}

/// An open connection to one VM's console, ready to be relayed.
pub struct ConsoleTunnel {
    vm: String,
    port: u16,
    console: TcpStream,
}

impl ConsoleTunnel {
    /// Check that `vm` is running and connect to its console port.
    ///
    /// Both checks happen before the caller's connection is touched, so a
    /// failure can still be reported as an ordinary error response.
    pub async fn open(vm: &dyn VirtualMachine) -> RegistryResult<Self> {
        let state = vm.state().await;
        if !state.is_running() {
            return Err(RegistryError::Unavailable {
                name: vm.name().to_string(),
                state: state.to_string(),
            });
        }

        let port = vm.config().await.console;
        let console = TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(|source| RegistryError::ConnectError {
                name: vm.name().to_string(),
                port,
                source,
            })?;

        debug!(vm = vm.name(), port, "console socket connected");
        Ok(Self {
            vm: vm.name().to_string(),
            port,
            console,
        })
    }

    /// Console port this tunnel is connected to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Relay bytes between `inbound` and the console until either side
    /// closes or fails. The console socket is shut down and dropped on
    /// every exit path.
    pub async fn run<S>(self, inbound: S) -> TunnelSummary
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Self { vm, port, mut console } = self;
        let (mut caller_rx, mut caller_tx) = tokio::io::split(inbound);
        let mut from_caller = [0u8; CHUNK_SIZE];
        let mut from_console = [0u8; CHUNK_SIZE];
        let mut to_console = 0u64;
        let mut to_caller = 0u64;

        let end = {
            let (mut console_rx, mut console_tx) = console.split();
            loop {
                tokio::select! {
                    read = caller_rx.read(&mut from_caller) => match read {
                        Ok(0) => break TunnelEnd::CallerClosed,
                        Ok(n) => {
                            if let Err(e) = console_tx.write_all(&from_caller[..n]).await {
                                warn!(vm = %vm, error = %e, "console write failed");
                                break TunnelEnd::IoError;
                            }
                            to_console += n as u64;
                        }
                        Err(e) => {
                            debug!(vm = %vm, error = %e, "caller read failed");
                            break TunnelEnd::IoError;
                        }
                    },
                    read = console_rx.read(&mut from_console) => match read {
                        Ok(0) => break TunnelEnd::ConsoleClosed,
                        Ok(n) => {
                            let sent = match caller_tx.write_all(&from_console[..n]).await {
                                Ok(()) => caller_tx.flush().await,
                                Err(e) => Err(e),
                            };
                            if let Err(e) = sent {
                                debug!(vm = %vm, error = %e, "caller write failed");
                                break TunnelEnd::IoError;
                            }
                            to_caller += n as u64;
                        }
                        Err(e) => {
                            warn!(vm = %vm, error = %e, "console read failed");
                            break TunnelEnd::IoError;
                        }
                    },
                }
            }
        };

        if let Err(e) = console.shutdown().await {
            debug!(vm = %vm, error = %e, "console shutdown");
        }
        drop(console);
        let _ = caller_tx.shutdown().await;

        info!(vm = %vm, port, to_console, to_caller, end = ?end, "console tunnel closed");
        TunnelSummary {
            to_console,
            to_caller,
            end,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
