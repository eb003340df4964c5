//! Unix socket export of the frequency report
//!
//! Every client that connects to the socket receives the report that is
//! published at connection time, after which the connection is closed. This
//! makes the report readable with e.g. `socat - UNIX-CONNECT:/run/freqmon.sock`.

use crate::{
    error::{Error, Result},
    report::ReportEndpoint,
};

use async_std::{
    channel,
    io::WriteExt,
    os::unix::net::{UnixListener, UnixStream},
    task,
};

use futures_util::{
    future::{select, Either},
    pin_mut,
};

use slog::{debug, info, warn, Logger};

use std::{
    fs, io,
    os::unix::fs::FileTypeExt,
    path::{Path, PathBuf},
};

/// Size of the chunks in which the report is sent to clients
const CHUNK_SIZE: usize = 4096;

/// Server exposing the frequency report on a Unix socket
pub struct SocketServer {
    /// Path of the socket
    path: PathBuf,

    /// Dropping this tells the accept loop to stop
    stop: channel::Sender<()>,

    /// Accept loop
    task: task::JoinHandle<()>,
}

impl SocketServer {
    /// Install the report endpoint at `path`
    ///
    /// A leftover socket from a previous run is replaced, but any other kind
    /// of file at that path makes the installation fail.
    ///
    pub async fn bind(
        path: impl AsRef<Path>,
        endpoint: ReportEndpoint,
        log: Logger,
    ) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let registration_error = |source: io::Error| Error::EndpointRegistration {
            path: path.clone(),
            source,
        };

        match fs::symlink_metadata(&path) {
            Ok(metadata) if metadata.file_type().is_socket() => {
                warn!(log, "Replacing leftover report socket"; "path" => %path.display());
                fs::remove_file(&path).map_err(registration_error)?;
            }
            Ok(_) => {
                return Err(registration_error(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "path exists and is not a socket",
                )))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(registration_error(err)),
        }
        let listener = UnixListener::bind(async_std::path::Path::new(&path))
            .await
            .map_err(registration_error)?;
        info!(log, "Serving frequency report"; "socket" => %path.display());

        let (stop, stop_signal) = channel::bounded(1);
        let task = task::spawn(accept_loop(listener, endpoint, stop_signal, log));
        Ok(Self { path, stop, task })
    }

    /// Path of the socket
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop serving the report and remove the socket
    pub async fn stop(self, log: &Logger) {
        self.stop.close();
        self.task.await;
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(log, "Failed to remove report socket";
                  "socket" => %self.path.display(),
                  "error" => %err);
        }
    }
}

/// Accept clients until told to stop
async fn accept_loop(
    listener: UnixListener,
    endpoint: ReportEndpoint,
    stop_signal: channel::Receiver<()>,
    log: Logger,
) {
    loop {
        let accept = listener.accept();
        let stop = stop_signal.recv();
        pin_mut!(accept, stop);
        match select(accept, stop).await {
            Either::Left((Ok((stream, _addr)), _)) => {
                task::spawn(send_report(stream, endpoint.clone(), log.clone()));
            }
            Either::Left((Err(err), _)) => {
                warn!(log, "Failed to accept report client"; "error" => %err);
            }
            Either::Right(_) => break,
        }
    }
}

/// Send the currently published report to a client
async fn send_report(mut stream: UnixStream, endpoint: ReportEndpoint, log: Logger) {
    let mut cursor = endpoint.open();
    let mut chunk = [0u8; CHUNK_SIZE];
    let result: io::Result<()> = async {
        loop {
            let len = io::Read::read(&mut cursor, &mut chunk)?;
            if len == 0 {
                break;
            }
            stream.write_all(&chunk[..len]).await?;
        }
        stream.flush().await
    }
    .await;
    if let Err(err) = result {
        debug!(log, "Failed to send report to client"; "error" => %err);
    }
}
