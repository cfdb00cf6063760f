//! Console sessions over standard input and the control socket.

use super::commands::{CommandContext, build_dispatcher};
use super::grammar::{DispatchError, Dispatcher, Privilege, Reply};
use crate::engine::ProxyEngine;
use crate::state::Shutdown;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const BANNER: &str = "quarry management console\nRun `help` for commands.\n";

/// A command dispatcher bound to the running engine.
#[derive(Clone)]
pub struct Console {
    dispatcher: Arc<Dispatcher<CommandContext>>,
    engine: ProxyEngine,
    shutdown: Shutdown,
}

impl Console {
    pub fn new(engine: ProxyEngine, shutdown: Shutdown) -> Self {
        Self {
            dispatcher: Arc::new(build_dispatcher()),
            engine,
            shutdown,
        }
    }

    pub fn context(&self, privilege: Privilege) -> CommandContext {
        CommandContext {
            engine: self.engine.clone(),
            shutdown: self.shutdown.clone(),
            dispatcher: self.dispatcher.clone(),
            privilege,
        }
    }

    /// Run one command line.
    pub async fn execute(&self, line: &str, privilege: Privilege) -> Result<Reply, DispatchError> {
        self.dispatcher
            .execute(line, self.context(privilege), privilege)
            .await
    }

    /// Read commands line by line until EOF, `exit`, or server shutdown.
    pub async fn run_session<R, W>(
        &self,
        reader: R,
        mut writer: W,
        privilege: Privilege,
    ) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        writer.write_all(BANNER.as_bytes()).await?;

        loop {
            writer
                .write_all(format!("[{privilege}@quarry] $ ").as_bytes())
                .await?;
            writer.flush().await?;

            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = self.shutdown.wait() => break,
            };
            let Some(line) = line else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            debug!(command = line, %privilege, "Console command");
            let (output, close) = match self.execute(line, privilege).await {
                Ok(reply) => (reply.text, reply.close),
                Err(DispatchError::Parse(e)) => (e.render(), false),
                Err(DispatchError::Command(e)) => (format!("error: {e}"), false),
            };
            if !output.is_empty() {
                writer.write_all(output.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
            if close {
                break;
            }
        }

        writer.flush().await
    }

    /// Run an admin session on the process's standard streams.
    pub fn spawn_stdin(&self) -> JoinHandle<()> {
        let console = self.clone();
        tokio::spawn(async move {
            let reader = BufReader::new(tokio::io::stdin());
            if let Err(e) = console
                .run_session(reader, tokio::io::stdout(), Privilege::Admin)
                .await
            {
                warn!(error = %e, "Standard input console failed");
            }
            debug!("Standard input console closed");
        })
    }

    /// Accept control socket connections until shutdown.
    pub async fn serve_control_socket(self, listener: UnixListener, owner_uid: u32) {
        loop {
            let stream = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "Control socket accept failed");
                        continue;
                    }
                },
                _ = self.shutdown.wait() => break,
            };

            let privilege = peer_privilege(&stream, owner_uid);
            let console = self.clone();
            tokio::spawn(async move {
                let (read, write) = stream.into_split();
                if let Err(e) = console
                    .run_session(BufReader::new(read), write, privilege)
                    .await
                {
                    debug!(error = %e, "Control session ended with error");
                }
            });
        }
    }
}

fn peer_privilege(stream: &UnixStream, owner_uid: u32) -> Privilege {
    let peer = stream.peer_cred().ok().map(|cred| cred.uid());
    privilege_for(peer, owner_uid)
}

/// Root and the socket owner administer; everyone else observes.
pub fn privilege_for(peer_uid: Option<u32>, owner_uid: u32) -> Privilege {
    match peer_uid {
        Some(uid) if uid == 0 || uid == owner_uid => Privilege::Admin,
        _ => Privilege::Operator,
    }
}
