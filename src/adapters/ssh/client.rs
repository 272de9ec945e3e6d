//! russh client plumbing
//!
//! Connecting, authenticating, and running one command over a session
//! channel. The pool owns the resulting handles; everything here is
//! stateless.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::ChannelMsg;
use tracing::debug;

use crate::command::SshOptions;
use crate::error::{Error, Result};
use crate::stream::OutputCollector;

/// Client-side handler. Host-key verification is accepted for every key:
/// targets come from the caller's own resolved configuration, and the
/// known-hosts policy belongs to the layer that resolves targets.
pub struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Open and authenticate one connection.
pub async fn connect(opts: &SshOptions) -> Result<Handle<ClientHandler>> {
    let config = Arc::new(client::Config::default());

    let mut handle =
        client::connect(config, (opts.host.as_str(), opts.port), ClientHandler)
            .await
            .map_err(|e| Error::Connection {
                host: opts.host.clone(),
                reason: e.to_string(),
            })?;

    let authenticated = if let Some(password) = &opts.password {
        handle
            .authenticate_password(&opts.username, password)
            .await
            .map_err(|e| auth_error(&opts.host, e))?
    } else if let Some(key) = &opts.private_key {
        let pair = russh_keys::decode_secret_key(key, opts.passphrase.as_deref())
            .map_err(|e| Error::Connection {
                host: opts.host.clone(),
                reason: format!("private key rejected: {}", e),
            })?;
        handle
            .authenticate_publickey(&opts.username, Arc::new(pair))
            .await
            .map_err(|e| auth_error(&opts.host, e))?
    } else {
        return Err(Error::Connection {
            host: opts.host.clone(),
            reason: "no authentication method configured".to_string(),
        });
    };

    if !authenticated {
        return Err(Error::Connection {
            host: opts.host.clone(),
            reason: format!("authentication failed for user {}", opts.username),
        });
    }

    debug!(host = %opts.host, port = opts.port, "ssh connection established");
    Ok(handle)
}

fn auth_error(host: &str, e: russh::Error) -> Error {
    Error::Connection {
        host: host.to_string(),
        reason: format!("authentication error: {}", e),
    }
}

/// Outcome of one channel execution.
pub struct ChannelExit {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code reported by the remote; `-1` when the connection closed
    /// under the command without reporting one.
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

/// Run one command string over a fresh session channel on `handle`.
pub async fn exec(
    handle: &Handle<ClientHandler>,
    command: &str,
    stdin: Option<&[u8]>,
    mut stdout: OutputCollector,
    mut stderr: OutputCollector,
) -> Result<ChannelExit> {
    let mut channel = handle.channel_open_session().await?;
    channel.exec(true, command).await?;

    if let Some(payload) = stdin {
        channel.data(payload).await?;
        channel.eof().await?;
    }

    let mut exit_code: Option<i32> = None;
    let mut signal: Option<String> = None;
    let mut saw_status = false;

    loop {
        let Some(msg) = channel.wait().await else {
            break;
        };
        match msg {
            ChannelMsg::Data { data } => {
                stdout
                    .push(&data)
                    .map_err(|e| Error::adapter("ssh", e.to_string()))?;
            }
            ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                stderr
                    .push(&data)
                    .map_err(|e| Error::adapter("ssh", e.to_string()))?;
            }
            ChannelMsg::ExitStatus { exit_status } => {
                exit_code = Some(exit_status as i32);
                saw_status = true;
            }
            ChannelMsg::ExitSignal { signal_name, .. } => {
                signal = Some(sig_name(&signal_name));
                saw_status = true;
            }
            // Flow-control and status messages carry nothing we record.
            _ => {}
        }
    }

    // Connection closed under the command: synthesize -1 per the exit
    // code taxonomy.
    if !saw_status {
        exit_code = Some(-1);
    }

    Ok(ChannelExit {
        stdout: stdout.finish(),
        stderr: stderr.finish(),
        exit_code,
        signal,
    })
}

// SSH carries RFC 4254 signal names without the SIG prefix; the enum's
// debug form is exactly that name.
fn sig_name(sig: &russh::Sig) -> String {
    match sig {
        russh::Sig::Custom(name) => format!("SIG{}", name),
        other => format!("SIG{:?}", other),
    }
}

/// Run a lightweight no-op on the connection to confirm liveness.
pub async fn keepalive_probe(handle: &Handle<ClientHandler>) -> Result<()> {
    let exit = exec(
        handle,
        "true",
        None,
        OutputCollector::new(),
        OutputCollector::new(),
    )
    .await?;
    if exit.exit_code == Some(0) {
        Ok(())
    } else {
        Err(Error::adapter("ssh", "keepalive probe failed"))
    }
}
