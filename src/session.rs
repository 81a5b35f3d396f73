//! Interactive shell driver for the management endpoint.
//!
//! The network controller is managed through its interactive SSH shell:
//! open a channel, wait until the shell prompt appears, then type each
//! command and give the remote side a fixed settle interval to produce
//! output. There is no structured framing on the byte stream, so both
//! shell readiness and in-band password re-prompts are detected by
//! pattern matching on the accumulated output. The rules live behind
//! [`PromptMatcher`] so they can be swapped and tested without sockets.
//!
//! The driver has no concept of per-command success or failure beyond the
//! password re-prompt pattern; a command producing unexpected output is
//! not detected here.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from the remote session transport.
#[derive(Error, Debug)]
pub enum SessionError {
    /// TCP connect failed or timed out.
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    /// SSH handshake or channel operation failed.
    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),

    /// Authentication was rejected.
    #[error("authentication failed for user '{0}'")]
    Auth(String),

    /// Read/write on the shell channel failed.
    #[error("channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The remote shell never presented a recognizable prompt.
    #[error("shell not ready after {0:?}")]
    ShellNotReady(Duration),

    /// The background session task aborted.
    #[error("session task aborted: {0}")]
    Aborted(String),
}

/// How to authenticate the SSH session.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// Password authentication using the credential's password component.
    Password,
    /// Private key authentication, password fallback when the key is
    /// rejected and a password is available.
    Key {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

/// Credential for the management endpoint.
///
/// The password component, when present, is also the answer to in-band
/// password re-prompts raised by commands such as `sudo`.
#[derive(Debug, Clone)]
pub struct SshCredential {
    pub username: String,
    pub method: AuthMethod,
    pub password: Option<String>,
}

/// Detection rules for the prompt heuristics.
///
/// These are best-effort readiness gates, inherently fragile against
/// arbitrary remote prompt customization.
pub trait PromptMatcher: Send + Sync {
    /// Does the accumulated output end in a shell-ready marker?
    fn shell_ready(&self, output: &str) -> bool;

    /// Does this output chunk look like an in-band password prompt?
    fn password_prompt(&self, chunk: &str) -> bool;
}

/// Default rules: `#`/`$` trailing markers for readiness, a chunk that
/// mentions "password" and ends in `:` for re-prompts.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardPrompts;

impl PromptMatcher for StandardPrompts {
    fn shell_ready(&self, output: &str) -> bool {
        matches!(output.trim_end().chars().last(), Some('#' | '$'))
    }

    fn password_prompt(&self, chunk: &str) -> bool {
        chunk.to_ascii_lowercase().contains("password") && chunk.trim_end().ends_with(':')
    }
}

/// One line-oriented byte stream to a remote shell.
///
/// Implemented for [`ssh2::Channel`]; tests drive the protocol through a
/// scripted fake instead.
pub trait ShellStream {
    /// Send one line of input, newline appended.
    fn send_line(&mut self, line: &str) -> Result<(), SessionError>;

    /// Read up to `max` bytes of whatever output is currently available.
    fn read_chunk(&mut self, max: usize) -> Result<String, SessionError>;
}

impl ShellStream for ssh2::Channel {
    fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        self.write_all(line.as_bytes())?;
        self.write_all(b"\n")?;
        self.flush()?;
        Ok(())
    }

    fn read_chunk(&mut self, max: usize) -> Result<String, SessionError> {
        let mut buf = vec![0u8; max];
        let n = self.read(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf[..n]).to_string())
    }
}

/// Read until the prompt rules report the shell ready for input.
///
/// # Errors
/// Returns [`SessionError::ShellNotReady`] when `deadline` elapses first.
pub fn await_shell_ready<S: ShellStream>(
    stream: &mut S,
    prompts: &dyn PromptMatcher,
    poll: Duration,
    deadline: Duration,
    buf_size: usize,
) -> Result<(), SessionError> {
    let start = Instant::now();
    let mut seen = String::new();

    loop {
        let chunk = stream.read_chunk(buf_size)?;
        seen.push_str(&chunk);

        if prompts.shell_ready(&seen) {
            debug!("remote shell ready");
            return Ok(());
        }

        if start.elapsed() > deadline {
            return Err(SessionError::ShellNotReady(deadline));
        }

        std::thread::sleep(poll);
    }
}

/// Type each command into the shell in order.
///
/// After sending a command the remote side gets a fixed `settle` interval
/// to produce output, then one buffer is read. When that output matches
/// the password re-prompt rule, the password is sent and one more buffer
/// is read. Output is logged, never validated.
pub fn run_commands<S: ShellStream>(
    stream: &mut S,
    prompts: &dyn PromptMatcher,
    commands: &[String],
    password: Option<&str>,
    settle: Duration,
    buf_size: usize,
) -> Result<(), SessionError> {
    for command in commands {
        debug!(command = %command, "sending shell command");
        stream.send_line(command)?;
        std::thread::sleep(settle);

        let output = stream.read_chunk(buf_size)?;
        debug!(output = %output, "shell output");

        if prompts.password_prompt(&output) {
            match password {
                Some(password) => {
                    debug!("answering in-band password prompt");
                    stream.send_line(password)?;
                    let after = stream.read_chunk(buf_size)?;
                    debug!(output = %after, "shell output after password");
                }
                None => warn!("in-band password prompt but no password configured"),
            }
        }
    }

    Ok(())
}

/// Anything that can run one ordered batch of shell commands on the
/// management endpoint. The blocking call owns its connection for the
/// duration of the batch.
pub trait SessionRunner: Send + Sync {
    /// Open a session, run the batch, close the session.
    ///
    /// # Errors
    /// Returns a [`SessionError`] on connect, auth, or transport failure.
    fn run_batch(&self, commands: &[String]) -> Result<(), SessionError>;
}

/// SSH-backed session driver. One instance per configured endpoint;
/// each `run_batch` call opens and closes its own connection.
pub struct SessionDriver {
    endpoint: String,
    credential: SshCredential,
    session_timeout: Duration,
    login_wait: Duration,
    shell_wait: Duration,
    buf_size: usize,
    prompts: Arc<dyn PromptMatcher>,
}

impl SessionDriver {
    /// Create a driver for `endpoint` (`host:port`).
    #[must_use]
    pub fn new(
        endpoint: String,
        credential: SshCredential,
        session_timeout: Duration,
        login_wait: Duration,
        shell_wait: Duration,
        buf_size: usize,
    ) -> Self {
        Self {
            endpoint,
            credential,
            session_timeout,
            login_wait,
            shell_wait,
            buf_size,
            prompts: Arc::new(StandardPrompts),
        }
    }

    /// Swap the prompt detection rules.
    #[must_use]
    pub fn with_prompts(mut self, prompts: Arc<dyn PromptMatcher>) -> Self {
        self.prompts = prompts;
        self
    }

    fn connect(&self) -> Result<ssh2::Session, SessionError> {
        let addr = self
            .endpoint
            .to_socket_addrs()
            .map_err(SessionError::Connect)?
            .next()
            .ok_or_else(|| {
                SessionError::Connect(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("endpoint '{}' did not resolve", self.endpoint),
                ))
            })?;

        let tcp = TcpStream::connect_timeout(&addr, self.session_timeout)
            .map_err(SessionError::Connect)?;

        let mut session = ssh2::Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(
            u32::try_from(self.session_timeout.as_millis()).unwrap_or(u32::MAX),
        );
        session.handshake()?;

        self.authenticate(&session)?;
        Ok(session)
    }

    fn authenticate(&self, session: &ssh2::Session) -> Result<(), SessionError> {
        let user = &self.credential.username;

        match &self.credential.method {
            AuthMethod::Key { path, passphrase } => {
                let attempt =
                    session.userauth_pubkey_file(user, None, path, passphrase.as_deref());
                if let Err(e) = attempt {
                    // Password fallback when the key is rejected.
                    match &self.credential.password {
                        Some(password) => {
                            warn!(error = %e, "key auth failed, falling back to password");
                            session.userauth_password(user, password)?;
                        }
                        None => return Err(SessionError::Ssh(e)),
                    }
                }
            }
            AuthMethod::Password => {
                let password = self
                    .credential
                    .password
                    .as_deref()
                    .ok_or_else(|| SessionError::Auth(user.clone()))?;
                session.userauth_password(user, password)?;
            }
        }

        if session.authenticated() {
            Ok(())
        } else {
            Err(SessionError::Auth(user.clone()))
        }
    }
}

impl SessionRunner for SessionDriver {
    fn run_batch(&self, commands: &[String]) -> Result<(), SessionError> {
        info!(
            endpoint = %self.endpoint,
            count = commands.len(),
            "running remote command batch"
        );

        let session = self.connect()?;
        let mut channel = session.channel_session()?;
        channel.request_pty("xterm", None, None)?;
        channel.shell()?;

        // The channel and session close when they drop, so an early
        // return cannot leak the connection.
        let result = await_shell_ready(
            &mut channel,
            self.prompts.as_ref(),
            self.login_wait,
            self.session_timeout,
            self.buf_size,
        )
        .and_then(|()| {
            run_commands(
                &mut channel,
                self.prompts.as_ref(),
                commands,
                self.credential.password.as_deref(),
                self.shell_wait,
                self.buf_size,
            )
        });

        if let Err(e) = channel.close() {
            debug!(error = %e, "channel close failed");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted transport: pops canned reads, records writes.
    struct FakeStream {
        reads: VecDeque<String>,
        writes: Vec<String>,
    }

    impl FakeStream {
        fn new(reads: &[&str]) -> Self {
            Self {
                reads: reads.iter().map(|s| (*s).to_string()).collect(),
                writes: Vec::new(),
            }
        }
    }

    impl ShellStream for FakeStream {
        fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
            self.writes.push(line.to_string());
            Ok(())
        }

        fn read_chunk(&mut self, _max: usize) -> Result<String, SessionError> {
            Ok(self.reads.pop_front().unwrap_or_default())
        }
    }

    #[test]
    fn test_shell_ready_markers() {
        let prompts = StandardPrompts;
        assert!(prompts.shell_ready("root@netctl:~# "));
        assert!(prompts.shell_ready("user@netctl:~$"));
        assert!(prompts.shell_ready("banner\nroot@netctl:~# \n  "));
        assert!(!prompts.shell_ready("Last login: Tue"));
        assert!(!prompts.shell_ready(""));
    }

    #[test]
    fn test_password_prompt_rule() {
        let prompts = StandardPrompts;
        assert!(prompts.password_prompt("[sudo] password for root: "));
        assert!(prompts.password_prompt("Password:"));
        assert!(!prompts.password_prompt("password accepted"));
        assert!(!prompts.password_prompt("login: "));
    }

    #[test]
    fn test_await_shell_ready_accumulates_chunks() {
        // The marker arrives split across reads.
        let mut stream = FakeStream::new(&["Welcome to netctl\n", "root@netctl:~", "# "]);

        await_shell_ready(
            &mut stream,
            &StandardPrompts,
            Duration::ZERO,
            Duration::from_secs(1),
            4096,
        )
        .unwrap();
    }

    #[test]
    fn test_await_shell_ready_times_out() {
        let mut stream = FakeStream::new(&[]);

        let err = await_shell_ready(
            &mut stream,
            &StandardPrompts,
            Duration::ZERO,
            Duration::ZERO,
            4096,
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::ShellNotReady(_)));
    }

    #[test]
    fn test_commands_sent_in_order() {
        let mut stream = FakeStream::new(&["ok# ", "ok# "]);
        let commands = vec!["iptables -D ...".to_string(), "iptables -A ...".to_string()];

        run_commands(
            &mut stream,
            &StandardPrompts,
            &commands,
            Some("cluster"),
            Duration::ZERO,
            4096,
        )
        .unwrap();

        assert_eq!(stream.writes, vec!["iptables -D ...", "iptables -A ..."]);
    }

    #[test]
    fn test_password_reprompt_is_answered() {
        // First command triggers sudo's password prompt; the driver must
        // answer it and take one extra read before the next command.
        let mut stream = FakeStream::new(&[
            "[sudo] password for root: ",
            "rule deleted\nroot@netctl:~# ",
            "rule added\nroot@netctl:~# ",
        ]);
        let commands = vec!["sudo iptables -D".to_string(), "sudo iptables -A".to_string()];

        run_commands(
            &mut stream,
            &StandardPrompts,
            &commands,
            Some("cluster"),
            Duration::ZERO,
            4096,
        )
        .unwrap();

        assert_eq!(
            stream.writes,
            vec!["sudo iptables -D", "cluster", "sudo iptables -A"]
        );
        // All scripted output consumed: the answer read happened.
        assert!(stream.reads.is_empty());
    }

    #[test]
    fn test_reprompt_without_password_is_not_answered() {
        let mut stream = FakeStream::new(&["password: ", "# "]);
        let commands = vec!["sudo true".to_string()];

        run_commands(
            &mut stream,
            &StandardPrompts,
            &commands,
            None,
            Duration::ZERO,
            4096,
        )
        .unwrap();

        assert_eq!(stream.writes, vec!["sudo true"]);
    }
}
