use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::Error;

/// Outcome of the helper process's single termination event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelperTermination {
    pub rc: i32,
    pub retval: i32,
    pub errno: i32,
}

/// A spawned page-level save/restore helper, communicating length-prefixed
/// messages over a pair of pipes the way the teacher's vsock protocol
/// length-prefixes submissions. Modeled as a trait so the bridge above it
/// can be driven against an in-memory fake in tests.
#[async_trait]
pub trait SaveHelperProcess: Send {
    async fn send(&mut self, msg: &[u8]) -> Result<(), Error>;
    async fn recv(&mut self) -> Result<Vec<u8>, Error>;

    /// Block until the helper reports its single termination event.
    async fn wait(&mut self) -> Result<HelperTermination, Error>;

    /// Forcibly stop the helper; idempotent.
    async fn kill(&mut self);
}

/// Length-prefixed send over an `AsyncWrite`, mirroring the teacher's
/// `protocol::send_data`.
async fn send_framed<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &[u8],
) -> Result<(), std::io::Error> {
    writer.write_u32_le(msg.len() as u32).await?;
    writer.write_all(msg).await?;
    Ok(())
}

/// Length-prefixed receive, mirroring `protocol::receive_data`.
async fn recv_framed<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>, std::io::Error> {
    let len = reader.read_u32_le().await?;
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// A real helper process, spawned with its stdin/stdout wired to pipes.
pub struct SpawnedSaveHelper {
    helper_binary: PathBuf,
    args: Vec<String>,
    process: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
}

impl SpawnedSaveHelper {
    pub fn new(helper_binary: impl Into<PathBuf>, args: Vec<String>) -> Self {
        SpawnedSaveHelper {
            helper_binary: helper_binary.into(),
            args,
            process: None,
            stdin: None,
            stdout: None,
        }
    }

    pub async fn start(&mut self) -> Result<(), Error> {
        let mut child = Command::new(&self.helper_binary)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        self.stdin = child.stdin.take();
        self.stdout = child.stdout.take();
        self.process = Some(child);
        Ok(())
    }
}

#[async_trait]
impl SaveHelperProcess for SpawnedSaveHelper {
    async fn send(&mut self, msg: &[u8]) -> Result<(), Error> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or(Error::InvalidState("helper stdin not open"))?;
        send_framed(stdin, msg).await.map_err(Error::Process)
    }

    async fn recv(&mut self) -> Result<Vec<u8>, Error> {
        let stdout = self
            .stdout
            .as_mut()
            .ok_or(Error::InvalidState("helper stdout not open"))?;
        recv_framed(stdout).await.map_err(Error::Process)
    }

    async fn wait(&mut self) -> Result<HelperTermination, Error> {
        let process = self
            .process
            .as_mut()
            .ok_or(Error::InvalidState("helper not started"))?;
        let status = process.wait().await.map_err(Error::Process)?;
        Ok(HelperTermination {
            rc: status.code().unwrap_or(-1),
            retval: 0,
            errno: 0,
        })
    }

    async fn kill(&mut self) {
        if let Some(mut process) = self.process.take() {
            let _ = process.kill().await;
        }
    }
}

impl Drop for SpawnedSaveHelper {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.take() {
            let _ = process.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory fake used to unit test `SaveHelperBridge` without
    /// spawning a real process.
    pub struct FakeSaveHelper {
        pub sent: Vec<Vec<u8>>,
        pub to_recv: VecDeque<Vec<u8>>,
        pub termination: Option<HelperTermination>,
    }

    #[async_trait]
    impl SaveHelperProcess for FakeSaveHelper {
        async fn send(&mut self, msg: &[u8]) -> Result<(), Error> {
            self.sent.push(msg.to_vec());
            Ok(())
        }

        async fn recv(&mut self) -> Result<Vec<u8>, Error> {
            self.to_recv
                .pop_front()
                .ok_or(Error::PeerGone("fake helper exhausted"))
        }

        async fn wait(&mut self) -> Result<HelperTermination, Error> {
            self.termination
                .ok_or(Error::InvalidState("fake helper has no termination queued"))
        }

        async fn kill(&mut self) {}
    }

    #[tokio::test]
    async fn fake_helper_replays_queued_messages() {
        let mut fake = FakeSaveHelper {
            sent: Vec::new(),
            to_recv: VecDeque::from(vec![vec![1, 2, 3]]),
            termination: Some(HelperTermination {
                rc: 0,
                retval: 0,
                errno: 0,
            }),
        };
        fake.send(&[9]).await.unwrap();
        assert_eq!(fake.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(fake.sent, vec![vec![9]]);
    }
}
